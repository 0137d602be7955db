use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::base::{Completion, Provider, Usage};
use crate::cache::DiskCache;
use crate::models::message::Message;
use crate::models::tool::FunctionSchema;

/// Memoizes completions on disk, keyed by the exact request.
///
/// Useful while developing prompts and tools: replaying a conversation costs nothing until
/// the window or the function list changes.
pub struct CachedProvider<P> {
    inner: P,
    cache: DiskCache,
    namespace: String,
}

impl<P: Provider> CachedProvider<P> {
    /// `namespace` separates entries of differently configured providers, e.g. by model name
    pub fn new<S: Into<String>>(inner: P, cache: DiskCache, namespace: S) -> Self {
        Self {
            inner,
            cache,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl<P: Provider> Provider for CachedProvider<P> {
    async fn complete(
        &self,
        messages: &[Message],
        functions: &[FunctionSchema],
    ) -> Result<(Completion, Usage)> {
        let key = DiskCache::key(
            "complete",
            &json!([self.namespace]),
            &json!({"messages": messages, "functions": functions}),
        )?;
        if let Some(completion) = self.cache.load::<Completion>(&key)? {
            tracing::debug!("completion served from cache");
            return Ok((completion, Usage::default()));
        }

        let (completion, usage) = self.inner.complete(messages, functions).await?;
        self.cache.save(&key, &completion)?;
        Ok((completion, usage))
    }
}
