use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;

use crate::models::message::Message;
use crate::models::tool::FunctionSchema;
use crate::providers::base::{Completion, Provider, Usage};

/// A mock provider that returns pre-configured completions for testing
#[derive(Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<Completion>>>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Completion>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The message windows received so far, one per request
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        messages: &[Message],
        _functions: &[FunctionSchema],
    ) -> Result<(Completion, Usage)> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Err(anyhow!("no more scripted completions"))
        } else {
            Ok((responses.remove(0), Usage::default()))
        }
    }
}
