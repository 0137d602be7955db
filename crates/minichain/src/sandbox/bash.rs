use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::backend::{shell_quote, ContainerBackend};
use super::{SandboxError, SandboxResult};
use crate::function::Function;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BashQuery {
    pub commands: Vec<String>,
}

/// A shell whose working directory persists across calls.
///
/// Each batch is sent to the backend as `cd <cwd>`, the caller's commands, then `pwd`.
/// The output of `pwd` becomes the directory of the next batch.
pub struct BashSession {
    backend: Arc<dyn ContainerBackend>,
    session: String,
    cwd: Mutex<String>,
}

impl BashSession {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        let cwd = backend.workdir();
        Self {
            backend,
            session: uuid::Uuid::new_v4().simple().to_string(),
            cwd: Mutex::new(cwd),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session
    }

    pub async fn cwd(&self) -> String {
        self.cwd.lock().await.clone()
    }

    /// Run a batch and return the output of the given commands only
    pub async fn run(&self, commands: &[String]) -> SandboxResult<String> {
        // held for the whole batch, so batches of one session never interleave
        let mut cwd = self.cwd.lock().await;

        let mut batch = Vec::with_capacity(commands.len() + 2);
        batch.push(format!("cd {}", shell_quote(&cwd)));
        batch.extend(commands.iter().cloned());
        batch.push("pwd".to_string());

        let outputs = self.backend.exec(&self.session, &batch).await?;
        if outputs.len() != batch.len() {
            return Err(SandboxError::MissingOutput {
                expected: batch.len(),
                actual: outputs.len(),
            });
        }

        let new_cwd = outputs[outputs.len() - 1].trim();
        if !new_cwd.is_empty() {
            debug!(session = %self.session, cwd = new_cwd, "working directory updated");
            *cwd = new_cwd.to_string();
        }
        Ok(outputs[1..outputs.len() - 1].concat())
    }

    /// Release the backend's resources for this session
    pub async fn stop(&self) -> SandboxResult<()> {
        self.backend.stop(&self.session).await
    }

    /// Expose the session as the `bash` function
    pub fn function(self: &Arc<Self>) -> Function {
        let session = Arc::clone(self);
        Function::structured(
            "bash",
            "Run bash commands. The working directory is kept between calls.",
            json!({
                "type": "object",
                "properties": {
                    "commands": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "A list of bash commands."
                    }
                },
                "required": ["commands"]
            }),
            move |query: BashQuery| {
                let session = Arc::clone(&session);
                async move { session.run(&query.commands).await.map_err(anyhow::Error::from) }
            },
        )
    }
}
