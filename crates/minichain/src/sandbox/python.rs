use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use super::backend::shell_quote;
use super::bash::BashSession;
use super::SandboxResult;
use crate::function::Function;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeInterpreterQuery {
    pub code: String,
}

/// Runs python snippets through a [`BashSession`].
///
/// Each snippet is written to a uniquely named file in `host_dir`, executed from the
/// backend's view of that directory, then deleted.
pub struct CodeInterpreter {
    bash: Arc<BashSession>,
    host_dir: PathBuf,
    exec_dir: String,
    interpreter: String,
}

impl CodeInterpreter {
    /// `host_dir` is where files are written, `exec_dir` is the same directory as the
    /// backend sees it (they differ when it is bind mounted into a container)
    pub fn new<P, S>(bash: Arc<BashSession>, host_dir: P, exec_dir: S) -> Self
    where
        P: Into<PathBuf>,
        S: Into<String>,
    {
        Self {
            bash,
            host_dir: host_dir.into(),
            exec_dir: exec_dir.into(),
            interpreter: "python".to_string(),
        }
    }

    /// For backends that share the host filesystem
    pub fn on_host<P: Into<PathBuf>>(bash: Arc<BashSession>, dir: P) -> Self {
        let dir = dir.into();
        let exec_dir = dir.display().to_string();
        Self::new(bash, dir, exec_dir)
    }

    pub fn with_interpreter<S: Into<String>>(mut self, interpreter: S) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub async fn run(&self, code: &str) -> SandboxResult<String> {
        let filename = format!("{}.py", uuid::Uuid::new_v4().simple());
        let host_path = self.host_dir.join(&filename);
        tokio::fs::write(&host_path, code).await?;

        let exec_path = format!("{}/{}", self.exec_dir.trim_end_matches('/'), filename);
        let command = format!("{} {}", self.interpreter, shell_quote(&exec_path));
        let output = self.bash.run(&[command]).await;

        if let Err(e) = tokio::fs::remove_file(&host_path).await {
            warn!(path = %host_path.display(), error = %e, "failed to remove script");
        }
        output
    }

    /// Expose the interpreter as the `python` function
    pub fn function(self: &Arc<Self>) -> Function {
        let interpreter = Arc::clone(self);
        Function::structured(
            "python",
            "Create and run a temporary python file (non-interactively).",
            json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "Python code to run."
                    }
                },
                "required": ["code"]
            }),
            move |query: CodeInterpreterQuery| {
                let interpreter = Arc::clone(&interpreter);
                async move { interpreter.run(&query.code).await.map_err(anyhow::Error::from) }
            },
        )
    }
}
