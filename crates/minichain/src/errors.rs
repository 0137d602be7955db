use thiserror::Error;

use crate::sandbox::SandboxError;

/// Errors that end a run. Only these ever reach the caller of `run` or `follow_up`.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Completion service failed: {0:#}")]
    Completion(anyhow::Error),

    #[error("Completion contained neither content nor a function call")]
    EmptyCompletion,

    #[error("Duplicate function name: {0}")]
    DuplicateFunction(String),

    #[error("Failed to render prompt template: {0}")]
    Template(#[from] tera::Error),

    #[error("Stopped after {0} turns without a final answer")]
    TurnLimit(usize),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Errors raised while dispatching a function call.
///
/// These never abort a run: they are rendered into a function message so the
/// model can see what went wrong and try again.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FunctionError {
    #[error("Could not decode arguments: {0}")]
    Decode(String),

    #[error("Function '{0}' does not exist")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    Backend(String),
}

impl FunctionError {
    /// Stable name of the error kind, used as the prefix of the observation text
    pub fn kind(&self) -> &'static str {
        match self {
            FunctionError::Decode(_) => "DecodeError",
            FunctionError::NotFound(_) => "DispatchLookupError",
            FunctionError::InvalidParameters(_) => "InvalidParameters",
            FunctionError::Execution(_) => "InvocationError",
            FunctionError::Backend(_) => "ToolBackendError",
        }
    }

    /// Recover the most specific kind from an error raised by a callable
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        let error = match error.downcast::<FunctionError>() {
            Ok(function_error) => return function_error,
            Err(error) => error,
        };
        match error.downcast::<SandboxError>() {
            Ok(sandbox_error) => FunctionError::Backend(sandbox_error.to_string()),
            Err(error) => FunctionError::Execution(format!("{:#}", error)),
        }
    }

    /// The text appended to history when this error is contained
    pub fn observation(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}
