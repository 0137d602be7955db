//! Shell execution in an isolated container with a working directory that survives
//! between calls.

mod backend;
mod bash;
mod python;

pub use backend::{ContainerBackend, DockerBackend, DockerConfig, HostShellBackend};
pub use bash::{BashQuery, BashSession};
pub use python::{CodeInterpreter, CodeInterpreterQuery};

#[cfg(test)]
pub use backend::MockContainerBackend;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start container: {0}")]
    ContainerStart(String),

    #[error("Container command failed: {0}")]
    Exec(String),

    #[error("Command output is not valid UTF-8")]
    NonUtf8(#[from] std::string::FromUtf8Error),

    #[error("Expected output for {expected} commands, got {actual}")]
    MissingOutput { expected: usize, actual: usize },

    #[error("Sandbox io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SandboxResult<T> = Result<T, SandboxError>;
