//! Container engine error types.

use thiserror::Error;

/// Result type for container engine operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur while talking to a container engine.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// Engine auto-detection found neither runtime.
    #[error(
        "could not detect a container engine (tried docker API and `podman version`); \
         pass an explicit engine with `--engine docker` or `--engine podman`"
    )]
    EngineNotFound,

    /// An engine-side check could not be executed at all.
    ///
    /// Distinct from a check that ran and answered "no".
    #[error("failed to run `{command}`: {message}")]
    ProbeExecution { command: String, message: String },

    /// The engine command ran but failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The engine API returned an error response.
    #[error("engine API {endpoint} returned {status}: {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// Failed to parse engine output.
    #[error("failed to parse engine output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    pub(crate) fn command_failed(command: impl Into<String>, message: impl ToString) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn probe_execution(command: impl Into<String>, message: impl ToString) -> Self {
        Self::ProbeExecution {
            command: command.into(),
            message: message.to_string(),
        }
    }
}
