//! Failure taxonomy for network setup.
//!
//! Drivers and the probe return [`NetworkResult`] so the orchestrator can
//! decide between absorbing a failure into the retry policy and giving up
//! with `Degraded`.

use thiserror::Error;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Required OS command or service is absent. Not retried.
    #[error("required tool is missing: {tool}")]
    ToolMissing { tool: String },

    /// Non-zero exit status or timeout of an external command.
    #[error("command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    /// Probed state contradicts itself or the expected outcome of an action.
    #[error("inconsistent network state: {0}")]
    ProbeInconsistent(String),

    /// Persisted credentials could not be read or written.
    #[error("credential store error: {0}")]
    CredentialStore(String),
}

impl NetworkError {
    pub fn command_failed(command: impl ToString, reason: impl ToString) -> Self {
        Self::CommandFailed {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn tool_missing(tool: impl ToString) -> Self {
        Self::ToolMissing {
            tool: tool.to_string(),
        }
    }

    /// Fatal errors move the orchestrator to `Degraded` instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ToolMissing { .. })
    }
}
