//! Domain error kinds.
//!
//! Long-running operation handlers never let one of these escape past the
//! dispatcher: every failure becomes a failure reply to the control plane, a
//! terminal FAILED progress event, and an idle operation status.

use thiserror::Error;

/// Errors surfaced by the agent's domain operations.
///
/// Plumbing below these seams uses [`anyhow`] with context; the variants here
/// are the classification the dispatcher and the control plane care about.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing or malformed configuration. Fatal at startup.
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    /// Connect error, timeout, or disconnect. Recovered by the reconnect
    /// schedule, never by the caller.
    #[error("transport error: {0}")]
    TransportTransient(String),

    /// A command the agent refuses to run (busy, unknown, deprecated, or
    /// missing required arguments). Reported via the command reply.
    #[error("{0}")]
    CommandRejected(String),

    /// Metadata fetch failure, hash mismatch, or I/O error during package
    /// acquisition.
    #[error("{0}")]
    DownloadFailed(String),

    /// Deploy pipeline failure. The engine has already attempted snapshot
    /// recovery by the time this is returned.
    #[error("{0}")]
    DeployFailed(String),

    /// Rollback failure. No automatic remediation.
    #[error("{0}")]
    RollbackFailed(String),
}

impl AgentError {
    /// The human-readable message sent back to the control plane.
    pub fn reply_message(&self) -> String {
        self.to_string()
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
