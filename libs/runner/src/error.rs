//! Runner error types.

use thiserror::Error;

/// Errors from provisioner invocations.
///
/// Per-host trouble is not an error: it comes back as a status in the
/// report. These variants cover the invocation itself going wrong.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Failed to write the one-off inventory file.
    #[error("failed to write inventory: {0}")]
    Inventory(#[source] std::io::Error),

    /// Failed to spawn the external tool.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool exited without producing a recap to attribute outcomes.
    #[error("playbook produced no recap (exit status {status}): {stderr_tail}")]
    NoRecap { status: i32, stderr_tail: String },
}
