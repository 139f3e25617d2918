//! SSH process client error types

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn ssh process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Remote command failed with exit code {exit_code:?}")]
    CommandFailed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Operation timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Tunnel failed: {0}")]
    TunnelFatalStderr(String),

    #[error("Tunnel process exited during establishment (exit code {exit_code:?})")]
    TunnelExitedEarly { exit_code: Option<i32> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// Make SshError serializable for host environments that persist or display
// failures.
impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
