//! Supervised OpenSSH child processes
//!
//! One-shot remote command execution and persistent port-forwarding
//! tunnels over the external `ssh` binary, with a typed lifecycle event
//! bus. This is process orchestration, not an SSH protocol
//! implementation.

pub mod args;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod tunnel;

pub use client::{ExecOptions, ExecOutput, SshClient};
pub use config::{ConfigOverlay, SshConfig};
pub use error::SshError;
pub use events::{EventBus, EventChannel, EventPhase, SshEvent};
pub use tunnel::{ActiveTunnel, GraceWindow, ReadinessDetector, TunnelSpec, TunnelTarget};
