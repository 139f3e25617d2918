//! Tunnel specifications and readiness
//!
//! A tunnel forwards a local TCP port through SSH to either a remote
//! TCP port or a remote Unix domain socket. The computed name is the
//! dedup/lookup key inside a client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::SshError;

const DEFAULT_REMOTE_ADDRESS: &str = "localhost";

/// Requested tunnel configuration.
///
/// Exactly one of `remote_port` (with optional `remote_address`, default
/// `localhost`) or `remote_socket_path` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Explicit name; computed from the target when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Local port to bind; unset or 0 means pick an ephemeral port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_socket_path: Option<String>,
}

impl TunnelSpec {
    /// Forward to a remote TCP port on `localhost`.
    pub fn to_port(remote_port: u16) -> Self {
        Self {
            remote_port: Some(remote_port),
            ..Default::default()
        }
    }

    /// Forward to a remote Unix domain socket.
    pub fn to_socket(path: impl Into<String>) -> Self {
        Self {
            remote_socket_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    /// Resolve the forwarding target, enforcing the exactly-one invariant.
    pub fn target(&self) -> Result<TunnelTarget, SshError> {
        match (&self.remote_port, &self.remote_socket_path) {
            (Some(port), None) => Ok(TunnelTarget::Port {
                address: self
                    .remote_address
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REMOTE_ADDRESS.to_string()),
                port: *port,
            }),
            (None, Some(path)) => Ok(TunnelTarget::Socket { path: path.clone() }),
            (Some(_), Some(_)) => Err(SshError::InvalidConfig(
                "tunnel spec sets both remote_port and remote_socket_path".into(),
            )),
            (None, None) => Err(SshError::InvalidConfig(
                "tunnel spec sets neither remote_port nor remote_socket_path".into(),
            )),
        }
    }

    /// The dedup/lookup key: the explicit name, or `address@port` /
    /// `address@socket-path` computed from the target.
    pub fn tunnel_name(&self) -> Result<String, SshError> {
        if let Some(name) = &self.name {
            return Ok(name.clone());
        }
        let address = self
            .remote_address
            .as_deref()
            .unwrap_or(DEFAULT_REMOTE_ADDRESS);
        match self.target()? {
            TunnelTarget::Port { port, .. } => Ok(format!("{}@{}", address, port)),
            TunnelTarget::Socket { path } => Ok(format!("{}@{}", address, path)),
        }
    }
}

/// Resolved forwarding target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TunnelTarget {
    Port { address: String, port: u16 },
    Socket { path: String },
}

impl TunnelTarget {
    /// The `-L` argument value: `local:address:port` or `local:socket-path`.
    pub fn forward_spec(&self, local_port: u16) -> String {
        match self {
            TunnelTarget::Port { address, port } => {
                format!("{}:{}:{}", local_port, address, port)
            }
            TunnelTarget::Socket { path } => format!("{}:{}", local_port, path),
        }
    }
}

/// An established tunnel as seen by callers. The supervising child process
/// is owned by the client that created the tunnel; this is the shareable
/// description of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTunnel {
    pub name: String,
    /// Resolved local port, never 0 once active
    pub local_port: u16,
    pub target: TunnelTarget,
}

/// Decides when a freshly spawned tunnel process counts as established.
///
/// SSH gives no explicit "tunnel ready" signal in batch mode, so readiness
/// has to be inferred. Kept behind a trait so the heuristic can be replaced
/// with a real probe without touching the client.
#[async_trait]
pub trait ReadinessDetector: Send + Sync {
    /// Returns when the tunnel should be checked and, if the process is
    /// still alive, considered established.
    async fn settle(&self);
}

/// Fixed-delay readiness: a process still running after the grace window
/// with no fatal stderr output is treated as established. Callers must
/// tolerate the rare false positive under unusual network conditions.
#[derive(Debug, Clone)]
pub struct GraceWindow {
    delay: Duration,
}

impl GraceWindow {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for GraceWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY)
    }
}

#[async_trait]
impl ReadinessDetector for GraceWindow {
    async fn settle(&self) {
        tokio::time::sleep(self.delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_defaults_to_address_and_port() {
        let spec = TunnelSpec::to_port(8000);
        assert_eq!(spec.tunnel_name().unwrap(), "localhost@8000");

        let spec = TunnelSpec::to_port(8000).with_remote_address("10.0.0.5");
        assert_eq!(spec.tunnel_name().unwrap(), "10.0.0.5@8000");
    }

    #[test]
    fn test_name_for_socket_target() {
        let spec = TunnelSpec::to_socket("/run/devserver.sock");
        assert_eq!(spec.tunnel_name().unwrap(), "localhost@/run/devserver.sock");
    }

    #[test]
    fn test_explicit_name_wins() {
        let spec = TunnelSpec::to_port(8000).with_name("web");
        assert_eq!(spec.tunnel_name().unwrap(), "web");
    }

    #[test]
    fn test_target_requires_exactly_one() {
        let neither = TunnelSpec::default();
        assert!(matches!(
            neither.target(),
            Err(SshError::InvalidConfig(_))
        ));

        let both = TunnelSpec {
            remote_port: Some(8000),
            remote_socket_path: Some("/run/devserver.sock".into()),
            ..Default::default()
        };
        assert!(matches!(both.target(), Err(SshError::InvalidConfig(_))));
    }

    #[test]
    fn test_forward_spec() {
        let port = TunnelTarget::Port {
            address: "localhost".into(),
            port: 8000,
        };
        assert_eq!(port.forward_spec(9000), "9000:localhost:8000");

        let socket = TunnelTarget::Socket {
            path: "/run/devserver.sock".into(),
        };
        assert_eq!(socket.forward_spec(9000), "9000:/run/devserver.sock");
    }
}
