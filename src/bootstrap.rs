//! Remote server bootstrap collaborator
//!
//! The resolver delegates installing and starting the remote development
//! server to an external collaborator behind this trait. The collaborator
//! gets the live SSH client and reports where the server listens plus the
//! connection token the editor must present. It is opaque and possibly
//! non-idempotent; the resolver invokes it once per resolve call and never
//! assumes exactly-once side effects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resolver::Platform;
use crate::ssh::SshClient;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where the remote development server listens after bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListenEndpoint {
    /// TCP port on the remote host
    Port(u16),
    /// Unix domain socket path on the remote host
    Socket(String),
}

/// What a successful bootstrap reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapOutcome {
    pub listening_on: ListenEndpoint,
    pub connection_token: String,
}

/// Inputs handed to the collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapOptions {
    /// Template for downloading the server binary, with platform/version
    /// placeholders the collaborator substitutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url_template: Option<String>,

    /// Extensions to install alongside the server
    #[serde(default)]
    pub default_extensions: Vec<String>,

    /// Detected platform, when known; the collaborator may probe further
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// Prefer a Unix domain socket over a TCP port for the server listener
    #[serde(default)]
    pub listen_on_socket: bool,
}

/// Ensures a development server is present and running on the remote host.
#[async_trait]
pub trait ServerBootstrap: Send + Sync {
    async fn install(
        &self,
        client: &SshClient,
        options: &BootstrapOptions,
    ) -> Result<BootstrapOutcome, BoxError>;
}
