//! remotelink
//!
//! Provisions a working remote-development session over the external
//! OpenSSH client binary: given a `[user@]host[:port]` authority, obtain
//! a local port that reaches a development server on the remote host,
//! bootstrapping that server if absent.
//!
//! Two layers:
//! - [`ssh::SshClient`] spawns and supervises `ssh` child processes for
//!   one-shot remote commands and persistent `-L` port-forwarding
//!   tunnels, with a typed lifecycle event bus.
//! - [`resolver::SessionResolver`] drives parse → platform detection →
//!   server bootstrap → tunnel establishment and returns the
//!   `{host, port, token}` triple the editor environment dials.
//!
//! ```no_run
//! use std::sync::Arc;
//! use remotelink::{
//!     BootstrapOptions, BootstrapOutcome, ListenEndpoint, ServerBootstrap, SessionResolver,
//! };
//! use remotelink::ssh::SshClient;
//!
//! struct MyBootstrap;
//!
//! #[async_trait::async_trait]
//! impl ServerBootstrap for MyBootstrap {
//!     async fn install(
//!         &self,
//!         _client: &SshClient,
//!         _options: &BootstrapOptions,
//!     ) -> Result<BootstrapOutcome, remotelink::bootstrap::BoxError> {
//!         Ok(BootstrapOutcome {
//!             listening_on: ListenEndpoint::Port(8000),
//!             connection_token: "token".into(),
//!         })
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = SessionResolver::new(Arc::new(MyBootstrap));
//! let endpoint = resolver.resolve("ssh-remote+alice%40example.com").await?;
//! println!("dial {}:{}", endpoint.host, endpoint.port);
//! resolver.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod net;
pub mod resolver;
pub mod ssh;

pub use bootstrap::{BootstrapOptions, BootstrapOutcome, ListenEndpoint, ServerBootstrap};
pub use resolver::{
    encode_authority, parse_authority, Destination, Platform, PlatformOverrides, ResolveError,
    ResolverOptions, ResolverResult, SessionResolver,
};
pub use ssh::{
    ActiveTunnel, ConfigOverlay, ExecOptions, ExecOutput, SshClient, SshConfig, SshError,
    SshEvent, TunnelSpec,
};
