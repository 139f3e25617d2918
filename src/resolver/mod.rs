//! Session resolution
//!
//! `SessionResolver` turns an encoded authority into a live local
//! endpoint: parse the destination, detect the remote platform, hand the
//! SSH client to the bootstrap collaborator, then forward a freshly
//! allocated local port to wherever the collaborator reports the server
//! listening. One resolver instance serves many resolve calls; the SSH
//! client is reused across retries of the same authority, and disposal
//! tears down everything the resolver created.

pub mod authority;
pub mod platform;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::bootstrap::{BootstrapOptions, ListenEndpoint, ServerBootstrap};
use crate::net;
use crate::ssh::{ConfigOverlay, ReadinessDetector, SshClient, SshConfig, TunnelSpec};

pub use authority::{encode_authority, parse_authority, AuthorityError, Destination};
pub use platform::{detect_platform, Platform, PlatformOverrides};

/// Resolution failures as seen by the host environment. Internal error
/// shapes never cross this boundary; everything past authority parsing
/// is wrapped into `ResolutionFailed`.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Invalid authority: {0}")]
    InvalidAuthority(#[from] AuthorityError),

    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),
}

/// The local endpoint the editor environment dials.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverResult {
    /// Always `localhost`; the tunnel listens locally
    pub host: String,
    pub port: u16,
    pub connection_token: String,
}

/// Knobs the host environment configures once per resolver.
#[derive(Clone, Default)]
pub struct ResolverOptions {
    pub platform_overrides: PlatformOverrides,
    pub bootstrap: BootstrapOptions,
    /// Applied to every SSH client this resolver constructs
    pub ssh: ConfigOverlay,
    /// Replacement tunnel readiness heuristic, mainly for tests
    pub readiness: Option<Arc<dyn ReadinessDetector>>,
}

struct OwnedTunnel {
    client: Arc<SshClient>,
    name: String,
}

/// Resolves authorities to local endpoints, one instance for many calls.
pub struct SessionResolver {
    bootstrap: Arc<dyn ServerBootstrap>,
    options: ResolverOptions,
    clients: RwLock<HashMap<String, Arc<SshClient>>>,
    tunnels: parking_lot::Mutex<Vec<OwnedTunnel>>,
    attempts: AtomicU64,
}

impl SessionResolver {
    pub fn new(bootstrap: Arc<dyn ServerBootstrap>) -> Self {
        Self::with_options(bootstrap, ResolverOptions::default())
    }

    pub fn with_options(bootstrap: Arc<dyn ServerBootstrap>, options: ResolverOptions) -> Self {
        Self {
            bootstrap,
            options,
            clients: RwLock::new(HashMap::new()),
            tunnels: parking_lot::Mutex::new(Vec::new()),
            attempts: AtomicU64::new(0),
        }
    }

    /// Resolve an authority to a local endpoint, bootstrapping the remote
    /// server if absent.
    ///
    /// Never retries on its own; retry is the host environment calling
    /// again, visible in logs as a fresh attempt number.
    pub async fn resolve(&self, authority: &str) -> Result<ResolverResult, ResolveError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let destination = authority::parse_authority(authority)?;
        info!(attempt, host = %destination.host, port = destination.port, "resolving remote authority");

        let client = self.client_for(authority, &destination).await?;

        // Platform probe failures degrade to Unknown, never abort
        let platform =
            platform::detect_platform(&client, &self.options.platform_overrides).await;
        debug!(attempt, ?platform, "remote platform");

        let mut bootstrap_options = self.options.bootstrap.clone();
        if bootstrap_options.platform.is_none() {
            bootstrap_options.platform = Some(platform);
        }
        let outcome = self
            .bootstrap
            .install(&client, &bootstrap_options)
            .await
            .map_err(|err| {
                ResolveError::ResolutionFailed(format!("remote server bootstrap failed: {}", err))
            })?;

        let local_port = net::free_local_port().await.map_err(|err| {
            ResolveError::ResolutionFailed(format!("could not allocate a local port: {}", err))
        })?;

        let spec = match &outcome.listening_on {
            ListenEndpoint::Port(port) => TunnelSpec::to_port(*port),
            ListenEndpoint::Socket(path) => TunnelSpec::to_socket(path.clone()),
        }
        .with_local_port(local_port);

        let tunnel = client.add_tunnel(spec).await.map_err(|err| {
            ResolveError::ResolutionFailed(format!("tunnel establishment failed: {}", err))
        })?;

        self.tunnels.lock().push(OwnedTunnel {
            client: client.clone(),
            name: tunnel.name.clone(),
        });

        info!(attempt, local_port = tunnel.local_port, "authority resolved");
        Ok(ResolverResult {
            host: "localhost".to_string(),
            port: tunnel.local_port,
            connection_token: outcome.connection_token,
        })
    }

    /// The SSH client serving an authority, if one was constructed.
    /// Host environments use this to subscribe to lifecycle events.
    pub async fn client(&self, authority: &str) -> Option<Arc<SshClient>> {
        self.clients.read().await.get(authority).cloned()
    }

    /// Tear down every tunnel created across all resolve calls and close
    /// the SSH clients. Failures are logged, never propagated; disposal
    /// must not throw.
    pub async fn dispose(&self) {
        let owned: Vec<OwnedTunnel> = std::mem::take(&mut *self.tunnels.lock());
        if !owned.is_empty() {
            info!(count = owned.len(), "disposing resolver tunnels");
        }
        for tunnel in owned {
            tunnel.client.close_tunnel(&tunnel.name).await;
        }

        let clients: Vec<Arc<SshClient>> =
            self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
            debug!(client_id = client.id(), "ssh client closed");
        }
    }

    async fn client_for(
        &self,
        authority: &str,
        destination: &Destination,
    ) -> Result<Arc<SshClient>, ResolveError> {
        if let Some(client) = self.clients.read().await.get(authority) {
            return Ok(client.clone());
        }

        let mut base = SshConfig::new(&destination.host).with_port(destination.port);
        if let Some(user) = &destination.username {
            base = base.with_username(user);
        }
        let config = base.overlaid(&self.options.ssh);

        let mut client = SshClient::new(config).map_err(|err| {
            ResolveError::ResolutionFailed(format!("ssh client construction failed: {}", err))
        })?;
        if let Some(readiness) = &self.options.readiness {
            client = client.with_readiness_detector(readiness.clone());
        }
        let client = Arc::new(client);

        // First insert wins a racing construction
        let mut clients = self.clients.write().await;
        let entry = clients
            .entry(authority.to_string())
            .or_insert_with(|| client.clone());
        Ok(entry.clone())
    }
}

impl std::fmt::Debug for SessionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResolver")
            .field("attempts", &self.attempts.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::bootstrap::{BootstrapOutcome, BoxError};
    use crate::ssh::GraceWindow;
    use async_trait::async_trait;

    /// Fake `ssh` that answers the platform probe and holds tunnel
    /// processes open.
    fn fake_ssh() -> (tempfile::TempDir, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-ssh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "case \"$*\" in").unwrap();
        writeln!(file, "  *\" -N \"*) sleep 30 ;;").unwrap();
        writeln!(file, "  *) echo Linux ;;").unwrap();
        writeln!(file, "esac").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        file.set_permissions(perms).unwrap();
        drop(file);
        (dir, path)
    }

    struct MockBootstrap {
        outcome: Result<BootstrapOutcome, String>,
        seen: parking_lot::Mutex<Option<BootstrapOptions>>,
    }

    impl MockBootstrap {
        fn reporting(listening_on: ListenEndpoint, token: &str) -> Arc<Self> {
            Arc::new(Self {
                outcome: Ok(BootstrapOutcome {
                    listening_on,
                    connection_token: token.to_string(),
                }),
                seen: parking_lot::Mutex::new(None),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                outcome: Err(message.to_string()),
                seen: parking_lot::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ServerBootstrap for MockBootstrap {
        async fn install(
            &self,
            _client: &SshClient,
            options: &BootstrapOptions,
        ) -> Result<BootstrapOutcome, BoxError> {
            *self.seen.lock() = Some(options.clone());
            self.outcome.clone().map_err(BoxError::from)
        }
    }

    fn options_with(program: PathBuf) -> ResolverOptions {
        ResolverOptions {
            ssh: ConfigOverlay {
                program: Some(program),
                ..Default::default()
            },
            readiness: Some(Arc::new(GraceWindow::new(Duration::from_millis(100)))),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_success() {
        let (_dir, program) = fake_ssh();
        let bootstrap = MockBootstrap::reporting(ListenEndpoint::Port(8000), "tok");
        let resolver =
            SessionResolver::with_options(bootstrap.clone(), options_with(program));

        let authority = encode_authority(&Destination::new("example.com").with_username("alice"));
        let result = resolver.resolve(&authority).await.unwrap();

        assert_eq!(result.host, "localhost");
        assert_ne!(result.port, 0);
        assert_eq!(result.connection_token, "tok");

        // probe result flowed into the bootstrap options
        let seen = bootstrap.seen.lock().clone().unwrap();
        assert_eq!(seen.platform, Some(Platform::Linux));

        let client = resolver.client(&authority).await.unwrap();
        assert_eq!(client.config().destination(), "alice@example.com");
        assert_eq!(client.active_tunnels().await.len(), 1);

        resolver.dispose().await;
    }

    #[tokio::test]
    async fn test_resolve_socket_endpoint() {
        let (_dir, program) = fake_ssh();
        let bootstrap =
            MockBootstrap::reporting(ListenEndpoint::Socket("/run/devserver.sock".into()), "tok");
        let resolver = SessionResolver::with_options(bootstrap, options_with(program));

        let authority = encode_authority(&Destination::new("example.com"));
        let result = resolver.resolve(&authority).await.unwrap();
        assert_ne!(result.port, 0);

        let client = resolver.client(&authority).await.unwrap();
        let tunnels = client.active_tunnels().await;
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].name, "localhost@/run/devserver.sock");

        resolver.dispose().await;
    }

    #[tokio::test]
    async fn test_resolve_invalid_scheme() {
        let (_dir, program) = fake_ssh();
        let bootstrap = MockBootstrap::reporting(ListenEndpoint::Port(8000), "tok");
        let resolver = SessionResolver::with_options(bootstrap, options_with(program));

        let err = resolver
            .resolve("wsl-remote+example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidAuthority(_)));
    }

    #[tokio::test]
    async fn test_failing_bootstrap_leaves_no_tunnel() {
        let (_dir, program) = fake_ssh();
        let bootstrap = MockBootstrap::failing("download failed");
        let resolver = SessionResolver::with_options(bootstrap, options_with(program));

        let authority = encode_authority(&Destination::new("example.com"));
        let err = resolver.resolve(&authority).await.unwrap_err();
        assert!(matches!(err, ResolveError::ResolutionFailed(_)));
        assert!(err.to_string().contains("download failed"));

        let client = resolver.client(&authority).await.unwrap();
        assert!(client.active_tunnels().await.is_empty());

        resolver.dispose().await;
    }

    #[tokio::test]
    async fn test_platform_override_skips_probe() {
        let (_dir, program) = fake_ssh();
        let bootstrap = MockBootstrap::reporting(ListenEndpoint::Port(8000), "tok");
        let mut options = options_with(program);
        options
            .platform_overrides
            .insert("example.com", Platform::Windows);
        let resolver = SessionResolver::with_options(bootstrap.clone(), options);

        let authority = encode_authority(&Destination::new("example.com"));
        resolver.resolve(&authority).await.unwrap();

        let seen = bootstrap.seen.lock().clone().unwrap();
        assert_eq!(seen.platform, Some(Platform::Windows));

        resolver.dispose().await;
    }

    #[tokio::test]
    async fn test_client_reused_across_retries() {
        let (_dir, program) = fake_ssh();
        let bootstrap = MockBootstrap::reporting(ListenEndpoint::Port(8000), "tok");
        let resolver = SessionResolver::with_options(bootstrap, options_with(program));

        let authority = encode_authority(&Destination::new("example.com"));
        resolver.resolve(&authority).await.unwrap();
        let first = resolver.client(&authority).await.unwrap();
        resolver.resolve(&authority).await.unwrap();
        let second = resolver.client(&authority).await.unwrap();
        assert_eq!(first.id(), second.id());

        resolver.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_closes_tunnels_and_clients() {
        let (_dir, program) = fake_ssh();
        let bootstrap = MockBootstrap::reporting(ListenEndpoint::Port(8000), "tok");
        let resolver = SessionResolver::with_options(bootstrap, options_with(program));

        let authority = encode_authority(&Destination::new("example.com"));
        resolver.resolve(&authority).await.unwrap();
        let client = resolver.client(&authority).await.unwrap();
        assert_eq!(client.active_tunnels().await.len(), 1);

        resolver.dispose().await;
        assert!(client.active_tunnels().await.is_empty());
        assert!(resolver.client(&authority).await.is_none());

        // Disposal is idempotent
        resolver.dispose().await;
    }
}
