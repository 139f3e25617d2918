//! Supervised SSH client processes
//!
//! `SshClient` owns the configuration for one destination and turns
//! operation requests into supervised `ssh` child processes: one-shot
//! remote command execution and persistent port-forwarding tunnels.
//! Each exec spawns its own process; tunnels are the only long-lived
//! children, each watched by a dedicated supervisor task.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::args;
use super::config::{ConfigOverlay, SshConfig};
use super::error::SshError;
use super::events::{EventBus, EventChannel, EventPhase, SshEvent};
use super::tunnel::{ActiveTunnel, GraceWindow, ReadinessDetector, TunnelSpec, TunnelTarget};
use crate::net;

/// Stderr output that means a tunnel can never come up, matched
/// case-insensitively against accumulated output.
const FATAL_STDERR_PATTERNS: [&str; 3] = [
    "address already in use",
    "permission denied",
    "connection refused",
];

fn is_fatal_stderr(text: &str) -> bool {
    let lower = text.to_lowercase();
    FATAL_STDERR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Per-call options for `exec` and `exec_and_wait_until`.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Treat a non-zero exit code as success
    pub ignore_exit_code: bool,

    /// Kill the child and fail with `ConnectTimeout` if it has not
    /// settled within this window
    pub timeout: Option<Duration>,

    /// Configuration overrides for this call only
    pub overlay: ConfigOverlay,
}

/// Captured output of a one-shot remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Establishment failure, shared with callers that joined an in-flight
/// tunnel attempt.
#[derive(Debug, Clone)]
enum EstablishError {
    Spawn(String),
    FatalStderr(String),
    ExitedEarly(Option<i32>),
}

impl From<EstablishError> for SshError {
    fn from(err: EstablishError) -> Self {
        match err {
            EstablishError::Spawn(msg) => {
                SshError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, msg))
            }
            EstablishError::FatalStderr(text) => SshError::TunnelFatalStderr(text),
            EstablishError::ExitedEarly(exit_code) => SshError::TunnelExitedEarly { exit_code },
        }
    }
}

/// `None` while establishment is in flight, then the settled outcome.
type Establishment = Option<Result<ActiveTunnel, EstablishError>>;

struct TunnelEntry {
    established: watch::Receiver<Establishment>,
    stop: mpsc::Sender<oneshot::Sender<()>>,
}

/// Supervised SSH client for one destination.
///
/// The active-tunnel map is the only shared mutable state; entries are
/// registered before establishment settles so concurrent `add_tunnel`
/// calls for the same name join the first caller's attempt instead of
/// double-spawning.
pub struct SshClient {
    id: String,
    config: SshConfig,
    events: EventBus,
    readiness: Arc<dyn ReadinessDetector>,
    tunnels: Arc<RwLock<HashMap<String, TunnelEntry>>>,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Result<Self, SshError> {
        config.validate()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            config,
            events: EventBus::new(),
            readiness: Arc::new(GraceWindow::default()),
            tunnels: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Replace the tunnel readiness heuristic.
    pub fn with_readiness_detector(mut self, detector: Arc<dyn ReadinessDetector>) -> Self {
        self.readiness = detector;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Subscribe to lifecycle events. Late subscribers miss past events.
    pub fn subscribe(&self) -> broadcast::Receiver<SshEvent> {
        self.events.subscribe()
    }

    fn emit(
        &self,
        channel: EventChannel,
        phase: EventPhase,
        tunnel: Option<String>,
        detail: Option<String>,
    ) {
        self.events.emit(SshEvent {
            client_id: self.id.clone(),
            channel,
            phase,
            tunnel,
            detail,
        });
    }

    /// Run a one-shot remote command and wait for it to exit.
    ///
    /// Fails with `CommandFailed` on a non-zero exit code unless
    /// `ignore_exit_code` is set, and with `Spawn` if the OS could not
    /// start the process at all.
    pub async fn exec(
        &self,
        command: &str,
        args: &[&str],
        options: ExecOptions,
    ) -> Result<ExecOutput, SshError> {
        self.exec_with_tester(command, args, options, None::<fn(&str, &str) -> bool>)
            .await
    }

    /// Like `exec`, but evaluates `tester(stdout_so_far, stderr_so_far)`
    /// after every output chunk and settles as soon as it returns true,
    /// leaving the process running (it is reaped in the background).
    ///
    /// If the process exits before the tester ever matches, behaves
    /// exactly like `exec`.
    pub async fn exec_and_wait_until<F>(
        &self,
        command: &str,
        args: &[&str],
        tester: F,
        options: ExecOptions,
    ) -> Result<ExecOutput, SshError>
    where
        F: Fn(&str, &str) -> bool,
    {
        self.exec_with_tester(command, args, options, Some(tester))
            .await
    }

    async fn exec_with_tester<F>(
        &self,
        command: &str,
        args: &[&str],
        options: ExecOptions,
        tester: Option<F>,
    ) -> Result<ExecOutput, SshError>
    where
        F: Fn(&str, &str) -> bool,
    {
        let config = self.config.overlaid(&options.overlay);
        config.validate()?;

        let remote_command = if args.is_empty() {
            command.to_string()
        } else {
            format!("{} {}", command, args.join(" "))
        };

        self.emit(
            EventChannel::Ssh,
            EventPhase::BeforeConnect,
            None,
            Some(remote_command.clone()),
        );

        let run = run_exec(&config, &remote_command, options.ignore_exit_code, tester);
        let result = match options.timeout {
            Some(window) => match timeout(window, run).await {
                Ok(result) => result,
                Err(_) => Err(SshError::ConnectTimeout(window)),
            },
            None => run.await,
        };

        match &result {
            Ok(_) => self.emit(EventChannel::Ssh, EventPhase::Connected, None, None),
            Err(err) => self.emit(
                EventChannel::Ssh,
                EventPhase::Disconnected,
                None,
                Some(err.to_string()),
            ),
        }
        result
    }

    /// Open a persistent port-forwarding tunnel.
    ///
    /// Idempotent by name: if a tunnel with the computed name is already
    /// active or in flight, the call joins that attempt and no second
    /// process is spawned. A fresh tunnel is considered established when
    /// the readiness detector settles and the process is still alive with
    /// no fatal stderr output.
    pub async fn add_tunnel(&self, spec: TunnelSpec) -> Result<ActiveTunnel, SshError> {
        self.config.validate()?;
        let name = spec.tunnel_name()?;
        let target = spec.target()?;

        if let Some(rx) = self.existing_attempt(&name).await {
            debug!(tunnel = %name, "joining in-flight or active tunnel");
            return await_established(rx).await;
        }

        let local_port = match spec.local_port {
            Some(port) if port != 0 => port,
            _ => net::free_local_port().await?,
        };

        let (established_tx, established_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        {
            let mut tunnels = self.tunnels.write().await;
            if let Some(entry) = tunnels.get(&name) {
                // Lost the race; join the winner's attempt.
                let rx = entry.established.clone();
                drop(tunnels);
                return await_established(rx).await;
            }
            tunnels.insert(
                name.clone(),
                TunnelEntry {
                    established: established_rx.clone(),
                    stop: stop_tx,
                },
            );
        }

        self.emit(
            EventChannel::Tunnel,
            EventPhase::BeforeConnect,
            Some(name.clone()),
            Some(target.forward_spec(local_port)),
        );

        let supervisor = TunnelSupervisor {
            client_id: self.id.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            readiness: self.readiness.clone(),
            tunnels: self.tunnels.clone(),
            name,
            local_port,
            target,
        };
        tokio::spawn(supervisor.run(established_tx, stop_rx));

        await_established(established_rx).await
    }

    async fn existing_attempt(&self, name: &str) -> Option<watch::Receiver<Establishment>> {
        self.tunnels
            .read()
            .await
            .get(name)
            .map(|entry| entry.established.clone())
    }

    /// Close one tunnel by name and wait for its process to terminate.
    /// A name that is not active is a no-op.
    pub async fn close_tunnel(&self, name: &str) {
        let entry = self.tunnels.write().await.remove(name);
        let Some(entry) = entry else {
            debug!(tunnel = %name, "close requested for unknown tunnel, ignoring");
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if entry.stop.send(done_tx).await.is_ok() {
            // Supervisor may have exited between removal and send
            let _ = done_rx.await;
        }
    }

    /// Close all active tunnels concurrently. The set of names is a
    /// snapshot at call time; tunnels added during teardown are not
    /// guaranteed to be included.
    pub async fn close_all_tunnels(&self) {
        let names: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        if names.is_empty() {
            return;
        }
        info!(count = names.len(), "closing all tunnels");
        futures_util::future::join_all(names.iter().map(|name| self.close_tunnel(name))).await;
    }

    /// Tear the client down: close every tunnel and emit the ssh-channel
    /// disconnect transition. Safe to call more than once; a second call
    /// finds nothing to kill.
    pub async fn close(&self) {
        self.emit(EventChannel::Ssh, EventPhase::BeforeDisconnect, None, None);
        self.close_all_tunnels().await;
        self.emit(EventChannel::Ssh, EventPhase::Disconnected, None, None);
    }

    /// Snapshot of tunnels that have completed establishment.
    pub async fn active_tunnels(&self) -> Vec<ActiveTunnel> {
        self.tunnels
            .read()
            .await
            .values()
            .filter_map(|entry| entry.established.borrow().clone())
            .filter_map(|result| result.ok())
            .collect()
    }

    /// Look up an established tunnel by name.
    pub async fn tunnel(&self, name: &str) -> Option<ActiveTunnel> {
        self.tunnels
            .read()
            .await
            .get(name)
            .and_then(|entry| entry.established.borrow().clone())
            .and_then(|result| result.ok())
    }
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("id", &self.id)
            .field("host", &self.config.host)
            .finish()
    }
}

/// Wait for an in-flight establishment to settle.
async fn await_established(
    mut rx: watch::Receiver<Establishment>,
) -> Result<ActiveTunnel, SshError> {
    loop {
        let settled = rx.borrow().clone();
        if let Some(result) = settled {
            return result.map_err(SshError::from);
        }
        if rx.changed().await.is_err() {
            // Supervisor dropped without settling
            return Err(SshError::TunnelExitedEarly { exit_code: None });
        }
    }
}

async fn run_exec<F>(
    config: &SshConfig,
    remote_command: &str,
    ignore_exit_code: bool,
    tester: Option<F>,
) -> Result<ExecOutput, SshError>
where
    F: Fn(&str, &str) -> bool,
{
    let args = args::exec_args(config, remote_command);
    debug!(program = %config.program.display(), command = remote_command, "spawning ssh exec");

    let mut child = Command::new(&config.program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(SshError::Spawn)?;

    let mut stdout_pipe = take_pipe(child.stdout.take())?;
    let mut stderr_pipe = take_pipe(child.stderr.take())?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut stdout_open = true;
    let mut stderr_open = true;

    loop {
        tokio::select! {
            read = stdout_pipe.read(&mut out_buf), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => {
                    stdout.push_str(&String::from_utf8_lossy(&out_buf[..n]));
                    if let Some(tester) = &tester {
                        if tester(&stdout, &stderr) {
                            reap_in_background(child);
                            return Ok(ExecOutput { stdout, stderr });
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            },
            read = stderr_pipe.read(&mut err_buf), if stderr_open => match read {
                Ok(0) => stderr_open = false,
                Ok(n) => {
                    stderr.push_str(&String::from_utf8_lossy(&err_buf[..n]));
                    if let Some(tester) = &tester {
                        if tester(&stdout, &stderr) {
                            reap_in_background(child);
                            return Ok(ExecOutput { stdout, stderr });
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            },
            else => break,
        }
    }

    let status = child.wait().await?;
    if status.success() || ignore_exit_code {
        Ok(ExecOutput { stdout, stderr })
    } else {
        Err(SshError::CommandFailed {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

fn take_pipe<T>(pipe: Option<T>) -> Result<T, SshError> {
    pipe.ok_or_else(|| {
        SshError::Spawn(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "child process pipe unavailable",
        ))
    })
}

/// The tester settled early; the command keeps running but still has to
/// be reaped when it eventually exits.
fn reap_in_background(mut child: Child) {
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}

/// Owns one tunnel child process for its whole lifetime: establishment
/// (readiness window vs fatal stderr vs early exit), then supervision
/// until the process dies or a stop is requested.
struct TunnelSupervisor {
    client_id: String,
    config: SshConfig,
    events: EventBus,
    readiness: Arc<dyn ReadinessDetector>,
    tunnels: Arc<RwLock<HashMap<String, TunnelEntry>>>,
    name: String,
    local_port: u16,
    target: TunnelTarget,
}

impl TunnelSupervisor {
    async fn run(
        self,
        established_tx: watch::Sender<Establishment>,
        mut stop_rx: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        let args = args::tunnel_args(&self.config, self.local_port, &self.target);
        debug!(tunnel = %self.name, local_port = self.local_port, "spawning ssh tunnel");

        let mut child = match Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                self.fail_establishment(
                    &established_tx,
                    EstablishError::Spawn(err.to_string()),
                )
                .await;
                return;
            }
        };

        let mut stderr_pipe = match child.stderr.take() {
            Some(pipe) => pipe,
            None => {
                let _ = child.kill().await;
                self.fail_establishment(
                    &established_tx,
                    EstablishError::Spawn("child process pipe unavailable".into()),
                )
                .await;
                return;
            }
        };

        let mut stderr_text = String::new();
        let mut err_buf = [0u8; 1024];
        let mut stderr_open = true;

        // Establishment phase: the process counts as up once the readiness
        // detector settles with the process alive and no fatal stderr seen.
        // The settle future is created once, outside the loop, so benign
        // stderr chatter (banners, -v diagnostics) does not restart the
        // window; it is measured from spawn.
        let mut settle = self.readiness.settle();
        let outcome = loop {
            tokio::select! {
                _ = &mut settle => {
                    match child.try_wait() {
                        Ok(None) => break Ok(()),
                        Ok(Some(status)) => break Err(EstablishError::ExitedEarly(status.code())),
                        Err(err) => break Err(EstablishError::Spawn(err.to_string())),
                    }
                }
                read = stderr_pipe.read(&mut err_buf), if stderr_open => match read {
                    Ok(0) => stderr_open = false,
                    Ok(n) => {
                        stderr_text.push_str(&String::from_utf8_lossy(&err_buf[..n]));
                        if is_fatal_stderr(&stderr_text) {
                            let _ = child.kill().await;
                            break Err(EstablishError::FatalStderr(stderr_text.trim().to_string()));
                        }
                    }
                    Err(_) => stderr_open = false,
                },
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    break Err(EstablishError::ExitedEarly(code));
                }
                responder = stop_rx.recv() => {
                    // Closed while still establishing
                    let _ = child.kill().await;
                    self.emit(EventPhase::BeforeDisconnect, None);
                    self.emit(EventPhase::Disconnected, Some("closed during establishment".into()));
                    let _ = established_tx.send(Some(Err(EstablishError::ExitedEarly(None))));
                    if let Some(done) = responder {
                        let _ = done.send(());
                    }
                    return;
                }
            }
        };

        match outcome {
            Ok(()) => {
                let active = ActiveTunnel {
                    name: self.name.clone(),
                    local_port: self.local_port,
                    target: self.target.clone(),
                };
                info!(tunnel = %self.name, local_port = self.local_port, "tunnel established");
                let _ = established_tx.send(Some(Ok(active)));
                self.emit(EventPhase::Connected, None);
            }
            Err(err) => {
                self.fail_establishment(&established_tx, err).await;
                return;
            }
        }

        // Supervision phase: wait for an unexpected exit or a stop request.
        loop {
            tokio::select! {
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    let was_registered =
                        self.tunnels.write().await.remove(&self.name).is_some();
                    if was_registered {
                        warn!(tunnel = %self.name, exit_code = ?code, "tunnel process exited unexpectedly");
                        self.emit(
                            EventPhase::Disconnected,
                            Some(format!("tunnel process exited with code {:?}", code)),
                        );
                    }
                    return;
                }
                read = stderr_pipe.read(&mut err_buf), if stderr_open => match read {
                    Ok(0) => stderr_open = false,
                    Ok(n) => {
                        debug!(tunnel = %self.name, "tunnel stderr: {}",
                            String::from_utf8_lossy(&err_buf[..n]).trim_end());
                    }
                    Err(_) => stderr_open = false,
                },
                responder = stop_rx.recv() => {
                    self.emit(EventPhase::BeforeDisconnect, None);
                    let _ = child.kill().await;
                    info!(tunnel = %self.name, "tunnel closed");
                    self.emit(EventPhase::Disconnected, None);
                    if let Some(done) = responder {
                        let _ = done.send(());
                    }
                    return;
                }
            }
        }
    }

    async fn fail_establishment(
        &self,
        established_tx: &watch::Sender<Establishment>,
        err: EstablishError,
    ) {
        warn!(tunnel = %self.name, "tunnel establishment failed: {:?}", err);
        self.tunnels.write().await.remove(&self.name);
        let detail = SshError::from(err.clone()).to_string();
        self.emit(EventPhase::Disconnected, Some(detail));
        let _ = established_tx.send(Some(Err(err)));
    }

    fn emit(&self, phase: EventPhase, detail: Option<String>) {
        self.events.emit(SshEvent {
            client_id: self.client_id.clone(),
            channel: EventChannel::Tunnel,
            phase,
            tunnel: Some(self.name.clone()),
            detail,
        });
    }
}
