pub mod config;
pub mod release;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::rpc::{ConnectionPool, RpcConnection};
use config::{ConfigurationError, DaemonSettings, LightningNode, render_config};
use release::{DAEMON_BINARY, DownloadError, Platform, ReleaseSource, extract_binaries};

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub data_dir: PathBuf,
    pub network: String,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub restart_delay: Duration,
    pub stop_grace: Duration,
    /// Run this executable instead of the downloaded `boltzd`.
    pub daemon_binary: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            network: "mainnet".to_string(),
            rpc_host: "127.0.0.1".to_string(),
            rpc_port: 9002,
            restart_delay: DEFAULT_RESTART_DELAY,
            stop_grace: DEFAULT_STOP_GRACE,
            daemon_binary: None,
        }
    }

    pub fn address(&self) -> String {
        format!("http://{}:{}", self.rpc_host, self.rpc_port)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("boltz.toml")
    }

    pub fn admin_macaroon_path(&self) -> PathBuf {
        self.data_dir.join("macaroons").join("admin.macaroon")
    }

    pub fn version_path(&self) -> PathBuf {
        self.data_dir.join("version")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("boltzd.log")
    }

    pub fn bin_dir(&self, platform: &Platform) -> PathBuf {
        self.data_dir.join("bin").join(platform.name())
    }
}

/// Address and admin credential of the running daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonEndpoint {
    pub address: String,
    pub admin_token: String,
}

#[derive(Debug, Clone)]
pub enum DaemonState {
    Idle,
    Starting,
    WaitingForCredential,
    ProbingHealth,
    Healthy(RpcConnection),
    Exited { status: String, restarts: u64 },
    Stopped,
}

impl DaemonState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, DaemonState::Healthy(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("boltzd binary not found at {0}")]
    MissingBinary(PathBuf),
    #[error("boltzd config not found at {0}")]
    NotConfigured(PathBuf),
    #[error("boltzd is already running")]
    AlreadyRunning,
    #[error("supervisor was stopped")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("boltzd did not become healthy within {timeout:?} (last exit: {})", last_exit.as_deref().unwrap_or("none"))]
    Timeout {
        timeout: Duration,
        last_exit: Option<String>,
    },
    #[error("supervisor was stopped")]
    Stopped,
}

/// Owns the `boltzd` process and the admin connection to it.
pub struct DaemonSupervisor {
    config: SupervisorConfig,
    releases: Arc<dyn ReleaseSource>,
    pool: Arc<ConnectionPool>,
    state: Arc<watch::Sender<DaemonState>>,
    cancel: CancellationToken,
    graceful: Arc<AtomicBool>,
    restarts: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonSupervisor {
    pub fn new(config: SupervisorConfig, releases: Arc<dyn ReleaseSource>) -> Self {
        Self {
            config,
            releases,
            pool: Arc::new(ConnectionPool::new()),
            state: Arc::new(watch::Sender::new(DaemonState::Idle)),
            cancel: CancellationToken::new(),
            graceful: Arc::new(AtomicBool::new(false)),
            restarts: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn state(&self) -> DaemonState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    /// Cancelled when the supervisor stops. Background loops that depend on
    /// the daemon derive their tokens from this one.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn admin(&self) -> Option<RpcConnection> {
        match &*self.state.borrow() {
            DaemonState::Healthy(conn) => Some(conn.clone()),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Option<DaemonEndpoint> {
        self.admin().map(|conn| DaemonEndpoint {
            address: conn.address().to_string(),
            admin_token: conn.token().to_string(),
        })
    }

    pub fn current_version(&self) -> Option<String> {
        std::fs::read_to_string(self.config.version_path())
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Installs the latest daemon release unless it is already installed.
    /// Returns the installed version.
    pub async fn ensure_binary_available(&self) -> Result<String, DownloadError> {
        let platform = Platform::current()?;
        self.install_release(&platform).await
    }

    pub async fn install_release(&self, platform: &Platform) -> Result<String, DownloadError> {
        let latest = self.releases.latest_version().await?;
        let bin_dir = self.config.bin_dir(platform);
        if self.current_version().as_deref() == Some(latest.as_str())
            && bin_dir.join(DAEMON_BINARY).exists()
        {
            tracing::debug!(version = %latest, "boltzd is up to date");
            return Ok(latest);
        }

        tracing::info!(
            version = %latest,
            current = ?self.current_version(),
            platform = %platform.name(),
            "downloading boltzd"
        );
        let archive = self.releases.fetch_archive(&latest, platform).await?;

        let data_dir = self.config.data_dir.clone();
        let archive_name = platform.archive_name(&latest);
        let version_path = self.config.version_path();
        let version = latest.clone();
        tokio::task::spawn_blocking(move || {
            install_archive(&data_dir, &archive_name, &archive, &bin_dir, &version_path, &version)
        })
        .await
        .map_err(|e| DownloadError::Extract(std::io::Error::other(e)))??;

        tracing::info!(version = %latest, "boltzd installed");
        Ok(latest)
    }

    /// Writes `boltz.toml` for the node described by `descriptor`
    /// (standalone when `None`).
    pub fn configure(&self, descriptor: Option<&str>) -> Result<LightningNode, SupervisorError> {
        let node = match descriptor {
            Some(s) => LightningNode::from_connection_string(s)?,
            None => LightningNode::Standalone,
        };
        self.write_config(&node)?;
        Ok(node)
    }

    /// [`Self::configure`], retrying once in standalone mode when the node
    /// descriptor is rejected.
    pub fn configure_with_fallback(
        &self,
        descriptor: Option<&str>,
    ) -> Result<LightningNode, SupervisorError> {
        match self.configure(descriptor) {
            Err(SupervisorError::Configuration(err)) if descriptor.is_some() => {
                tracing::warn!(error = %err, "lightning node rejected, falling back to standalone");
                self.configure(None)
            }
            other => other,
        }
    }

    fn write_config(&self, node: &LightningNode) -> Result<(), SupervisorError> {
        let settings = DaemonSettings {
            network: self.config.network.clone(),
            rpc_host: self.config.rpc_host.clone(),
            rpc_port: self.config.rpc_port,
            data_dir: self.config.data_dir.clone(),
        };
        let path = self.config.config_path();
        let io = |source| SupervisorError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.config.data_dir).map_err(io)?;
        std::fs::write(&path, render_config(&settings, node)).map_err(io)?;
        tracing::info!(path = %path.display(), standalone = node.is_standalone(), "wrote boltzd config");
        Ok(())
    }

    fn daemon_binary(&self) -> Result<PathBuf, SupervisorError> {
        let path = match &self.config.daemon_binary {
            Some(path) => path.clone(),
            None => self.config.bin_dir(&Platform::current()?).join(DAEMON_BINARY),
        };
        if !path.exists() {
            return Err(SupervisorError::MissingBinary(path));
        }
        Ok(path)
    }

    /// Launches `boltzd` and keeps it running until [`Self::stop`].
    pub fn start(&self) -> Result<(), SupervisorError> {
        if self.cancel.is_cancelled() {
            return Err(SupervisorError::Stopped);
        }
        let mut task = self.task.lock().expect("supervisor task mutex poisoned");
        if task.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let binary = self.daemon_binary()?;
        let config_path = self.config.config_path();
        if !config_path.exists() {
            return Err(SupervisorError::NotConfigured(config_path));
        }

        let runner = Runner {
            binary,
            config_path,
            data_dir: self.config.data_dir.clone(),
            log_path: self.config.log_path(),
            macaroon_path: self.config.admin_macaroon_path(),
            address: self.config.address(),
            restart_delay: self.config.restart_delay,
            stop_grace: self.config.stop_grace,
            pool: self.pool.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            graceful: self.graceful.clone(),
            restarts: self.restarts.clone(),
        };
        *task = Some(tokio::spawn(runner.run()));
        Ok(())
    }

    /// Resolves with the admin connection once the daemon is healthy.
    /// Crashes while waiting are absorbed by the restart loop; only the
    /// deadline or a stop end the wait early.
    pub async fn wait(&self, timeout: Duration) -> Result<RpcConnection, WaitError> {
        let mut rx = self.state.subscribe();
        let mut last_exit = None;
        let waited = tokio::time::timeout(timeout, async {
            loop {
                {
                    let state = rx.borrow_and_update();
                    match &*state {
                        DaemonState::Healthy(conn) => return Ok(conn.clone()),
                        DaemonState::Stopped => return Err(WaitError::Stopped),
                        DaemonState::Exited { status, .. } => last_exit = Some(status.clone()),
                        _ => {}
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(WaitError::Stopped);
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(WaitError::Timeout { timeout, last_exit }),
        }
    }

    /// Stops the daemon: an RPC `Stop` when the admin connection is up,
    /// otherwise the process is killed. No restarts happen afterwards.
    pub async fn stop(&self) {
        let admin = self.admin();
        self.graceful.store(admin.is_some(), Ordering::SeqCst);
        self.cancel.cancel();

        if let Some(admin) = admin
            && let Err(err) = admin.stop().await
        {
            tracing::warn!(error = %err, "graceful stop request failed");
        }

        let handle = self
            .task
            .lock()
            .expect("supervisor task mutex poisoned")
            .take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "supervisor task join error");
        }
        self.pool.clear();
        self.state.send_replace(DaemonState::Stopped);
    }
}

impl Drop for DaemonSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn install_archive(
    data_dir: &Path,
    archive_name: &str,
    archive: &[u8],
    bin_dir: &Path,
    version_path: &Path,
    version: &str,
) -> Result<(), DownloadError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DownloadError::Io { path, source }
    };

    std::fs::create_dir_all(data_dir).map_err(io(data_dir))?;
    let archive_path = data_dir.join(archive_name);
    let partial = data_dir.join(format!(".{archive_name}.{}", Uuid::new_v4()));
    std::fs::write(&partial, archive).map_err(io(&partial))?;
    std::fs::rename(&partial, &archive_path).map_err(io(&archive_path))?;

    let parent = bin_dir.parent().unwrap_or(data_dir);
    let staging = parent.join(format!(".staging-{}", Uuid::new_v4()));
    if let Err(err) = extract_binaries(archive, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(err);
    }
    if bin_dir.exists() {
        std::fs::remove_dir_all(bin_dir).map_err(io(bin_dir))?;
    }
    std::fs::rename(&staging, bin_dir).map_err(io(bin_dir))?;

    let partial = data_dir.join(format!(".version.{}", Uuid::new_v4()));
    std::fs::write(&partial, version).map_err(io(&partial))?;
    std::fs::rename(&partial, version_path).map_err(io(version_path))?;
    Ok(())
}

/// The restart loop, moved into its own task by [`DaemonSupervisor::start`].
struct Runner {
    binary: PathBuf,
    config_path: PathBuf,
    data_dir: PathBuf,
    log_path: PathBuf,
    macaroon_path: PathBuf,
    address: String,
    restart_delay: Duration,
    stop_grace: Duration,
    pool: Arc<ConnectionPool>,
    state: Arc<watch::Sender<DaemonState>>,
    cancel: CancellationToken,
    graceful: Arc<AtomicBool>,
    restarts: Arc<AtomicU64>,
}

impl Runner {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.state.send_replace(DaemonState::Starting);

            let status = match self.spawn() {
                Ok(child) => {
                    tracing::info!(binary = %self.binary.display(), pid = ?child.id(), "started boltzd");
                    self.supervise(child).await
                }
                Err(err) => {
                    tracing::error!(error = %err, binary = %self.binary.display(), "failed to spawn boltzd");
                    format!("spawn failed: {err}")
                }
            };

            let restarts = if self.cancel.is_cancelled() {
                self.restarts.load(Ordering::SeqCst)
            } else {
                self.restarts.fetch_add(1, Ordering::SeqCst) + 1
            };
            self.state.send_replace(DaemonState::Exited {
                status: status.clone(),
                restarts,
            });
            if self.cancel.is_cancelled() {
                tracing::info!(%status, "boltzd stopped");
                break;
            }

            tracing::warn!(%status, delay = ?self.restart_delay, restarts, "boltzd exited, restarting");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }
        self.state.send_replace(DaemonState::Stopped);
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let log_err = log.try_clone()?;
        Command::new(&self.binary)
            .arg("--datadir")
            .arg(&self.data_dir)
            .arg("--configfile")
            .arg(&self.config_path)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
    }

    async fn supervise(&self, mut child: Child) -> String {
        let ready = self.await_ready();
        tokio::pin!(ready);
        let mut healthy = false;
        loop {
            tokio::select! {
                status = child.wait() => return describe_exit(status),
                _ = &mut ready, if !healthy => healthy = true,
                _ = self.cancel.cancelled() => return self.shutdown(&mut child).await,
            }
        }
    }

    async fn shutdown(&self, child: &mut Child) -> String {
        let grace = if self.graceful.load(Ordering::SeqCst) {
            self.stop_grace
        } else {
            Duration::ZERO
        };
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => describe_exit(status),
            Err(_) => {
                if let Err(err) = child.kill().await {
                    tracing::warn!(error = %err, "failed to kill boltzd");
                }
                "killed".to_string()
            }
        }
    }

    /// Waits for the admin macaroon, then polls GetInfo until it answers.
    async fn await_ready(&self) {
        self.state.send_replace(DaemonState::WaitingForCredential);
        let token = loop {
            match tokio::fs::read(&self.macaroon_path).await {
                Ok(bytes) if !bytes.is_empty() => break hex::encode(bytes),
                _ => tokio::time::sleep(READY_POLL_INTERVAL).await,
            }
        };

        self.state.send_replace(DaemonState::ProbingHealth);
        let conn = match self.pool.connect(&self.address, &token, None) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(error = %err, address = %self.address, "cannot build admin connection");
                return std::future::pending().await;
            }
        };

        loop {
            match conn.get_info().await {
                Ok(info) => {
                    tracing::info!(version = %info.version, network = %info.network, "boltzd is healthy");
                    self.state.send_replace(DaemonState::Healthy(conn));
                    return;
                }
                Err(err) => {
                    tracing::debug!(error = %err, "boltzd not ready yet");
                    tokio::time::sleep(READY_POLL_INTERVAL).await;
                }
            }
        }
    }
}

fn describe_exit(status: std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(err) => format!("wait failed: {err}"),
    }
}
