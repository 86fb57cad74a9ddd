use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use boltz_bridge::daemon::release::GithubReleases;
use boltz_bridge::daemon::{DaemonSupervisor, SupervisorConfig};
use boltz_bridge::settings::SettingsStore;
use boltz_bridge::swap::events::{SwapEventBridge, SwapLogger};
use boltz_bridge::swap::store::SqliteStore;
use boltz_bridge::tenant::CredentialBroker;
use clap::Parser as _;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long)]
    data_dir: PathBuf,

    #[arg(long, default_value = "127.0.0.1")]
    rpc_host: String,

    #[arg(long, default_value_t = 9002)]
    rpc_port: u16,

    #[arg(long, default_value = "mainnet")]
    network: String,

    /// Lightning node connection string, e.g.
    /// `type=lnd-grpc;server=https://host:10009;macaroonfilepath=/path`.
    /// Standalone when omitted.
    #[arg(long)]
    node: Option<String>,

    #[arg(long)]
    store_path: PathBuf,

    /// Run this executable instead of downloading the latest release.
    #[arg(long)]
    daemon_binary: Option<PathBuf>,

    #[arg(long, default_value_t = 5)]
    restart_delay_secs: u64,

    #[arg(long, default_value_t = 60)]
    wait_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    boltz_bridge::logging::init().ok();
    let args = Args::parse();

    let store: Arc<dyn SettingsStore> = Arc::new(Mutex::new(
        SqliteStore::open(args.store_path).context("open sqlite store")?,
    ));

    let mut config = SupervisorConfig::new(args.data_dir);
    config.rpc_host = args.rpc_host;
    config.rpc_port = args.rpc_port;
    config.network = args.network;
    config.restart_delay = Duration::from_secs(args.restart_delay_secs);
    config.daemon_binary = args.daemon_binary;
    let use_release = config.daemon_binary.is_none();

    let supervisor = DaemonSupervisor::new(config, Arc::new(GithubReleases::new()));
    if use_release {
        let version = supervisor
            .ensure_binary_available()
            .await
            .context("install boltzd")?;
        tracing::info!(%version, "boltzd available");
    }
    supervisor
        .configure_with_fallback(args.node.as_deref())
        .context("configure boltzd")?;
    supervisor.start().context("start boltzd")?;

    let admin = supervisor
        .wait(Duration::from_secs(args.wait_timeout_secs))
        .await
        .context("wait for boltzd")?;
    let info = admin.get_info().await.context("GetInfo")?;
    tracing::info!(
        address = %admin.address(),
        version = %info.version,
        network = %info.network,
        block_height = info.block_height,
        "boltzd is healthy"
    );

    let bridge = SwapEventBridge::from_supervisor(&supervisor);
    let logger = bridge.spawn_listener(Arc::new(SwapLogger));
    bridge.start();

    let broker = CredentialBroker::from_supervisor(&supervisor);
    if let Err(err) = bridge.poll_all(store.as_ref(), &broker, None).await {
        tracing::warn!(error = %format!("{err:#}"), "startup poll failed");
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");

    supervisor.stop().await;
    bridge.stop().await;
    if let Err(err) = logger.await {
        tracing::warn!(error = %err, "swap listener join error");
    }
    Ok(())
}
