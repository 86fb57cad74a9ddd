use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use boltz_bridge::daemon::{DaemonState, SupervisorConfig};
use boltz_bridge::proto::autoswaprpc as autoswap;
use boltz_bridge::proto::boltzrpc as pb;
use boltz_bridge::rpc::{ConnectionPool, RpcConnection};
use boltz_bridge::settings::{SettingsStore, SwapMode, WalletRef};
use boltz_bridge::swap::SwapEvent;
use boltz_bridge::swap::store::SqliteStore;
use boltz_bridge::tenant::CredentialBroker;
use clap::{Parser as _, Subcommand};
use serde_json::json;
use tokio::sync::watch;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:9002")]
    grpc_url: String,

    /// Daemon data directory holding `macaroons/admin.macaroon`.
    #[arg(long)]
    data_dir: PathBuf,

    #[arg(long, default_value = "boltz-bridge.sqlite")]
    store_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Info,
    Swaps {
        /// List the swaps of this store's tenant instead of all swaps.
        #[arg(long)]
        store_id: Option<String>,
    },
    Onboard {
        #[arg(long)]
        store_id: String,

        #[arg(long)]
        rebalance: bool,

        #[arg(long, requires = "wallet_name")]
        wallet_id: Option<u64>,

        #[arg(long)]
        wallet_name: Option<String>,
    },
    Disable {
        #[arg(long)]
        store_id: String,
    },
    /// Shows one swap by id.
    Swap {
        id: String,

        #[arg(long)]
        store_id: Option<String>,
    },
    Wallets {
        #[arg(long)]
        store_id: Option<String>,
    },
    AutoswapConfig {
        #[arg(long)]
        store_id: String,
    },
    AutoswapStatus {
        #[arg(long)]
        store_id: String,
    },
    /// Swaps AutoSwap would run right now for the store.
    Recommendations {
        #[arg(long)]
        store_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    boltz_bridge::logging::init().ok();
    let args = Args::parse();

    let macaroon_path = SupervisorConfig::new(args.data_dir).admin_macaroon_path();
    let macaroon = std::fs::read(&macaroon_path)
        .with_context(|| format!("read admin macaroon {}", macaroon_path.display()))?;

    let pool = Arc::new(ConnectionPool::new());
    let admin = pool
        .connect(&args.grpc_url, &hex::encode(macaroon), None)
        .context("connect to boltzd")?;
    let (_state, daemon) = watch::channel(DaemonState::Healthy(admin.clone()));
    let broker = CredentialBroker::new(pool, daemon);
    let store = Mutex::new(SqliteStore::open(args.store_path).context("open sqlite store")?);

    let out = match args.command {
        Command::Info => {
            let info = admin.get_info().await.context("GetInfo")?;
            json!({
              "version": info.version,
              "network": info.network,
              "block_height": info.block_height,
              "node": info.node,
              "pending_swaps": info.pending_swaps,
              "pending_reverse_swaps": info.pending_reverse_swaps,
              "pending_chain_swaps": info.pending_chain_swaps,
            })
        }
        Command::Swaps { store_id } => {
            let conn = connection(store_id.as_deref(), &store, &broker, &admin).await?;
            let list = conn
                .list_swaps(pb::ListSwapsRequest::default())
                .await
                .context("ListSwaps")?;
            let swaps = SwapEvent::from_list(&list)
                .into_iter()
                .map(swap_json)
                .collect::<Vec<_>>();
            json!({ "swaps": swaps })
        }
        Command::Onboard {
            store_id,
            rebalance,
            wallet_id,
            wallet_name,
        } => {
            let mode = if rebalance {
                SwapMode::Rebalance
            } else {
                SwapMode::Standalone
            };
            let wallet = wallet_id
                .zip(wallet_name)
                .map(|(id, name)| WalletRef { id, name });
            let settings = broker
                .enable_store(&store_id, mode, wallet, &store)
                .await
                .context("enable store")?;
            json!({
              "store_id": store_id,
              "mode": settings.mode,
              "grpc_url": settings.grpc_url,
              "tenant_id": settings.credential.tenant_id,
              "standalone_wallet": settings.standalone_wallet,
            })
        }
        Command::Disable { store_id } => {
            broker
                .disable_store(&store_id, &store)
                .await
                .context("disable store")?;
            json!({ "store_id": store_id, "disabled": true })
        }
        Command::Swap { id, store_id } => {
            let conn = connection(store_id.as_deref(), &store, &broker, &admin).await?;
            let resp = conn.swap_info(&id).await.context("GetSwapInfo")?;
            let event = SwapEvent::from_response(&resp)
                .with_context(|| format!("daemon returned no swap for {id}"))?;
            swap_json(event)
        }
        Command::Wallets { store_id } => {
            let conn = connection(store_id.as_deref(), &store, &broker, &admin).await?;
            let wallets = conn
                .wallets()
                .await
                .context("GetWallets")?
                .into_iter()
                .map(|w| {
                    json!({
                      "id": w.id,
                      "name": w.name,
                      "currency": pb::Currency::try_from(w.currency)
                          .map(|c| c.as_str_name())
                          .unwrap_or("UNKNOWN"),
                      "readonly": w.readonly,
                      "tenant_id": w.tenant_id,
                      "balance_sat": w.balance.map(|b| b.total),
                    })
                })
                .collect::<Vec<_>>();
            json!({ "wallets": wallets })
        }
        Command::AutoswapStatus { store_id } => {
            let conn = connection(Some(&store_id), &store, &broker, &admin).await?;
            let status = conn.autoswap_status().await.context("GetStatus")?;
            let render = |s: Option<autoswap::Status>| {
                s.map(|s| {
                    json!({
                      "running": s.running,
                      "description": s.description,
                      "error": s.error,
                    })
                })
            };
            json!({
              "store_id": store_id,
              "lightning": render(status.lightning),
              "chain": render(status.chain),
            })
        }
        Command::Recommendations { store_id } => {
            let conn = connection(Some(&store_id), &store, &broker, &admin).await?;
            let recommendations = conn
                .autoswap_recommendations()
                .await
                .context("GetRecommendations")?;
            let render = |list: Vec<autoswap::Recommendation>| {
                list.into_iter()
                    .map(|r| {
                        json!({
                          "type": r.r#type,
                          "amount_sat": r.amount,
                          "fee_estimate_sat": r.fee_estimate,
                          "dismissed_reasons": r.dismissed_reasons,
                        })
                    })
                    .collect::<Vec<_>>()
            };
            json!({
              "store_id": store_id,
              "lightning": render(recommendations.lightning),
              "chain": render(recommendations.chain),
            })
        }
        Command::AutoswapConfig { store_id } => {
            let conn = connection(Some(&store_id), &store, &broker, &admin).await?;
            match conn.autoswap_config().await {
                Ok(config) => json!({
                  "store_id": store_id,
                  "chain": config.chain.map(|c| json!({
                    "enabled": c.enabled,
                    "to_address": c.to_address,
                    "from_wallet": c.from_wallet,
                    "to_wallet": c.to_wallet,
                    "max_balance": c.max_balance,
                    "reserve_balance": c.reserve_balance,
                  })),
                  "lightning": config.lightning.map(|l| json!({
                    "enabled": l.enabled,
                    "static_address": l.static_address,
                    "wallet": l.wallet,
                    "inbound_balance_percent": l.inbound_balance_percent,
                    "outbound_balance_percent": l.outbound_balance_percent,
                  })),
                }),
                Err(err) if err.is_benign() => json!({ "store_id": store_id, "configured": false }),
                Err(err) => return Err(err).context("GetConfig"),
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// The store's tenant connection, or the admin connection without a store.
async fn connection(
    store_id: Option<&str>,
    store: &Mutex<SqliteStore>,
    broker: &CredentialBroker,
    admin: &RpcConnection,
) -> Result<RpcConnection> {
    let Some(store_id) = store_id else {
        return Ok(admin.clone());
    };
    let settings = store
        .settings(store_id)
        .await?
        .with_context(|| format!("boltz is not enabled for store {store_id}"))?;
    Ok(broker.store_connection(&settings)?)
}

fn swap_json(event: SwapEvent) -> serde_json::Value {
    json!({
      "swap_id": event.swap_id,
      "kind": event.kind,
      "state": event.state,
      "status": event.status,
      "is_auto": event.is_automated,
      "tenant_id": event.tenant_id,
      "lockup_address": event.lockup_address,
      "lockup_transaction_id": event.lockup_tx_id,
      "amount_sat": event.amount.to_sat(),
    })
}
