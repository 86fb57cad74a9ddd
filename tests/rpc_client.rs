mod support {
    pub mod fake_daemon;
    pub mod port;
    pub mod wait;
}

use std::sync::Mutex;

use anyhow::{Context as _, Result};
use boltz_bridge::proto::autoswaprpc as autoswap;
use boltz_bridge::proto::boltzrpc as pb;
use boltz_bridge::settings::SwapMode;
use boltz_bridge::swap::store::SqliteStore;
use boltz_bridge::swap::{SwapEvent, SwapKind};
use boltz_bridge::tenant::CredentialBroker;

use support::fake_daemon::FakeDaemon;

#[tokio::test]
async fn tenant_connection_reads_swaps_and_wallets() -> Result<()> {
    let daemon = FakeDaemon::start().await?;
    let (pool, state) = daemon.healthy()?;
    let broker = CredentialBroker::new(pool, state.subscribe());
    let dir = tempfile::tempdir().context("create tempdir")?;
    let store = Mutex::new(SqliteStore::open(dir.path().join("bridge.sqlite3"))?);
    let settings = broker
        .enable_store("shop", SwapMode::Standalone, None, &store)
        .await?;
    let tenant_id = settings.credential.tenant_id;
    daemon.state().swaps.reverse_swaps = vec![pb::ReverseSwapInfo {
        id: "rev-1".to_string(),
        state: pb::SwapState::Pending as i32,
        status: "swap.created".to_string(),
        claim_address: "bcrt1qclaim".to_string(),
        tenant_id,
        ..Default::default()
    }];

    let conn = broker.store_connection(&settings)?;
    let resp = conn.swap_info("rev-1").await?;
    let event = SwapEvent::from_response(&resp).context("no swap in response")?;
    assert_eq!(event.kind, SwapKind::Reverse);
    assert_eq!(event.claim_address.as_deref(), Some("bcrt1qclaim"));

    let err = conn.swap_info("missing").await.unwrap_err();
    assert!(err.is_not_found(), "{err}");

    let wallets = conn.wallets().await?;
    assert_eq!(wallets.len(), 1);
    assert_eq!(wallets[0].tenant_id, tenant_id);
    assert_eq!(wallets[0].id, tenant_id * 10);

    let calls = daemon.calls("GetWallets");
    assert_eq!(calls[0].tenant, Some(tenant_id.to_string()));
    Ok(())
}

#[tokio::test]
async fn autoswap_status_and_recommendations_follow_the_config() -> Result<()> {
    let daemon = FakeDaemon::start().await?;
    let (pool, state) = daemon.healthy()?;
    let broker = CredentialBroker::new(pool, state.subscribe());
    let dir = tempfile::tempdir().context("create tempdir")?;
    let store = Mutex::new(SqliteStore::open(dir.path().join("bridge.sqlite3"))?);
    let settings = broker
        .enable_store("shop", SwapMode::Standalone, None, &store)
        .await?;
    let conn = broker.store_connection(&settings)?;

    let status = conn.autoswap_status().await?;
    assert!(!status.chain.context("chain status")?.running);
    assert!(conn.autoswap_recommendations().await?.chain.is_empty());

    daemon.state().autoswap = Some(autoswap::Config {
        chain: Some(autoswap::ChainConfig {
            enabled: true,
            max_balance: 500_000,
            ..Default::default()
        }),
        lightning: None,
    });

    let status = conn.autoswap_status().await?;
    assert!(status.chain.context("chain status")?.running);
    assert!(!status.lightning.context("lightning status")?.running);

    let recommendations = conn.autoswap_recommendations().await?;
    assert!(recommendations.lightning.is_empty());
    assert_eq!(recommendations.chain.len(), 1);
    assert_eq!(recommendations.chain[0].amount, 500_000);
    assert_eq!(daemon.calls("GetRecommendations").len(), 2);
    Ok(())
}
