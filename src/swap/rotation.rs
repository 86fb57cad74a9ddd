use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use super::events::SwapListener;
use super::{STATUS_SWAP_CREATED, SwapEvent, SwapKind};
use crate::platform::AddressSource;
use crate::proto::autoswaprpc as autoswap;
use crate::rpc::RpcConnection;
use crate::settings::SettingsStore;
use crate::tenant::CredentialBroker;

const CHAIN_TO_ADDRESS: &str = "to_address";
const LIGHTNING_STATIC_ADDRESS: &str = "static_address";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    NotApplicable,
    /// The configured destination already differs from the swap's.
    AlreadyRotated,
    Rotated { old: String, new: String },
}

/// Keeps AutoSwap from paying into the same address twice: once an automated
/// swap claims the configured destination, the store's config gets a fresh one.
pub struct AddressRotator {
    settings: Arc<dyn SettingsStore>,
    broker: CredentialBroker,
    wallet: Arc<dyn AddressSource>,
}

impl AddressRotator {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        broker: CredentialBroker,
        wallet: Arc<dyn AddressSource>,
    ) -> Self {
        Self {
            settings,
            broker,
            wallet,
        }
    }

    pub async fn handle(&self, event: &SwapEvent) -> Result<RotationOutcome> {
        if !event.is_automated || event.status != STATUS_SWAP_CREATED {
            return Ok(RotationOutcome::NotApplicable);
        }
        let (Some(target), Some(used)) = (Target::of(event.kind), event.destination()) else {
            return Ok(RotationOutcome::NotApplicable);
        };
        let Some((store_id, settings)) = self
            .settings
            .store_for_tenant(event.tenant_id)
            .await
            .context("find store for tenant")?
        else {
            tracing::debug!(tenant_id = event.tenant_id, "no store for tenant");
            return Ok(RotationOutcome::NotApplicable);
        };

        let conn = self.broker.store_connection(&settings)?;
        let config = match conn.autoswap_config().await {
            Ok(config) => config,
            Err(err) if err.is_benign() => return Ok(RotationOutcome::NotApplicable),
            Err(err) => return Err(err).context("get autoswap config"),
        };

        let Some(configured) = target.configured(&config).filter(|a| !a.is_empty()) else {
            return Ok(RotationOutcome::NotApplicable);
        };
        if configured != used {
            return Ok(RotationOutcome::AlreadyRotated);
        }

        let fresh = self
            .wallet
            .fresh_address(&store_id, event.kind)
            .await
            .with_context(|| format!("fresh address for store {store_id}"))?;
        target.replace(&conn, &fresh).await?;

        tracing::info!(
            %store_id,
            swap_id = %event.swap_id,
            old = %used,
            new = %fresh,
            "rotated autoswap address"
        );
        Ok(RotationOutcome::Rotated {
            old: used.to_string(),
            new: fresh,
        })
    }
}

/// The AutoSwap config field an automated swap pays out to.
#[derive(Debug, Clone, Copy)]
enum Target {
    ChainToAddress,
    LightningStaticAddress,
}

impl Target {
    fn of(kind: SwapKind) -> Option<Self> {
        match kind {
            SwapKind::Chain => Some(Target::ChainToAddress),
            SwapKind::Reverse => Some(Target::LightningStaticAddress),
            SwapKind::Submarine => None,
        }
    }

    fn configured(self, config: &autoswap::Config) -> Option<&str> {
        match self {
            Target::ChainToAddress => config.chain.as_ref().map(|c| c.to_address.as_str()),
            Target::LightningStaticAddress => {
                config.lightning.as_ref().map(|c| c.static_address.as_str())
            }
        }
    }

    /// Overwrites only this field with `address`.
    async fn replace(self, conn: &RpcConnection, address: &str) -> Result<()> {
        match self {
            Target::ChainToAddress => {
                conn.patch_chain_config(
                    autoswap::ChainConfig {
                        to_address: address.to_string(),
                        ..Default::default()
                    },
                    &[CHAIN_TO_ADDRESS],
                )
                .await
                .context("update autoswap chain config")?;
            }
            Target::LightningStaticAddress => {
                conn.patch_lightning_config(
                    autoswap::LightningConfig {
                        static_address: address.to_string(),
                        ..Default::default()
                    },
                    &[LIGHTNING_STATIC_ADDRESS],
                )
                .await
                .context("update autoswap lightning config")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SwapListener for AddressRotator {
    fn name(&self) -> &'static str {
        "address-rotation"
    }

    async fn on_swap_event(&self, event: &SwapEvent) -> Result<()> {
        self.handle(event).await.map(|_| ())
    }
}
