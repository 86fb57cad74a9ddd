use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tenant::TenantCredential;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapMode {
    /// The store has no Lightning node; the daemon is its Lightning endpoint.
    Standalone,
    /// The daemon rebalances the platform's own Lightning node. At most one
    /// store holds this mode.
    Rebalance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRef {
    pub id: u64,
    pub name: String,
}

/// Per-store integration settings. Persisted by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSwapSettings {
    pub mode: SwapMode,
    pub grpc_url: String,
    pub credential: TenantCredential,
    pub standalone_wallet: Option<WalletRef>,
}

/// Accessor for the platform's settings storage.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn all_settings(&self) -> Result<HashMap<String, StoreSwapSettings>>;

    /// `None` removes the store's settings.
    async fn update_settings(
        &self,
        store_id: &str,
        settings: Option<StoreSwapSettings>,
    ) -> Result<()>;

    async fn settings(&self, store_id: &str) -> Result<Option<StoreSwapSettings>> {
        Ok(self.all_settings().await?.remove(store_id))
    }

    /// Store whose credential belongs to `tenant_id`.
    async fn store_for_tenant(
        &self,
        tenant_id: u64,
    ) -> Result<Option<(String, StoreSwapSettings)>> {
        let mut matches = self
            .all_settings()
            .await?
            .into_iter()
            .filter(|(_, s)| s.credential.tenant_id == tenant_id)
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches.into_iter().next())
    }

    /// Store currently holding rebalance mode, if any.
    async fn rebalance_store(&self) -> Result<Option<String>> {
        let mut stores = self
            .all_settings()
            .await?
            .into_iter()
            .filter(|(_, s)| s.mode == SwapMode::Rebalance)
            .map(|(id, _)| id)
            .collect::<Vec<_>>();
        stores.sort();
        Ok(stores.into_iter().next())
    }
}
