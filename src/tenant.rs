use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::daemon::{DaemonState, DaemonSupervisor};
use crate::proto::boltzrpc::MacaroonAction;
use crate::rpc::{ConnectionPool, RpcConnection, RpcError};
use crate::settings::{SettingsStore, StoreSwapSettings, SwapMode, WalletRef};

/// Tenant the daemon creates for its admin macaroon.
pub const ADMIN_TENANT_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub read: bool,
    pub write: bool,
}

impl Scope {
    pub const READ_WRITE: Scope = Scope {
        read: true,
        write: true,
    };
}

/// Scoped daemon credential of one store. Never mutated after issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCredential {
    pub tenant_id: u64,
    /// Hex-encoded macaroon.
    pub token: String,
    pub scope: Scope,
}

impl TenantCredential {
    pub fn is_admin(&self) -> bool {
        self.tenant_id == ADMIN_TENANT_ID
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Boltz daemon is not available")]
    DaemonUnavailable,
    #[error("rebalance mode is already used by store {0}")]
    RebalanceInUse(String),
    #[error("Error connecting to Boltz: {0}")]
    Rpc(#[from] RpcError),
    #[error("settings store: {0:#}")]
    Settings(anyhow::Error),
}

pub fn tenant_name(store_id: &str) -> String {
    format!("store-{store_id}")
}

/// Mints per-store credentials through the admin connection.
#[derive(Debug, Clone)]
pub struct CredentialBroker {
    pool: Arc<ConnectionPool>,
    daemon: watch::Receiver<DaemonState>,
}

impl CredentialBroker {
    pub fn new(pool: Arc<ConnectionPool>, daemon: watch::Receiver<DaemonState>) -> Self {
        Self { pool, daemon }
    }

    pub fn from_supervisor(supervisor: &DaemonSupervisor) -> Self {
        Self::new(supervisor.pool().clone(), supervisor.subscribe_state())
    }

    fn admin(&self) -> Result<RpcConnection, BrokerError> {
        match &*self.daemon.borrow() {
            DaemonState::Healthy(conn) => Ok(conn.clone()),
            _ => Err(BrokerError::DaemonUnavailable),
        }
    }

    /// Looks up or creates the store's tenant and bakes a fresh read+write
    /// macaroon for it. Safe to call repeatedly.
    pub async fn ensure_tenant(&self, store_id: &str) -> Result<TenantCredential, BrokerError> {
        let admin = self.admin()?;
        let name = tenant_name(store_id);
        let tenant = match admin.tenant(&name).await? {
            Some(tenant) => tenant,
            None => match admin.create_tenant(&name).await {
                Ok(tenant) => {
                    tracing::info!(store_id, tenant_id = tenant.id, "created boltz tenant");
                    tenant
                }
                // A concurrent onboarding of the same store created it first.
                Err(err) if err.is_already_exists() => admin
                    .tenant(&name)
                    .await?
                    .ok_or(BrokerError::Rpc(err))?,
                Err(err) => return Err(err.into()),
            },
        };
        let token = admin
            .bake_macaroon(tenant.id, &[MacaroonAction::Read, MacaroonAction::Write])
            .await?;
        Ok(TenantCredential {
            tenant_id: tenant.id,
            token,
            scope: Scope::READ_WRITE,
        })
    }

    /// The daemon-wide admin credential, handed to the single rebalance store.
    pub fn rebalance_credential(&self) -> Result<TenantCredential, BrokerError> {
        let admin = self.admin()?;
        Ok(TenantCredential {
            tenant_id: ADMIN_TENANT_ID,
            token: admin.token().to_string(),
            scope: Scope::READ_WRITE,
        })
    }

    pub fn store_connection(
        &self,
        settings: &StoreSwapSettings,
    ) -> Result<RpcConnection, BrokerError> {
        let tenant = (!settings.credential.is_admin()).then_some(settings.credential.tenant_id);
        Ok(self
            .pool
            .connect(&settings.grpc_url, &settings.credential.token, tenant)?)
    }

    /// Issues credentials for `store_id` in `mode` and persists the settings.
    pub async fn enable_store(
        &self,
        store_id: &str,
        mode: SwapMode,
        standalone_wallet: Option<WalletRef>,
        store: &dyn SettingsStore,
    ) -> Result<StoreSwapSettings, BrokerError> {
        let admin = self.admin()?;
        let credential = match mode {
            SwapMode::Standalone => self.ensure_tenant(store_id).await?,
            SwapMode::Rebalance => {
                let holder = store
                    .rebalance_store()
                    .await
                    .map_err(BrokerError::Settings)?;
                if let Some(holder) = holder
                    && holder != store_id
                {
                    return Err(BrokerError::RebalanceInUse(holder));
                }
                self.rebalance_credential()?
            }
        };
        let settings = StoreSwapSettings {
            mode,
            grpc_url: admin.address().to_string(),
            credential,
            standalone_wallet,
        };
        store
            .update_settings(store_id, Some(settings.clone()))
            .await
            .map_err(BrokerError::Settings)?;
        tracing::info!(store_id, ?mode, tenant_id = settings.credential.tenant_id, "enabled boltz for store");
        Ok(settings)
    }

    pub async fn disable_store(
        &self,
        store_id: &str,
        store: &dyn SettingsStore,
    ) -> Result<(), BrokerError> {
        store
            .update_settings(store_id, None)
            .await
            .map_err(BrokerError::Settings)?;
        tracing::info!(store_id, "disabled boltz for store");
        Ok(())
    }
}
