use std::collections::HashMap;
use std::sync::Mutex;

use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status, Streaming};

use crate::proto::autoswaprpc as autoswap;
use crate::proto::autoswaprpc::auto_swap_client::AutoSwapClient;
use crate::proto::boltzrpc as pb;
use crate::proto::boltzrpc::boltz_client::BoltzClient;

const MACAROON_HEADER: &str = "macaroon";
const TENANT_HEADER: &str = "tenant";

/// Failure talking to the daemon.
///
/// `NotConfigured` is the daemon's answer for features that were never set up
/// (AutoSwap without a config, for instance); callers treat it as an expected
/// state rather than an error worth surfacing.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("daemon unavailable: {0}")]
    Unavailable(String),
    #[error("daemon returned {code:?}: {message}")]
    Remote { code: Code, message: String },
    #[error("invalid daemon address: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("credential is not valid metadata")]
    InvalidCredential,
}

impl RpcError {
    pub fn is_benign(&self) -> bool {
        matches!(self, RpcError::NotConfigured(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Remote { code: Code::NotFound, .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            RpcError::Remote {
                code: Code::AlreadyExists,
                ..
            }
        )
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::Unavailable => RpcError::Unavailable(message),
            Code::NotFound | Code::FailedPrecondition | Code::Unknown
                if message.to_ascii_lowercase().contains("not configured") =>
            {
                RpcError::NotConfigured(message)
            }
            code => RpcError::Remote { code, message },
        }
    }
}

/// Per-call credential metadata. Every request made through an
/// [`RpcConnection`] carries the macaroon and, for tenant connections, the
/// tenant id.
#[derive(Debug, Clone)]
pub struct Credentials {
    macaroon: MetadataValue<Ascii>,
    tenant: Option<MetadataValue<Ascii>>,
}

impl Interceptor for Credentials {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let metadata = request.metadata_mut();
        metadata.insert(MACAROON_HEADER, self.macaroon.clone());
        if let Some(tenant) = &self.tenant {
            metadata.insert(TENANT_HEADER, tenant.clone());
        }
        Ok(request)
    }
}

type Authed = InterceptedService<Channel, Credentials>;

#[derive(Debug, Clone)]
pub struct RpcConnection {
    address: String,
    token: String,
    tenant_id: Option<u64>,
    channel: Channel,
    credentials: Credentials,
}

impl RpcConnection {
    fn new(
        address: String,
        token: String,
        tenant_id: Option<u64>,
        channel: Channel,
    ) -> Result<Self, RpcError> {
        let macaroon = token
            .parse::<MetadataValue<Ascii>>()
            .map_err(|_| RpcError::InvalidCredential)?;
        let tenant = tenant_id
            .map(|id| id.to_string().parse::<MetadataValue<Ascii>>())
            .transpose()
            .map_err(|_| RpcError::InvalidCredential)?;
        Ok(Self {
            address,
            token,
            tenant_id,
            channel,
            credentials: Credentials { macaroon, tenant },
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Hex-encoded macaroon presented with every call.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn tenant_id(&self) -> Option<u64> {
        self.tenant_id
    }

    pub fn boltz(&self) -> BoltzClient<Authed> {
        BoltzClient::with_interceptor(self.channel.clone(), self.credentials.clone())
    }

    pub fn autoswap(&self) -> AutoSwapClient<Authed> {
        AutoSwapClient::with_interceptor(self.channel.clone(), self.credentials.clone())
    }

    pub async fn get_info(&self) -> Result<pb::GetInfoResponse, RpcError> {
        Ok(self
            .boltz()
            .get_info(pb::GetInfoRequest {})
            .await?
            .into_inner())
    }

    pub async fn list_swaps(
        &self,
        request: pb::ListSwapsRequest,
    ) -> Result<pb::ListSwapsResponse, RpcError> {
        Ok(self.boltz().list_swaps(request).await?.into_inner())
    }

    pub async fn swap_info(&self, id: &str) -> Result<pb::GetSwapInfoResponse, RpcError> {
        Ok(self
            .boltz()
            .get_swap_info(pb::GetSwapInfoRequest { id: id.to_string() })
            .await?
            .into_inner())
    }

    /// Subscribes to updates of every swap visible to this connection.
    pub async fn swap_info_stream(
        &self,
    ) -> Result<Streaming<pb::GetSwapInfoResponse>, RpcError> {
        Ok(self
            .boltz()
            .get_swap_info_stream(pb::GetSwapInfoRequest { id: String::new() })
            .await?
            .into_inner())
    }

    pub async fn create_chain_swap(
        &self,
        request: pb::CreateChainSwapRequest,
    ) -> Result<pb::ChainSwapInfo, RpcError> {
        Ok(self.boltz().create_chain_swap(request).await?.into_inner())
    }

    pub async fn wallets(&self) -> Result<Vec<pb::Wallet>, RpcError> {
        Ok(self
            .boltz()
            .get_wallets(pb::GetWalletsRequest {
                currency: None,
                include_readonly: Some(true),
            })
            .await?
            .into_inner()
            .wallets)
    }

    pub async fn tenant(&self, name: &str) -> Result<Option<pb::Tenant>, RpcError> {
        match self
            .boltz()
            .get_tenant(pb::GetTenantRequest {
                name: name.to_string(),
            })
            .await
        {
            Ok(resp) => Ok(Some(resp.into_inner())),
            Err(status) => {
                let err = RpcError::from(status);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub async fn create_tenant(&self, name: &str) -> Result<pb::Tenant, RpcError> {
        Ok(self
            .boltz()
            .create_tenant(pb::CreateTenantRequest {
                name: name.to_string(),
            })
            .await?
            .into_inner())
    }

    pub async fn bake_macaroon(
        &self,
        tenant_id: u64,
        actions: &[pb::MacaroonAction],
    ) -> Result<String, RpcError> {
        let permissions = actions
            .iter()
            .map(|action| pb::MacaroonPermissions {
                action: *action as i32,
            })
            .collect();
        Ok(self
            .boltz()
            .bake_macaroon(pb::BakeMacaroonRequest {
                tenant_id: Some(tenant_id),
                permissions,
            })
            .await?
            .into_inner()
            .macaroon)
    }

    pub async fn stop(&self) -> Result<(), RpcError> {
        self.boltz().stop(pb::StopRequest {}).await?;
        Ok(())
    }

    pub async fn autoswap_config(&self) -> Result<autoswap::Config, RpcError> {
        Ok(self
            .autoswap()
            .get_config(autoswap::GetConfigRequest {})
            .await?
            .into_inner())
    }

    pub async fn autoswap_status(&self) -> Result<autoswap::GetStatusResponse, RpcError> {
        Ok(self
            .autoswap()
            .get_status(autoswap::GetStatusRequest {})
            .await?
            .into_inner())
    }

    pub async fn autoswap_recommendations(
        &self,
    ) -> Result<autoswap::GetRecommendationsResponse, RpcError> {
        Ok(self
            .autoswap()
            .get_recommendations(autoswap::GetRecommendationsRequest {})
            .await?
            .into_inner())
    }

    /// Overwrites only the chain config fields named in `paths`.
    pub async fn patch_chain_config(
        &self,
        config: autoswap::ChainConfig,
        paths: &[&str],
    ) -> Result<autoswap::Config, RpcError> {
        Ok(self
            .autoswap()
            .update_chain_config(autoswap::UpdateChainConfigRequest {
                reset: None,
                config: Some(config),
                field_mask: Some(field_mask(paths)),
            })
            .await?
            .into_inner())
    }

    /// Overwrites only the lightning config fields named in `paths`.
    pub async fn patch_lightning_config(
        &self,
        config: autoswap::LightningConfig,
        paths: &[&str],
    ) -> Result<autoswap::Config, RpcError> {
        Ok(self
            .autoswap()
            .update_lightning_config(autoswap::UpdateLightningConfigRequest {
                reset: None,
                config: Some(config),
                field_mask: Some(field_mask(paths)),
            })
            .await?
            .into_inner())
    }
}

fn field_mask(paths: &[&str]) -> autoswap::FieldMask {
    autoswap::FieldMask {
        paths: paths.iter().map(|p| p.to_string()).collect(),
    }
}

/// Channels to daemon endpoints, shared by every connection built from the
/// same address. Owned by the supervisor and cleared when it stops.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    channels: Mutex<HashMap<String, Channel>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a connection to `address` presenting `token`. The underlying
    /// channel connects lazily on first use.
    pub fn connect(
        &self,
        address: &str,
        token: &str,
        tenant_id: Option<u64>,
    ) -> Result<RpcConnection, RpcError> {
        let channel = {
            let mut channels = self.channels.lock().expect("channel cache mutex poisoned");
            match channels.get(address) {
                Some(channel) => channel.clone(),
                None => {
                    let channel = Endpoint::from_shared(address.to_string())?.connect_lazy();
                    channels.insert(address.to_string(), channel.clone());
                    channel
                }
            }
        };
        RpcConnection::new(address.to_string(), token.to_string(), tenant_id, channel)
    }

    pub fn clear(&self) {
        self.channels
            .lock()
            .expect("channel cache mutex poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.channels
            .lock()
            .expect("channel cache mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
