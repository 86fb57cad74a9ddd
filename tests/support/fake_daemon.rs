use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use boltz_bridge::daemon::DaemonState;
use boltz_bridge::proto::autoswaprpc as autoswap;
use boltz_bridge::proto::autoswaprpc::auto_swap_server::{AutoSwap, AutoSwapServer};
use boltz_bridge::proto::boltzrpc as pb;
use boltz_bridge::proto::boltzrpc::boltz_server::{Boltz, BoltzServer};
use boltz_bridge::rpc::ConnectionPool;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use super::port::free_port;
use super::wait::wait_for;

/// Hex of `admin`.
pub const ADMIN_TOKEN: &str = "61646d696e";

/// One request as seen by the fake daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: &'static str,
    pub macaroon: Option<String>,
    pub tenant: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigUpdate {
    Chain {
        config: autoswap::ChainConfig,
        paths: Vec<String>,
    },
    Lightning {
        config: autoswap::LightningConfig,
        paths: Vec<String>,
    },
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub calls: Vec<Call>,
    pub tenants: HashMap<String, pb::Tenant>,
    pub swaps: pb::ListSwapsResponse,
    pub autoswap: Option<autoswap::Config>,
    pub config_updates: Vec<ConfigUpdate>,
    pub chain_swap_requests: Vec<pb::CreateChainSwapRequest>,
    pub fail_chain_swaps: bool,
    /// GetTenant answers "not found" this many more times, as if another
    /// caller were creating the tenant concurrently.
    pub hidden_tenant_lookups: usize,
    pub stops: usize,
    subscribers: Vec<mpsc::Sender<Result<pb::GetSwapInfoResponse, Status>>>,
}

/// In-process Boltz + AutoSwap gRPC server with scripted state.
pub struct FakeDaemon {
    addr: SocketAddr,
    state: Arc<Mutex<FakeState>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl FakeDaemon {
    pub async fn start() -> Result<Self> {
        let port = free_port()?;
        Self::start_on(port).await
    }

    pub async fn start_on(port: u16) -> Result<Self> {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
        let state = Arc::new(Mutex::new(FakeState::default()));
        let service = FakeService {
            state: state.clone(),
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let served = Server::builder()
                .add_service(BoltzServer::new(service.clone()))
                .add_service(AutoSwapServer::new(service))
                .serve_with_shutdown(addr, async {
                    shutdown_rx.await.ok();
                })
                .await;
            if let Err(err) = served {
                eprintln!("fake daemon stopped: {err}");
            }
        });

        wait_for("fake daemon listening", Duration::from_secs(10), move || async move {
            Ok(std::net::TcpStream::connect(addr).ok().map(|_| ()))
        })
        .await?;

        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// A pool plus a daemon state channel that reports this fake as healthy,
    /// standing in for a running supervisor.
    pub fn healthy(&self) -> Result<(Arc<ConnectionPool>, watch::Sender<DaemonState>)> {
        let pool = Arc::new(ConnectionPool::new());
        let admin = pool.connect(&self.address(), ADMIN_TOKEN, None)?;
        let (state, _) = watch::channel(DaemonState::Healthy(admin));
        Ok((pool, state))
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake daemon mutex poisoned")
    }

    pub fn calls(&self, method: &str) -> Vec<Call> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn subscribers(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Sends `update` to every open GetSwapInfoStream.
    pub async fn push(&self, update: pb::GetSwapInfoResponse) {
        let subscribers = self.state().subscribers.clone();
        for tx in subscribers {
            let _ = tx.send(Ok(update.clone())).await;
        }
    }

    /// Ends every open GetSwapInfoStream.
    pub fn close_streams(&self) {
        self.state().subscribers.clear();
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.abort();
    }
}

#[derive(Clone)]
struct FakeService {
    state: Arc<Mutex<FakeState>>,
}

fn header<T>(request: &Request<T>, key: &str) -> Option<String> {
    request
        .metadata()
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl FakeService {
    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake daemon mutex poisoned")
    }

    fn record<T>(&self, method: &'static str, request: &Request<T>) {
        self.lock().calls.push(Call {
            method,
            macaroon: header(request, "macaroon"),
            tenant: header(request, "tenant"),
        });
    }

    /// Records the call and returns the locked state for the handler.
    fn serve<T>(
        &self,
        method: &'static str,
        request: &Request<T>,
    ) -> std::sync::MutexGuard<'_, FakeState> {
        self.record(method, request);
        self.lock()
    }
}

fn tenant_filter<T>(request: &Request<T>) -> Option<u64> {
    header(request, "tenant").and_then(|t| t.parse().ok())
}

type SwapStream = Pin<Box<dyn Stream<Item = Result<pb::GetSwapInfoResponse, Status>> + Send>>;

#[tonic::async_trait]
impl Boltz for FakeService {
    async fn get_info(
        &self,
        request: Request<pb::GetInfoRequest>,
    ) -> Result<Response<pb::GetInfoResponse>, Status> {
        let tenant = tenant_filter(&request);
        let state = self.serve("GetInfo", &request);
        let tenant = match tenant {
            Some(id) => state.tenants.values().find(|t| t.id == id).cloned(),
            None => Some(pb::Tenant {
                id: 1,
                name: "admin".to_string(),
            }),
        };
        Ok(Response::new(pb::GetInfoResponse {
            version: "2.3.0".to_string(),
            network: "regtest".to_string(),
            block_height: 101,
            tenant,
            ..Default::default()
        }))
    }

    async fn get_pair_info(
        &self,
        request: Request<pb::GetPairInfoRequest>,
    ) -> Result<Response<pb::PairInfo>, Status> {
        self.record("GetPairInfo", &request);
        Ok(Response::new(pb::PairInfo {
            pair: request.into_inner().pair,
            ..Default::default()
        }))
    }

    async fn get_stats(
        &self,
        request: Request<pb::GetStatsRequest>,
    ) -> Result<Response<pb::GetStatsResponse>, Status> {
        self.record("GetStats", &request);
        Ok(Response::new(pb::GetStatsResponse::default()))
    }

    async fn list_swaps(
        &self,
        request: Request<pb::ListSwapsRequest>,
    ) -> Result<Response<pb::ListSwapsResponse>, Status> {
        let tenant = tenant_filter(&request);
        let state = self.serve("ListSwaps", &request);
        let visible = |id: u64| tenant.is_none_or(|t| t == id);
        Ok(Response::new(pb::ListSwapsResponse {
            swaps: state
                .swaps
                .swaps
                .iter()
                .filter(|s| visible(s.tenant_id))
                .cloned()
                .collect(),
            reverse_swaps: state
                .swaps
                .reverse_swaps
                .iter()
                .filter(|s| visible(s.tenant_id))
                .cloned()
                .collect(),
            chain_swaps: state
                .swaps
                .chain_swaps
                .iter()
                .filter(|s| visible(s.tenant_id))
                .cloned()
                .collect(),
        }))
    }

    async fn get_swap_info(
        &self,
        request: Request<pb::GetSwapInfoRequest>,
    ) -> Result<Response<pb::GetSwapInfoResponse>, Status> {
        let state = self.serve("GetSwapInfo", &request);
        let id = &request.get_ref().id;
        let resp = pb::GetSwapInfoResponse {
            swap: state.swaps.swaps.iter().find(|s| &s.id == id).cloned(),
            reverse_swap: state.swaps.reverse_swaps.iter().find(|s| &s.id == id).cloned(),
            chain_swap: state.swaps.chain_swaps.iter().find(|s| &s.id == id).cloned(),
        };
        if resp == pb::GetSwapInfoResponse::default() {
            return Err(Status::not_found(format!("swap {id} not found")));
        }
        Ok(Response::new(resp))
    }

    type GetSwapInfoStreamStream = SwapStream;

    async fn get_swap_info_stream(
        &self,
        request: Request<pb::GetSwapInfoRequest>,
    ) -> Result<Response<Self::GetSwapInfoStreamStream>, Status> {
        let (tx, rx) = mpsc::channel(64);
        self.serve("GetSwapInfoStream", &request).subscribers.push(tx);
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn create_swap(
        &self,
        request: Request<pb::CreateSwapRequest>,
    ) -> Result<Response<pb::CreateSwapResponse>, Status> {
        self.record("CreateSwap", &request);
        Err(Status::unimplemented("submarine swaps are not scripted"))
    }

    async fn create_reverse_swap(
        &self,
        request: Request<pb::CreateReverseSwapRequest>,
    ) -> Result<Response<pb::CreateReverseSwapResponse>, Status> {
        self.record("CreateReverseSwap", &request);
        Err(Status::unimplemented("reverse swaps are not scripted"))
    }

    async fn create_chain_swap(
        &self,
        request: Request<pb::CreateChainSwapRequest>,
    ) -> Result<Response<pb::ChainSwapInfo>, Status> {
        let tenant_id = tenant_filter(&request).unwrap_or(1);
        let mut state = self.serve("CreateChainSwap", &request);
        if state.fail_chain_swaps {
            return Err(Status::invalid_argument("amount is below the minimum"));
        }
        let req = request.into_inner();
        state.chain_swap_requests.push(req.clone());
        let n = state.chain_swap_requests.len();
        let info = pb::ChainSwapInfo {
            id: format!("chain-{n}"),
            pair: req.pair,
            state: pb::SwapState::Pending as i32,
            status: "swap.created".to_string(),
            from_data: Some(pb::ChainSwapData {
                id: format!("chain-{n}"),
                currency: pb::Currency::Btc as i32,
                amount: req.amount.unwrap_or_default(),
                lockup_address: format!("bcrt1qprovisioned{n}"),
                ..Default::default()
            }),
            to_data: Some(pb::ChainSwapData {
                id: format!("chain-{n}"),
                currency: pb::Currency::Lbtc as i32,
                wallet_id: req.to_wallet_id,
                ..Default::default()
            }),
            tenant_id,
            ..Default::default()
        };
        state.swaps.chain_swaps.push(info.clone());
        Ok(Response::new(info))
    }

    async fn get_wallets(
        &self,
        request: Request<pb::GetWalletsRequest>,
    ) -> Result<Response<pb::Wallets>, Status> {
        let tenant_id = tenant_filter(&request).unwrap_or(1);
        self.record("GetWallets", &request);
        Ok(Response::new(pb::Wallets {
            wallets: vec![pb::Wallet {
                id: tenant_id * 10,
                name: "liquid".to_string(),
                currency: pb::Currency::Lbtc as i32,
                tenant_id,
                ..Default::default()
            }],
        }))
    }

    async fn get_wallet(
        &self,
        request: Request<pb::GetWalletRequest>,
    ) -> Result<Response<pb::Wallet>, Status> {
        self.record("GetWallet", &request);
        Err(Status::not_found("wallet not found"))
    }

    async fn create_wallet(
        &self,
        request: Request<pb::CreateWalletRequest>,
    ) -> Result<Response<pb::CreateWalletResponse>, Status> {
        self.record("CreateWallet", &request);
        Err(Status::unimplemented("wallets are not scripted"))
    }

    async fn import_wallet(
        &self,
        request: Request<pb::ImportWalletRequest>,
    ) -> Result<Response<pb::Wallet>, Status> {
        self.record("ImportWallet", &request);
        Err(Status::unimplemented("wallets are not scripted"))
    }

    async fn remove_wallet(
        &self,
        request: Request<pb::RemoveWalletRequest>,
    ) -> Result<Response<pb::RemoveWalletResponse>, Status> {
        self.record("RemoveWallet", &request);
        Ok(Response::new(pb::RemoveWalletResponse {}))
    }

    async fn create_tenant(
        &self,
        request: Request<pb::CreateTenantRequest>,
    ) -> Result<Response<pb::Tenant>, Status> {
        let mut state = self.serve("CreateTenant", &request);
        let name = request.into_inner().name;
        if state.tenants.contains_key(&name) {
            return Err(Status::already_exists(format!("tenant {name} exists")));
        }
        let tenant = pb::Tenant {
            id: state.tenants.len() as u64 + 2,
            name: name.clone(),
        };
        state.tenants.insert(name, tenant.clone());
        Ok(Response::new(tenant))
    }

    async fn get_tenant(
        &self,
        request: Request<pb::GetTenantRequest>,
    ) -> Result<Response<pb::Tenant>, Status> {
        let mut state = self.serve("GetTenant", &request);
        if state.hidden_tenant_lookups > 0 {
            state.hidden_tenant_lookups -= 1;
            return Err(Status::not_found("tenant not found"));
        }
        match state.tenants.get(&request.get_ref().name) {
            Some(tenant) => Ok(Response::new(tenant.clone())),
            None => Err(Status::not_found("tenant not found")),
        }
    }

    async fn bake_macaroon(
        &self,
        request: Request<pb::BakeMacaroonRequest>,
    ) -> Result<Response<pb::BakeMacaroonResponse>, Status> {
        let state = self.serve("BakeMacaroon", &request);
        let req = request.into_inner();
        let tenant_id = req.tenant_id.unwrap_or(1);
        let baked = state
            .calls
            .iter()
            .filter(|c| c.method == "BakeMacaroon")
            .count();
        Ok(Response::new(pb::BakeMacaroonResponse {
            macaroon: hex::encode(format!("tenant-{tenant_id}-{baked}")),
        }))
    }

    async fn stop(
        &self,
        request: Request<pb::StopRequest>,
    ) -> Result<Response<pb::StopResponse>, Status> {
        self.serve("Stop", &request).stops += 1;
        Ok(Response::new(pb::StopResponse {}))
    }
}

fn masked(paths: &[String], field: &str) -> bool {
    paths.iter().any(|p| p == field)
}

#[tonic::async_trait]
impl AutoSwap for FakeService {
    async fn get_recommendations(
        &self,
        request: Request<autoswap::GetRecommendationsRequest>,
    ) -> Result<Response<autoswap::GetRecommendationsResponse>, Status> {
        let state = self.serve("GetRecommendations", &request);
        let chain = state
            .autoswap
            .as_ref()
            .and_then(|c| c.chain.as_ref())
            .filter(|c| c.enabled)
            .map(|c| autoswap::Recommendation {
                r#type: "chain".to_string(),
                amount: c.max_balance,
                fee_estimate: 250,
                dismissed_reasons: Vec::new(),
            });
        Ok(Response::new(autoswap::GetRecommendationsResponse {
            lightning: Vec::new(),
            chain: chain.into_iter().collect(),
        }))
    }

    async fn get_status(
        &self,
        request: Request<autoswap::GetStatusRequest>,
    ) -> Result<Response<autoswap::GetStatusResponse>, Status> {
        let state = self.serve("GetStatus", &request);
        let status = |enabled: Option<bool>| autoswap::Status {
            running: enabled.unwrap_or(false),
            description: if enabled.is_some() {
                "configured".to_string()
            } else {
                "not configured".to_string()
            },
            error: None,
        };
        let config = state.autoswap.as_ref();
        Ok(Response::new(autoswap::GetStatusResponse {
            lightning: Some(status(
                config.and_then(|c| c.lightning.as_ref()).map(|l| l.enabled),
            )),
            chain: Some(status(config.and_then(|c| c.chain.as_ref()).map(|c| c.enabled))),
        }))
    }

    async fn get_config(
        &self,
        request: Request<autoswap::GetConfigRequest>,
    ) -> Result<Response<autoswap::Config>, Status> {
        let state = self.serve("GetConfig", &request);
        match &state.autoswap {
            Some(config) => Ok(Response::new(config.clone())),
            None => Err(Status::not_found("autoswap not configured")),
        }
    }

    async fn update_lightning_config(
        &self,
        request: Request<autoswap::UpdateLightningConfigRequest>,
    ) -> Result<Response<autoswap::Config>, Status> {
        let mut state = self.serve("UpdateLightningConfig", &request);
        let req = request.into_inner();
        let config = req.config.unwrap_or_default();
        let paths = req.field_mask.map(|m| m.paths).unwrap_or_default();
        let current = state.autoswap.get_or_insert_with(Default::default);
        let lightning = current.lightning.get_or_insert_with(Default::default);
        if masked(&paths, "static_address") {
            lightning.static_address = config.static_address.clone();
        }
        let updated = current.clone();
        state.config_updates.push(ConfigUpdate::Lightning { config, paths });
        Ok(Response::new(updated))
    }

    async fn update_chain_config(
        &self,
        request: Request<autoswap::UpdateChainConfigRequest>,
    ) -> Result<Response<autoswap::Config>, Status> {
        let mut state = self.serve("UpdateChainConfig", &request);
        let req = request.into_inner();
        let config = req.config.unwrap_or_default();
        let paths = req.field_mask.map(|m| m.paths).unwrap_or_default();
        let current = state.autoswap.get_or_insert_with(Default::default);
        let chain = current.chain.get_or_insert_with(Default::default);
        if masked(&paths, "to_address") {
            chain.to_address = config.to_address.clone();
        }
        let updated = current.clone();
        state.config_updates.push(ConfigUpdate::Chain { config, paths });
        Ok(Response::new(updated))
    }
}
