use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{SwapEvent, SwapState};
use crate::daemon::{DaemonState, DaemonSupervisor};
use crate::platform::{BOLTZ_PAYMENT_METHOD, InvoiceGateway};
use crate::proto::boltzrpc::ListSwapsRequest;
use crate::rpc::RpcConnection;
use crate::settings::SettingsStore;
use crate::tenant::CredentialBroker;

const EVENT_CAPACITY: usize = 1024;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Consumer of swap updates. Errors are logged by the bridge and never stop
/// the stream.
#[async_trait]
pub trait SwapListener: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_swap_event(&self, event: &SwapEvent) -> Result<()>;
}

/// Logs every swap update.
#[derive(Debug, Default, Clone, Copy)]
pub struct SwapLogger;

#[async_trait]
impl SwapListener for SwapLogger {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn on_swap_event(&self, event: &SwapEvent) -> Result<()> {
        tracing::info!(
            swap_id = %event.swap_id,
            kind = ?event.kind,
            state = ?event.state,
            status = %event.status,
            tenant_id = event.tenant_id,
            is_auto = event.is_automated,
            "swap update"
        );
        Ok(())
    }
}

/// Fans the daemon's swap update stream out to in-process listeners.
#[derive(Clone)]
pub struct SwapEventBridge {
    tx: broadcast::Sender<SwapEvent>,
    daemon: watch::Receiver<DaemonState>,
    cancel: CancellationToken,
    stream_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    polled: Arc<AtomicBool>,
}

impl SwapEventBridge {
    pub fn new(daemon: watch::Receiver<DaemonState>, cancel: CancellationToken) -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            daemon,
            cancel,
            stream_task: Arc::new(Mutex::new(None)),
            polled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A bridge that stops together with `supervisor`.
    pub fn from_supervisor(supervisor: &DaemonSupervisor) -> Self {
        Self::new(
            supervisor.subscribe_state(),
            supervisor.cancellation().child_token(),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.tx.subscribe()
    }

    /// Delivers `event` to every current subscriber. Returns how many
    /// received it.
    pub fn publish(&self, event: SwapEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Starts the subscription loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.stream_task.lock().expect("stream task mutex poisoned");
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(run_stream(
            self.tx.clone(),
            self.daemon.clone(),
            self.cancel.clone(),
        )));
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .stream_task
            .lock()
            .expect("stream task mutex poisoned")
            .take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "swap stream task join error");
        }
    }

    /// Runs `listener` on every event until the bridge stops. Each event is
    /// handled in its own task so a panicking listener loses only that event.
    pub fn spawn_listener(&self, listener: Arc<dyn SwapListener>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = rx.recv() => received,
                };
                let event = match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(listener = listener.name(), skipped, "swap listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                let swap_id = event.swap_id.clone();
                let handled = tokio::spawn({
                    let listener = listener.clone();
                    async move { listener.on_swap_event(&event).await }
                })
                .await;
                match handled {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(
                            listener = listener.name(),
                            %swap_id,
                            error = %format!("{err:#}"),
                            "could not handle swap update"
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            listener = listener.name(),
                            %swap_id,
                            error = %err,
                            "swap listener panicked"
                        );
                    }
                }
            }
        })
    }

    /// Catch-up pass for updates missed while this process was down. Lists
    /// every store's swaps and publishes those still pending, plus any whose
    /// lockup address is the Boltz destination of an invoice `invoices` still
    /// monitors. Closed history is left alone. Only the first call does
    /// anything; later updates arrive through the stream.
    pub async fn poll_all(
        &self,
        settings: &dyn SettingsStore,
        broker: &CredentialBroker,
        invoices: Option<&dyn InvoiceGateway>,
    ) -> Result<usize> {
        if self.polled.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let open_destinations = match invoices {
            Some(invoices) => open_destinations(invoices).await,
            None => HashSet::new(),
        };
        let mut stores = settings
            .all_settings()
            .await
            .context("load store settings")?
            .into_iter()
            .collect::<Vec<_>>();
        stores.sort_by(|a, b| a.0.cmp(&b.0));

        let mut published = 0;
        for (store_id, store) in stores {
            let conn = match broker.store_connection(&store) {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(%store_id, error = %err, "cannot connect store to boltz");
                    continue;
                }
            };
            match conn.list_swaps(ListSwapsRequest::default()).await {
                Ok(list) => {
                    for event in SwapEvent::from_list(&list) {
                        let invoice_bound = event
                            .lockup_address
                            .as_ref()
                            .is_some_and(|a| open_destinations.contains(a));
                        if event.state != SwapState::Pending && !invoice_bound {
                            continue;
                        }
                        self.publish(event);
                        published += 1;
                    }
                }
                Err(err) if err.is_benign() => {
                    tracing::debug!(%store_id, error = %err, "store has no swaps to poll");
                }
                Err(err) => {
                    tracing::warn!(%store_id, error = %err, "could not poll store swaps");
                }
            }
        }
        tracing::info!(published, "polled swaps on startup");
        Ok(published)
    }
}

async fn open_destinations(invoices: &dyn InvoiceGateway) -> HashSet<String> {
    match invoices.monitored_invoices(BOLTZ_PAYMENT_METHOD).await {
        Ok(open) => open
            .iter()
            .filter_map(|invoice| invoice.prompt(BOLTZ_PAYMENT_METHOD)?.destination.clone())
            .collect(),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "could not list monitored invoices");
            HashSet::new()
        }
    }
}

async fn wait_for_admin(daemon: &mut watch::Receiver<DaemonState>) -> Option<RpcConnection> {
    let state = daemon.wait_for(DaemonState::is_healthy).await.ok()?;
    match &*state {
        DaemonState::Healthy(conn) => Some(conn.clone()),
        _ => None,
    }
}

async fn run_stream(
    tx: broadcast::Sender<SwapEvent>,
    mut daemon: watch::Receiver<DaemonState>,
    cancel: CancellationToken,
) {
    loop {
        let admin = tokio::select! {
            _ = cancel.cancelled() => return,
            admin = wait_for_admin(&mut daemon) => admin,
        };
        let Some(admin) = admin else {
            tracing::debug!("daemon state channel closed, stopping swap stream");
            return;
        };

        match admin.swap_info_stream().await {
            Ok(mut stream) => {
                tracing::info!("subscribed to swap updates");
                loop {
                    let message = tokio::select! {
                        _ = cancel.cancelled() => return,
                        message = stream.message() => message,
                    };
                    match message {
                        Ok(Some(resp)) => {
                            if let Some(event) = SwapEvent::from_response(&resp) {
                                tracing::debug!(
                                    swap_id = %event.swap_id,
                                    status = %event.status,
                                    "swap update"
                                );
                                // No subscribers is not an error.
                                let _ = tx.send(event);
                            }
                        }
                        Ok(None) => {
                            tracing::warn!("swap update stream ended");
                            break;
                        }
                        Err(status) => {
                            tracing::warn!(error = %status, "swap update stream failed");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Boltz daemon is not yet running, cannot subscribe");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
}
