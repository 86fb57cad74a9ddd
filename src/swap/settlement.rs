use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::events::SwapListener;
use super::{
    CurrencyUnit, PaymentAmount, PaymentDetails, PaymentRecord, PaymentStatus,
    STATUS_TRANSACTION_MEMPOOL, SwapEvent, SwapState,
};
use crate::platform::{
    BOLTZ_PAYMENT_METHOD, Invoice, InvoiceEvent, InvoiceExceptionStatus, InvoiceGateway,
    InvoiceStatus, PaymentLedger, PlatformNotification,
};
use crate::proto::boltzrpc as pb;
use crate::settings::SettingsStore;
use crate::tenant::CredentialBroker;

/// Swap progress that produces a payment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Lockup transaction seen in the mempool.
    Mempool,
    Successful,
    Refunded,
    /// Swap failed after the customer locked funds; the lockup still counts
    /// as a payment the merchant has to deal with.
    FailedWithLockup,
}

impl Settlement {
    pub fn classify(event: &SwapEvent) -> Option<Self> {
        match event.state {
            SwapState::Successful => Some(Settlement::Successful),
            SwapState::Refunded => Some(Settlement::Refunded),
            SwapState::Error | SwapState::ServerError if event.lockup_tx_id.is_some() => {
                Some(Settlement::FailedWithLockup)
            }
            SwapState::Pending if event.status == STATUS_TRANSACTION_MEMPOOL => {
                Some(Settlement::Mempool)
            }
            _ => None,
        }
    }

    pub fn payment_status(self) -> PaymentStatus {
        match self {
            Settlement::Successful | Settlement::Refunded => PaymentStatus::Settled,
            Settlement::Mempool | Settlement::FailedWithLockup => PaymentStatus::Processing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Ignored,
    Created(PaymentRecord),
    Updated(PaymentRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialPaymentOutcome {
    NotApplicable,
    /// A new swap was provisioned and the prompt points at its address.
    Reactivated { destination: String },
    /// Provisioning failed; the Boltz prompt was switched off.
    Deactivated,
    /// Provisioning failed and no other payment method remains.
    Invalidated,
}

/// Provisions a fresh swap for the amount an invoice still owes.
#[async_trait]
pub trait PromptProvisioner: Send + Sync {
    /// Returns the address the customer should pay next.
    async fn provision(&self, invoice: &Invoice) -> Result<String>;
}

/// Creates a BTC to L-BTC chain swap paid externally by the customer and
/// received into the store's standalone wallet.
pub struct ChainSwapProvisioner {
    settings: Arc<dyn SettingsStore>,
    broker: CredentialBroker,
}

impl ChainSwapProvisioner {
    pub fn new(settings: Arc<dyn SettingsStore>, broker: CredentialBroker) -> Self {
        Self { settings, broker }
    }
}

#[async_trait]
impl PromptProvisioner for ChainSwapProvisioner {
    async fn provision(&self, invoice: &Invoice) -> Result<String> {
        let settings = self
            .settings
            .settings(&invoice.store_id)
            .await?
            .with_context(|| format!("boltz is not enabled for store {}", invoice.store_id))?;
        let wallet = settings
            .standalone_wallet
            .as_ref()
            .context("store has no standalone wallet")?;
        let conn = self.broker.store_connection(&settings)?;

        let swap = conn
            .create_chain_swap(pb::CreateChainSwapRequest {
                amount: Some(invoice.due.to_sat()),
                pair: Some(pb::Pair {
                    from: pb::Currency::Btc as i32,
                    to: pb::Currency::Lbtc as i32,
                }),
                to_wallet_id: Some(wallet.id),
                external_pay: true,
                ..Default::default()
            })
            .await
            .context("create chain swap")?;
        let address = swap
            .from_data
            .map(|d| d.lockup_address)
            .filter(|a| !a.is_empty())
            .context("chain swap has no lockup address")?;
        tracing::info!(invoice_id = %invoice.id, swap_id = %swap.id, due = %invoice.due, "provisioned swap for remaining amount");
        Ok(address)
    }
}

/// Turns swap progress into invoice payments.
pub struct SettlementReconciler {
    ledger: Arc<dyn PaymentLedger>,
    invoices: Arc<dyn InvoiceGateway>,
    provisioner: Arc<dyn PromptProvisioner>,
    currency: CurrencyUnit,
    payment_method: String,
}

impl SettlementReconciler {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        invoices: Arc<dyn InvoiceGateway>,
        provisioner: Arc<dyn PromptProvisioner>,
        currency: CurrencyUnit,
    ) -> Self {
        Self {
            ledger,
            invoices,
            provisioner,
            currency,
            payment_method: BOLTZ_PAYMENT_METHOD.to_string(),
        }
    }

    /// Upserts the payment for the swap's lockup transaction.
    ///
    /// The first sighting creates the record and announces the payment;
    /// later events rewrite it in place and only ask for re-evaluation. A
    /// settled record stays settled.
    pub async fn handle_swap_event(&self, event: &SwapEvent) -> Result<SettlementOutcome> {
        let Some(settlement) = Settlement::classify(event) else {
            return Ok(SettlementOutcome::Ignored);
        };
        let (Some(lockup_tx), Some(address)) = (&event.lockup_tx_id, &event.lockup_address)
        else {
            tracing::debug!(swap_id = %event.swap_id, "swap has no lockup yet");
            return Ok(SettlementOutcome::Ignored);
        };
        let Some(invoice_id) = self.resolve_invoice(lockup_tx, address).await? else {
            return Ok(SettlementOutcome::Ignored);
        };

        let amount = PaymentAmount::from_sats(event.amount, &self.currency)?;
        let details = PaymentDetails {
            swap_id: event.swap_id.clone(),
            transaction_id: lockup_tx.clone(),
            refund_transaction_id: event.refund_tx_id.clone(),
            refund_address: event.refund_address.clone(),
        };
        let record = PaymentRecord {
            id: lockup_tx.clone(),
            status: settlement.payment_status(),
            amount,
            currency: self.currency.code.clone(),
            details,
        };

        if self
            .ledger
            .insert_payment(&invoice_id, &record)
            .await
            .context("insert payment")?
        {
            tracing::info!(
                %invoice_id,
                payment_id = %record.id,
                status = ?record.status,
                amount = %record.amount,
                "payment received through boltz"
            );
            self.invoices
                .notify(PlatformNotification::PaymentReceived {
                    invoice_id: invoice_id.clone(),
                    payment_id: record.id.clone(),
                })
                .await?;
            return Ok(SettlementOutcome::Created(record));
        }

        let existing = self
            .ledger
            .payment(&invoice_id, &record.id)
            .await?
            .with_context(|| format!("payment {} vanished", record.id))?;
        let details = PaymentDetails {
            refund_transaction_id: record
                .details
                .refund_transaction_id
                .or(existing.details.refund_transaction_id),
            refund_address: record
                .details
                .refund_address
                .or(existing.details.refund_address),
            ..record.details
        };
        let updated = PaymentRecord {
            status: existing.status.max(record.status),
            details,
            ..record
        };
        self.ledger
            .update_payment(&invoice_id, &updated)
            .await
            .context("update payment")?;
        tracing::info!(
            %invoice_id,
            payment_id = %updated.id,
            status = ?updated.status,
            "payment updated"
        );
        self.invoices
            .notify(PlatformNotification::InvoiceNeedsUpdate { invoice_id })
            .await?;
        Ok(SettlementOutcome::Updated(updated))
    }

    /// A lockup already on record stays with its invoice. Unseen lockups are
    /// matched by the address the invoice's Boltz prompt currently shows.
    async fn resolve_invoice(&self, lockup_tx: &str, address: &str) -> Result<Option<String>> {
        if let Some(invoice_id) = self
            .ledger
            .invoice_for_payment(lockup_tx)
            .await
            .context("look up invoice by payment")?
        {
            return Ok(Some(invoice_id));
        }
        let invoice = self
            .invoices
            .invoice_for_address(&self.payment_method, address)
            .await
            .context("look up invoice by lockup address")?;
        Ok(invoice.map(|invoice| invoice.id))
    }

    /// Reacts to a partial payment by provisioning a new swap for the rest.
    /// Failures end in invoice state changes and log entries, never errors.
    pub async fn handle_invoice_event(&self, event: &InvoiceEvent) -> PartialPaymentOutcome {
        let invoice_id = event.invoice_id();
        if let InvoiceEvent::DataChanged {
            status, exception, ..
        } = event
            && (*status != InvoiceStatus::New || *exception != InvoiceExceptionStatus::PaidPartial)
        {
            return PartialPaymentOutcome::NotApplicable;
        }

        let invoice = match self.invoices.invoice(invoice_id).await {
            Ok(Some(invoice)) => invoice,
            Ok(None) => return PartialPaymentOutcome::NotApplicable,
            Err(err) => {
                tracing::warn!(invoice_id, error = %format!("{err:#}"), "could not load invoice");
                return PartialPaymentOutcome::NotApplicable;
            }
        };
        if invoice.status != InvoiceStatus::New
            || invoice.exception != InvoiceExceptionStatus::PaidPartial
            || invoice.due.to_sat() == 0
        {
            return PartialPaymentOutcome::NotApplicable;
        }
        match invoice.prompt(&self.payment_method) {
            Some(prompt) if prompt.active => {}
            _ => return PartialPaymentOutcome::NotApplicable,
        }

        let failure = match self.provisioner.provision(&invoice).await {
            Ok(destination) => match self
                .invoices
                .activate_prompt(&invoice.id, &self.payment_method, &destination)
                .await
            {
                Ok(()) => {
                    tracing::info!(invoice_id, %destination, "reactivated boltz payment method");
                    return PartialPaymentOutcome::Reactivated { destination };
                }
                Err(err) => err,
            },
            Err(err) => err,
        };
        self.abandon_prompt(&invoice, failure).await
    }

    async fn abandon_prompt(&self, invoice: &Invoice, failure: anyhow::Error) -> PartialPaymentOutcome {
        tracing::warn!(invoice_id = %invoice.id, error = %format!("{failure:#}"), "could not reactivate boltz payment method");

        if let Err(err) = self
            .invoices
            .deactivate_prompt(&invoice.id, &self.payment_method)
            .await
        {
            tracing::warn!(invoice_id = %invoice.id, error = %format!("{err:#}"), "could not deactivate boltz prompt");
        }

        let only_method = invoice
            .prompts
            .iter()
            .all(|p| p.payment_method == self.payment_method);
        if !only_method {
            self.log(invoice, &format!("Boltz payment method deactivated: {failure:#}"))
                .await;
            return PartialPaymentOutcome::Deactivated;
        }

        if let Err(err) = self
            .invoices
            .mark_invalid(&invoice.id, InvoiceExceptionStatus::PaidPartial)
            .await
        {
            tracing::error!(invoice_id = %invoice.id, error = %format!("{err:#}"), "could not invalidate invoice");
        }
        self.log(
            invoice,
            &format!("Invoice paid partially and no payment method remains: {failure:#}"),
        )
        .await;
        PartialPaymentOutcome::Invalidated
    }

    async fn log(&self, invoice: &Invoice, message: &str) {
        if let Err(err) = self.invoices.log(&invoice.id, message).await {
            tracing::warn!(invoice_id = %invoice.id, error = %format!("{err:#}"), "could not write invoice log");
        }
    }

    /// Handles invoice events until `cancel` fires. Events run concurrently;
    /// their results are collected so none is left detached.
    pub async fn run_invoice_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<InvoiceEvent>,
        cancel: CancellationToken,
    ) {
        let mut running = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        let this = self.clone();
                        running.spawn(async move { this.handle_invoice_event(&event).await });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "invoice event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(done) = running.join_next(), if !running.is_empty() => {
                    if let Err(err) = done {
                        tracing::error!(error = %err, "invoice event handler panicked");
                    }
                }
            }
        }
        while let Some(done) = running.join_next().await {
            if let Err(err) = done {
                tracing::error!(error = %err, "invoice event handler panicked");
            }
        }
    }
}

#[async_trait]
impl SwapListener for SettlementReconciler {
    fn name(&self) -> &'static str {
        "settlement"
    }

    async fn on_swap_event(&self, event: &SwapEvent) -> Result<()> {
        self.handle_swap_event(event).await.map(|_| ())
    }
}
