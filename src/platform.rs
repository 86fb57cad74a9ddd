//! Interfaces of the payment platform this crate plugs into.

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::Amount;

use crate::swap::{PaymentRecord, SwapKind};

/// Payment method id under which invoices expose Boltz swap destinations.
pub const BOLTZ_PAYMENT_METHOD: &str = "BTC-BOLTZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    New,
    Processing,
    Settled,
    Invalid,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceExceptionStatus {
    None,
    PaidPartial,
    PaidOver,
    PaidLate,
    Marked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentPrompt {
    pub payment_method: String,
    pub destination: Option<String>,
    pub active: bool,
}

/// The invoice fields the reconciler reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub id: String,
    pub store_id: String,
    pub status: InvoiceStatus,
    pub exception: InvoiceExceptionStatus,
    pub due: Amount,
    pub prompts: Vec<PaymentPrompt>,
}

impl Invoice {
    pub fn prompt(&self, payment_method: &str) -> Option<&PaymentPrompt> {
        self.prompts
            .iter()
            .find(|p| p.payment_method == payment_method)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceEvent {
    PaymentReceived {
        invoice_id: String,
        payment_method: String,
    },
    DataChanged {
        invoice_id: String,
        status: InvoiceStatus,
        exception: InvoiceExceptionStatus,
    },
}

impl InvoiceEvent {
    pub fn invoice_id(&self) -> &str {
        match self {
            InvoiceEvent::PaymentReceived { invoice_id, .. }
            | InvoiceEvent::DataChanged { invoice_id, .. } => invoice_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformNotification {
    /// First sighting of a payment; drives receipts and webhooks.
    PaymentReceived {
        invoice_id: String,
        payment_id: String,
    },
    /// An existing payment changed; the invoice state must be re-evaluated.
    InvoiceNeedsUpdate { invoice_id: String },
}

#[async_trait]
pub trait InvoiceGateway: Send + Sync {
    async fn invoice(&self, invoice_id: &str) -> Result<Option<Invoice>>;

    async fn invoice_for_address(
        &self,
        payment_method: &str,
        address: &str,
    ) -> Result<Option<Invoice>>;

    async fn monitored_invoices(&self, payment_method: &str) -> Result<Vec<Invoice>>;

    /// Points the invoice's prompt for `payment_method` at `destination` and
    /// marks it active.
    async fn activate_prompt(
        &self,
        invoice_id: &str,
        payment_method: &str,
        destination: &str,
    ) -> Result<()>;

    async fn deactivate_prompt(&self, invoice_id: &str, payment_method: &str) -> Result<()>;

    async fn mark_invalid(&self, invoice_id: &str, exception: InvoiceExceptionStatus)
    -> Result<()>;

    async fn log(&self, invoice_id: &str, message: &str) -> Result<()>;

    async fn notify(&self, notification: PlatformNotification) -> Result<()>;
}

/// Payment records of invoices, keyed by `(invoice_id, payment.id)`.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn payment(&self, invoice_id: &str, payment_id: &str) -> Result<Option<PaymentRecord>>;

    /// Invoice already holding a payment with this id. Follow-up events for
    /// a lockup resolve here, since the invoice's prompt may have moved on to
    /// another address since.
    async fn invoice_for_payment(&self, payment_id: &str) -> Result<Option<String>>;

    /// Returns `false` without writing when the id is already recorded.
    async fn insert_payment(&self, invoice_id: &str, payment: &PaymentRecord) -> Result<bool>;

    async fn update_payment(&self, invoice_id: &str, payment: &PaymentRecord) -> Result<()>;

    async fn payments(&self, invoice_id: &str) -> Result<Vec<PaymentRecord>>;
}

/// Receiving addresses of the store's platform wallet.
#[async_trait]
pub trait AddressSource: Send + Sync {
    async fn fresh_address(&self, store_id: &str, kind: SwapKind) -> Result<String>;
}
