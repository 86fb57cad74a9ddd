use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::Amount;
use boltz_bridge::platform::{
    AddressSource, BOLTZ_PAYMENT_METHOD, Invoice, InvoiceExceptionStatus, InvoiceGateway,
    InvoiceStatus, PaymentPrompt, PlatformNotification,
};
use boltz_bridge::swap::SwapKind;

/// In-memory invoice platform.
#[derive(Debug, Default)]
pub struct FakeGateway {
    invoices: Mutex<HashMap<String, Invoice>>,
    notifications: Mutex<Vec<PlatformNotification>>,
    logs: Mutex<Vec<(String, String)>>,
}

impl FakeGateway {
    pub fn insert(&self, invoice: Invoice) {
        self.invoices
            .lock()
            .expect("invoices mutex poisoned")
            .insert(invoice.id.clone(), invoice);
    }

    pub fn get(&self, invoice_id: &str) -> Option<Invoice> {
        self.invoices
            .lock()
            .expect("invoices mutex poisoned")
            .get(invoice_id)
            .cloned()
    }

    pub fn notifications(&self) -> Vec<PlatformNotification> {
        self.notifications
            .lock()
            .expect("notifications mutex poisoned")
            .clone()
    }

    pub fn logs(&self, invoice_id: &str) -> Vec<String> {
        self.logs
            .lock()
            .expect("logs mutex poisoned")
            .iter()
            .filter(|(id, _)| id == invoice_id)
            .map(|(_, message)| message.clone())
            .collect()
    }

    fn with_invoice(&self, invoice_id: &str, f: impl FnOnce(&mut Invoice)) -> Result<()> {
        let mut invoices = self.invoices.lock().expect("invoices mutex poisoned");
        let invoice = invoices
            .get_mut(invoice_id)
            .ok_or_else(|| anyhow::anyhow!("invoice {invoice_id} not found"))?;
        f(invoice);
        Ok(())
    }
}

/// A new invoice for `store_id` whose Boltz prompt points at `address`.
pub fn boltz_invoice(id: &str, store_id: &str, address: &str, due: Amount) -> Invoice {
    Invoice {
        id: id.to_string(),
        store_id: store_id.to_string(),
        status: InvoiceStatus::New,
        exception: InvoiceExceptionStatus::None,
        due,
        prompts: vec![PaymentPrompt {
            payment_method: BOLTZ_PAYMENT_METHOD.to_string(),
            destination: Some(address.to_string()),
            active: true,
        }],
    }
}

#[async_trait]
impl InvoiceGateway for FakeGateway {
    async fn invoice(&self, invoice_id: &str) -> Result<Option<Invoice>> {
        Ok(self.get(invoice_id))
    }

    async fn invoice_for_address(
        &self,
        payment_method: &str,
        address: &str,
    ) -> Result<Option<Invoice>> {
        Ok(self
            .invoices
            .lock()
            .expect("invoices mutex poisoned")
            .values()
            .find(|invoice| {
                invoice
                    .prompt(payment_method)
                    .is_some_and(|p| p.destination.as_deref() == Some(address))
            })
            .cloned())
    }

    async fn monitored_invoices(&self, payment_method: &str) -> Result<Vec<Invoice>> {
        Ok(self
            .invoices
            .lock()
            .expect("invoices mutex poisoned")
            .values()
            .filter(|invoice| {
                invoice.status == InvoiceStatus::New
                    && invoice.prompt(payment_method).is_some_and(|p| p.active)
            })
            .cloned()
            .collect())
    }

    async fn activate_prompt(
        &self,
        invoice_id: &str,
        payment_method: &str,
        destination: &str,
    ) -> Result<()> {
        self.with_invoice(invoice_id, |invoice| {
            for prompt in &mut invoice.prompts {
                if prompt.payment_method == payment_method {
                    prompt.destination = Some(destination.to_string());
                    prompt.active = true;
                }
            }
        })
    }

    async fn deactivate_prompt(&self, invoice_id: &str, payment_method: &str) -> Result<()> {
        self.with_invoice(invoice_id, |invoice| {
            for prompt in &mut invoice.prompts {
                if prompt.payment_method == payment_method {
                    prompt.active = false;
                }
            }
        })
    }

    async fn mark_invalid(
        &self,
        invoice_id: &str,
        exception: InvoiceExceptionStatus,
    ) -> Result<()> {
        self.with_invoice(invoice_id, |invoice| {
            invoice.status = InvoiceStatus::Invalid;
            invoice.exception = exception;
        })
    }

    async fn log(&self, invoice_id: &str, message: &str) -> Result<()> {
        self.logs
            .lock()
            .expect("logs mutex poisoned")
            .push((invoice_id.to_string(), message.to_string()));
        Ok(())
    }

    async fn notify(&self, notification: PlatformNotification) -> Result<()> {
        self.notifications
            .lock()
            .expect("notifications mutex poisoned")
            .push(notification);
        Ok(())
    }
}

/// Hands out `fresh-<store>-<n>` addresses.
#[derive(Debug, Default)]
pub struct FakeWallet {
    issued: AtomicU64,
}

impl FakeWallet {
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressSource for FakeWallet {
    async fn fresh_address(&self, store_id: &str, _kind: SwapKind) -> Result<String> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("fresh-{store_id}-{n}"))
    }
}
