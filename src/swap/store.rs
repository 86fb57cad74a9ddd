use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension as _, params};

use super::{PaymentAmount, PaymentDetails, PaymentRecord, PaymentStatus};
use crate::platform::PaymentLedger;
use crate::settings::{SettingsStore, StoreSwapSettings};

/// SQLite persistence for store settings and swap payments.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn put_settings(&mut self, store_id: &str, settings: &StoreSwapSettings) -> Result<()> {
        let json = serde_json::to_string(settings).context("encode store settings")?;
        self.conn
            .execute(
                r#"
INSERT INTO store_settings (store_id, settings_json) VALUES (?1, ?2)
ON CONFLICT(store_id) DO UPDATE SET settings_json = excluded.settings_json
"#,
                params![store_id, json],
            )
            .with_context(|| format!("put settings {store_id}"))?;
        Ok(())
    }

    pub fn delete_settings(&mut self, store_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM store_settings WHERE store_id = ?1",
                params![store_id],
            )
            .with_context(|| format!("delete settings {store_id}"))?;
        Ok(rows == 1)
    }

    pub fn list_settings(&self) -> Result<HashMap<String, StoreSwapSettings>> {
        let mut stmt = self
            .conn
            .prepare("SELECT store_id, settings_json FROM store_settings ORDER BY store_id")
            .context("prepare list settings")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("query list settings")?;

        let mut out = HashMap::new();
        for row in rows {
            let (store_id, json) = row.context("read settings row")?;
            let settings: StoreSwapSettings = serde_json::from_str(&json)
                .with_context(|| format!("decode settings {store_id}"))?;
            out.insert(store_id, settings);
        }
        Ok(out)
    }

    /// Returns `false` when `(invoice_id, payment.id)` already exists.
    pub fn insert_payment(&mut self, invoice_id: &str, payment: &PaymentRecord) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                r#"
INSERT INTO payments (
  invoice_id,
  payment_id,
  status,
  amount_minor,
  amount_divisibility,
  currency,
  swap_id,
  transaction_id,
  refund_transaction_id,
  refund_address
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
)
ON CONFLICT(invoice_id, payment_id) DO NOTHING
"#,
                params![
                    invoice_id,
                    &payment.id,
                    status_to_str(payment.status),
                    payment.amount.minor_units().to_string(),
                    payment.amount.divisibility(),
                    &payment.currency,
                    &payment.details.swap_id,
                    &payment.details.transaction_id,
                    &payment.details.refund_transaction_id,
                    &payment.details.refund_address,
                ],
            )
            .with_context(|| format!("insert payment {invoice_id}/{}", payment.id))?;
        Ok(rows == 1)
    }

    pub fn update_payment(&mut self, invoice_id: &str, payment: &PaymentRecord) -> Result<()> {
        let rows = self
            .conn
            .execute(
                r#"
UPDATE payments SET
  status = ?3,
  amount_minor = ?4,
  amount_divisibility = ?5,
  currency = ?6,
  swap_id = ?7,
  transaction_id = ?8,
  refund_transaction_id = ?9,
  refund_address = ?10
WHERE invoice_id = ?1 AND payment_id = ?2
"#,
                params![
                    invoice_id,
                    &payment.id,
                    status_to_str(payment.status),
                    payment.amount.minor_units().to_string(),
                    payment.amount.divisibility(),
                    &payment.currency,
                    &payment.details.swap_id,
                    &payment.details.transaction_id,
                    &payment.details.refund_transaction_id,
                    &payment.details.refund_address,
                ],
            )
            .with_context(|| format!("update payment {invoice_id}/{}", payment.id))?;
        anyhow::ensure!(rows == 1, "payment not found: {invoice_id}/{}", payment.id);
        Ok(())
    }

    pub fn get_payment(&self, invoice_id: &str, payment_id: &str) -> Result<Option<PaymentRecord>> {
        self.conn
            .query_row(
                &format!("{SELECT_PAYMENT} WHERE invoice_id = ?1 AND payment_id = ?2"),
                params![invoice_id, payment_id],
                payment_from_row,
            )
            .optional()
            .with_context(|| format!("get payment {invoice_id}/{payment_id}"))
    }

    pub fn invoice_for_payment(&self, payment_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT invoice_id FROM payments WHERE payment_id = ?1 ORDER BY invoice_id LIMIT 1",
                params![payment_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("find invoice of payment {payment_id}"))
    }

    pub fn list_payments(&self, invoice_id: &str) -> Result<Vec<PaymentRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{SELECT_PAYMENT} WHERE invoice_id = ?1 ORDER BY payment_id"
            ))
            .context("prepare list payments")?;

        let mut out = Vec::new();
        let rows = stmt
            .query_map(params![invoice_id], payment_from_row)
            .context("query list payments")?;
        for row in rows {
            out.push(row.context("read payment row")?);
        }
        Ok(out)
    }
}

const SELECT_PAYMENT: &str = r#"
SELECT
  payment_id,
  status,
  amount_minor,
  amount_divisibility,
  currency,
  swap_id,
  transaction_id,
  refund_transaction_id,
  refund_address
FROM payments
"#;

fn payment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let status_str: String = row.get(1)?;
    let minor_str: String = row.get(2)?;
    let divisibility: u32 = row.get(3)?;

    let minor = minor_str.parse::<u128>().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("invalid amount_minor {minor_str}").into(),
        )
    })?;
    let amount = PaymentAmount::new(minor, divisibility).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Integer, e.into())
    })?;

    Ok(PaymentRecord {
        id: row.get(0)?,
        status: status_from_str(&status_str, 1)?,
        amount,
        currency: row.get(4)?,
        details: PaymentDetails {
            swap_id: row.get(5)?,
            transaction_id: row.get(6)?,
            refund_transaction_id: row.get(7)?,
            refund_address: row.get(8)?,
        },
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS store_settings (
  store_id TEXT PRIMARY KEY,
  settings_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS payments (
  invoice_id TEXT NOT NULL,
  payment_id TEXT NOT NULL,
  status TEXT NOT NULL,
  amount_minor TEXT NOT NULL,
  amount_divisibility INTEGER NOT NULL,
  currency TEXT NOT NULL,
  swap_id TEXT NOT NULL,
  transaction_id TEXT NOT NULL,
  refund_transaction_id TEXT,
  refund_address TEXT,
  PRIMARY KEY (invoice_id, payment_id)
);
CREATE INDEX IF NOT EXISTS payments_swap_idx ON payments(swap_id);
CREATE INDEX IF NOT EXISTS payments_payment_idx ON payments(payment_id);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn status_to_str(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Processing => "processing",
        PaymentStatus::Settled => "settled",
    }
}

fn status_from_str(s: &str, col: usize) -> rusqlite::Result<PaymentStatus> {
    match s {
        "processing" => Ok(PaymentStatus::Processing),
        "settled" => Ok(PaymentStatus::Settled),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown payment status: {other}").into(),
        )),
    }
}

#[async_trait]
impl SettingsStore for Mutex<SqliteStore> {
    async fn all_settings(&self) -> Result<HashMap<String, StoreSwapSettings>> {
        self.lock().expect("store mutex poisoned").list_settings()
    }

    async fn update_settings(
        &self,
        store_id: &str,
        settings: Option<StoreSwapSettings>,
    ) -> Result<()> {
        let mut store = self.lock().expect("store mutex poisoned");
        match settings {
            Some(settings) => store.put_settings(store_id, &settings),
            None => store.delete_settings(store_id).map(|_| ()),
        }
    }
}

#[async_trait]
impl PaymentLedger for Mutex<SqliteStore> {
    async fn payment(&self, invoice_id: &str, payment_id: &str) -> Result<Option<PaymentRecord>> {
        self.lock()
            .expect("store mutex poisoned")
            .get_payment(invoice_id, payment_id)
    }

    async fn invoice_for_payment(&self, payment_id: &str) -> Result<Option<String>> {
        self.lock()
            .expect("store mutex poisoned")
            .invoice_for_payment(payment_id)
    }

    async fn insert_payment(&self, invoice_id: &str, payment: &PaymentRecord) -> Result<bool> {
        self.lock()
            .expect("store mutex poisoned")
            .insert_payment(invoice_id, payment)
    }

    async fn update_payment(&self, invoice_id: &str, payment: &PaymentRecord) -> Result<()> {
        self.lock()
            .expect("store mutex poisoned")
            .update_payment(invoice_id, payment)
    }

    async fn payments(&self, invoice_id: &str) -> Result<Vec<PaymentRecord>> {
        self.lock()
            .expect("store mutex poisoned")
            .list_payments(invoice_id)
    }
}
