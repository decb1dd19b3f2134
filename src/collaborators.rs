//! Seams to the systems around the COD ledger.
//!
//! Orders and drivers are owned elsewhere; the ledger only reads them.
//! Proof images are uploaded by an external service that hands back an
//! opaque URI, and status notifications are fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::format_ts;
use crate::db::DbState;
use crate::error::{CodError, CodResult};
use crate::money;
use crate::transactions::OverallStatus;

/// What the order workflow tells us about an order with a COD obligation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRef {
    pub order_id: String,
    pub company_id: String,
    pub cod_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRef {
    pub driver_id: String,
    pub company_id: String,
    pub name: Option<String>,
    pub is_active: bool,
}

pub trait OrderDirectory: Send + Sync {
    fn find_order(&self, order_id: &str) -> CodResult<Option<OrderRef>>;
}

pub trait DriverDirectory: Send + Sync {
    fn find_driver(&self, driver_id: &str) -> CodResult<Option<DriverRef>>;

    /// Active drivers of a company, in stable order.
    fn drivers_for_company(&self, company_id: &str) -> CodResult<Vec<DriverRef>>;
}

pub trait ProofUploader: Send + Sync {
    fn upload(&self, bytes: &[u8], content_type: &str) -> CodResult<String>;
}

pub trait Notifier: Send + Sync {
    /// Errors are logged by the caller and never undo the transition.
    fn notify(&self, order_id: &str, status: OverallStatus) -> CodResult<()>;
}

// ---------------------------------------------------------------------------
// SQLite-backed directory
// ---------------------------------------------------------------------------

/// Reads the `orders` and `drivers` reference tables that the upstream order
/// feed keeps in the ledger database.
#[derive(Clone)]
pub struct SqliteDirectory {
    db: Arc<DbState>,
}

impl SqliteDirectory {
    pub fn new(db: Arc<DbState>) -> Self {
        SqliteDirectory { db }
    }

    /// Insert or refresh an order as supplied by the order workflow.
    pub fn register_order(&self, order: &OrderRef) -> CodResult<()> {
        if order.cod_amount < Decimal::ZERO {
            return Err(CodError::Validation(format!(
                "COD amount cannot be negative, order {} has {}",
                order.order_id, order.cod_amount
            )));
        }
        money::check_amount(order.cod_amount, "COD amount")?;
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO orders (id, company_id, cod_amount, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET company_id = excluded.company_id,
                                           cod_amount = excluded.cod_amount",
            params![
                order.order_id,
                order.company_id,
                money::to_db(order.cod_amount),
                format_ts(Utc::now()),
            ],
        )?;
        debug!(order_id = %order.order_id, "Order registered");
        Ok(())
    }

    pub fn register_driver(&self, driver: &DriverRef) -> CodResult<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO drivers (id, company_id, name, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET company_id = excluded.company_id,
                                           name = excluded.name,
                                           is_active = excluded.is_active",
            params![
                driver.driver_id,
                driver.company_id,
                driver.name,
                driver.is_active,
                format_ts(Utc::now()),
            ],
        )?;
        debug!(driver_id = %driver.driver_id, "Driver registered");
        Ok(())
    }
}

impl OrderDirectory for SqliteDirectory {
    fn find_order(&self, order_id: &str) -> CodResult<Option<OrderRef>> {
        let conn = self.db.lock()?;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT id, company_id, cod_amount FROM orders WHERE id = ?1",
                params![order_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(|(order_id, company_id, raw)| {
            Ok(OrderRef {
                order_id,
                company_id,
                cod_amount: money::parse_amount(&raw)?,
            })
        })
        .transpose()
    }
}

impl DriverDirectory for SqliteDirectory {
    fn find_driver(&self, driver_id: &str) -> CodResult<Option<DriverRef>> {
        let conn = self.db.lock()?;
        let driver = conn
            .query_row(
                "SELECT id, company_id, name, is_active FROM drivers WHERE id = ?1",
                params![driver_id],
                |row| {
                    Ok(DriverRef {
                        driver_id: row.get(0)?,
                        company_id: row.get(1)?,
                        name: row.get(2)?,
                        is_active: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(driver)
    }

    fn drivers_for_company(&self, company_id: &str) -> CodResult<Vec<DriverRef>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, company_id, name, is_active FROM drivers
             WHERE company_id = ?1 AND is_active = 1
             ORDER BY id",
        )?;
        let drivers = stmt
            .query_map(params![company_id], |row| {
                Ok(DriverRef {
                    driver_id: row.get(0)?,
                    company_id: row.get(1)?,
                    name: row.get(2)?,
                    is_active: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(drivers)
    }
}

// ---------------------------------------------------------------------------
// HTTP adapters
// ---------------------------------------------------------------------------

/// Default timeout for collaborator HTTP calls.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Strip trailing slashes so path joins never produce `//`.
fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    while url.ends_with('/') {
        url.pop();
    }
    url
}

/// Convert a `reqwest::Error` into a short operator-facing message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach {url}");
    }
    if err.is_timeout() {
        return format!("Request to {url} timed out");
    }
    format!("Request to {url} failed: {err}")
}

/// Posts raw proof bytes to `{base}/uploads` and expects `{"uri": "..."}`.
pub struct HttpProofUploader {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpProofUploader {
    pub fn new(base_url: &str, timeout: Duration) -> CodResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CodError::Collaborator(format!("http client: {e}")))?;
        Ok(HttpProofUploader {
            client,
            base_url: normalize_base_url(base_url),
        })
    }
}

impl ProofUploader for HttpProofUploader {
    fn upload(&self, bytes: &[u8], content_type: &str) -> CodResult<String> {
        let url = format!("{}/uploads", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .map_err(|e| CodError::Collaborator(friendly_error(&url, &e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CodError::Collaborator(format!("{url} returned {status}")));
        }
        let body: Value = resp
            .json()
            .map_err(|e| CodError::Collaborator(format!("invalid upload response: {e}")))?;
        body.get("uri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CodError::Collaborator("upload response missing uri".into()))
    }
}

/// Posts `{"orderId", "status"}` to a webhook.
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> CodResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CodError::Collaborator(format!("http client: {e}")))?;
        Ok(WebhookNotifier {
            client,
            url: normalize_base_url(url),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, order_id: &str, status: OverallStatus) -> CodResult<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "orderId": order_id,
                "status": status.as_str(),
            }))
            .send()
            .map_err(|e| CodError::Collaborator(friendly_error(&self.url, &e)))?;
        if !resp.status().is_success() {
            return Err(CodError::Collaborator(format!(
                "{} returned {}",
                self.url,
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Logs transitions only. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, order_id: &str, status: OverallStatus) -> CodResult<()> {
        info!(order_id = %order_id, status = %status, "COD status notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rust_decimal_macros::dec;

    #[test]
    fn test_register_and_find_order() {
        let db = Arc::new(db::open_in_memory().unwrap());
        let dir = SqliteDirectory::new(db);
        assert!(dir.find_order("o1").unwrap().is_none());

        let order = OrderRef {
            order_id: "o1".into(),
            company_id: "c1".into(),
            cod_amount: dec!(500000),
        };
        dir.register_order(&order).unwrap();
        assert_eq!(dir.find_order("o1").unwrap(), Some(order));
    }

    #[test]
    fn test_register_order_rejects_unstorable_amounts() {
        let db = Arc::new(db::open_in_memory().unwrap());
        let dir = SqliteDirectory::new(db);
        for amount in [dec!(-1), dec!(50000000000000000000000000000), dec!(0.00001)] {
            let order = OrderRef {
                order_id: "o1".into(),
                company_id: "c1".into(),
                cod_amount: amount,
            };
            let err = dir.register_order(&order).unwrap_err();
            assert!(matches!(err, CodError::Validation(_)), "{amount}: {err:?}");
        }
        assert!(dir.find_order("o1").unwrap().is_none());
    }

    #[test]
    fn test_drivers_for_company_skips_inactive() {
        let db = Arc::new(db::open_in_memory().unwrap());
        let dir = SqliteDirectory::new(db);
        for (id, company, active) in [("d2", "c1", true), ("d1", "c1", true), ("d3", "c1", false), ("d4", "c2", true)] {
            dir.register_driver(&DriverRef {
                driver_id: id.into(),
                company_id: company.into(),
                name: None,
                is_active: active,
            })
            .unwrap();
        }
        let ids: Vec<String> = dir
            .drivers_for_company("c1")
            .unwrap()
            .into_iter()
            .map(|d| d.driver_id)
            .collect();
        assert_eq!(ids, vec!["d1", "d2"]);
        assert!(dir.find_driver("d3").unwrap().is_some());
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url(" https://files.example.com/// "), "https://files.example.com");
    }
}
