//! COD transaction store and state machine.
//!
//! One `cod_transactions` row per order with a COD obligation. The row moves
//! pending → collected → submitted → received → transferred, with `failed`
//! reachable only before submission. `overall_status` is never stored; it is
//! derived from the collection status and the submitted/received flags every
//! time a row is read.
//!
//! Every mutation runs inside `BEGIN IMMEDIATE`, re-reads the row, checks its
//! precondition and writes back with `WHERE id = ? AND version = ?`. A
//! changed version token surfaces as [`CodError::StaleWrite`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{format_ts, opt_ts_col, ts_col};
use crate::collaborators::OrderRef;
use crate::db::{self, DbState};
use crate::error::{CodError, CodResult};
use crate::money::{self, amount_col, opt_amount_col};
use crate::reconciliation;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TransactionId {
    type Err = CodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(TransactionId)
            .map_err(|_| CodError::Validation(format!("invalid transaction id: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Pending,
    Collected,
    Failed,
}

impl CollectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionStatus::Pending => "pending",
            CollectionStatus::Collected => "collected",
            CollectionStatus::Failed => "failed",
        }
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(CollectionStatus::Pending),
            "collected" => Some(CollectionStatus::Collected),
            "failed" => Some(CollectionStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    PendingCollection,
    Collected,
    SubmittedToCompany,
    /// Received by the company; payout to the sender may or may not be recorded yet.
    Completed,
    Failed,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::PendingCollection => "pending_collection",
            OverallStatus::Collected => "collected",
            OverallStatus::SubmittedToCompany => "submitted_to_company",
            OverallStatus::Completed => "completed",
            OverallStatus::Failed => "failed",
        }
    }

    /// The high-level status as a pure function of the underlying flags.
    pub fn derive(collection: CollectionStatus, submitted: bool, received: bool) -> Self {
        match collection {
            CollectionStatus::Failed => OverallStatus::Failed,
            CollectionStatus::Pending => OverallStatus::PendingCollection,
            CollectionStatus::Collected if !submitted => OverallStatus::Collected,
            CollectionStatus::Collected if !received => OverallStatus::SubmittedToCompany,
            CollectionStatus::Collected => OverallStatus::Completed,
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodTransaction {
    pub id: TransactionId,
    pub order_id: String,
    pub company_id: String,
    pub amount: Decimal,
    pub collection_status: CollectionStatus,
    pub collected_by_driver_id: Option<String>,
    pub collected_at: Option<DateTime<Utc>>,
    pub collection_proof: Option<String>,
    pub failure_reason: Option<String>,
    pub submitted_to_company: bool,
    pub submitted_at: Option<DateTime<Utc>>,
    pub submitted_amount: Option<Decimal>,
    pub company_received_by_user_id: Option<String>,
    pub company_received_at: Option<DateTime<Utc>>,
    pub transferred_to_sender: bool,
    pub transferred_at: Option<DateTime<Utc>>,
    pub transfer_method: Option<String>,
    pub transfer_reference: Option<String>,
    pub transfer_proof: Option<String>,
    pub company_fee: Option<Decimal>,
    pub adjustment_amount: Option<Decimal>,
    pub adjustment_reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodTransaction {
    pub fn overall_status(&self) -> OverallStatus {
        OverallStatus::derive(
            self.collection_status,
            self.submitted_to_company,
            self.is_received(),
        )
    }

    pub fn is_received(&self) -> bool {
        self.company_received_by_user_id.is_some()
    }

    /// What the sender is owed: the submitted cash less fee and adjustment.
    /// `None` until the transaction has been submitted.
    pub fn payout_amount(&self) -> Option<Decimal> {
        self.submitted_amount.map(|submitted| {
            submitted
                - self.company_fee.unwrap_or(Decimal::ZERO)
                - self.adjustment_amount.unwrap_or(Decimal::ZERO)
        })
    }

    /// UTC day the cash was collected; this keys the driver's daily summary.
    pub fn collection_date(&self) -> Option<NaiveDate> {
        self.collected_at.map(|ts| ts.date_naive())
    }
}

/// A driver's hand-over of collected cash, validated before it reaches storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitBatch {
    driver_id: String,
    transaction_ids: Vec<TransactionId>,
    declared_total: Decimal,
}

impl SubmitBatch {
    pub fn new(
        driver_id: impl Into<String>,
        transaction_ids: Vec<TransactionId>,
        declared_total: Decimal,
    ) -> CodResult<Self> {
        let driver_id = driver_id.into();
        if driver_id.trim().is_empty() {
            return Err(CodError::Validation("driver id is required".into()));
        }
        if transaction_ids.is_empty() {
            return Err(CodError::Validation(
                "submission must name at least one transaction".into(),
            ));
        }
        let unique: BTreeSet<_> = transaction_ids.iter().collect();
        if unique.len() != transaction_ids.len() {
            return Err(CodError::Validation(
                "submission names the same transaction more than once".into(),
            ));
        }
        if declared_total <= Decimal::ZERO {
            return Err(CodError::Validation(format!(
                "declared total must be positive, got {declared_total}"
            )));
        }
        money::check_amount(declared_total, "declared total")?;
        Ok(SubmitBatch {
            driver_id,
            transaction_ids,
            declared_total,
        })
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn transaction_ids(&self) -> &[TransactionId] {
        &self.transaction_ids
    }

    pub fn declared_total(&self) -> Decimal {
        self.declared_total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDetails {
    pub method: String,
    pub reference: String,
    pub proof_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodTransactionEvent {
    pub id: i64,
    pub transaction_id: String,
    pub event_type: String,
    pub actor_id: Option<String>,
    pub payload: Value,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const SELECT_COLUMNS: &str = "id, order_id, company_id, amount, collection_status,
    collected_by_driver_id, collected_at, collection_proof, failure_reason,
    submitted_to_company, submitted_at, submitted_amount,
    company_received_by_user_id, company_received_at,
    transferred_to_sender, transferred_at, transfer_method, transfer_reference, transfer_proof,
    company_fee, adjustment_amount, adjustment_reason,
    version, created_at, updated_at";

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<CodTransaction> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id)
        .map(TransactionId)
        .map_err(|e| conversion_error(0, format!("transaction id '{id}': {e}")))?;
    let status: String = row.get(4)?;
    let collection_status = CollectionStatus::parse(&status)
        .ok_or_else(|| conversion_error(4, format!("collection status '{status}'")))?;

    Ok(CodTransaction {
        id,
        order_id: row.get(1)?,
        company_id: row.get(2)?,
        amount: amount_col(row, 3)?,
        collection_status,
        collected_by_driver_id: row.get(5)?,
        collected_at: opt_ts_col(row, 6)?,
        collection_proof: row.get(7)?,
        failure_reason: row.get(8)?,
        submitted_to_company: row.get(9)?,
        submitted_at: opt_ts_col(row, 10)?,
        submitted_amount: opt_amount_col(row, 11)?,
        company_received_by_user_id: row.get(12)?,
        company_received_at: opt_ts_col(row, 13)?,
        transferred_to_sender: row.get(14)?,
        transferred_at: opt_ts_col(row, 15)?,
        transfer_method: row.get(16)?,
        transfer_reference: row.get(17)?,
        transfer_proof: row.get(18)?,
        company_fee: opt_amount_col(row, 19)?,
        adjustment_amount: opt_amount_col(row, 20)?,
        adjustment_reason: row.get(21)?,
        version: row.get(22)?,
        created_at: ts_col(row, 23)?,
        updated_at: ts_col(row, 24)?,
    })
}

fn load(conn: &Connection, id: &TransactionId) -> CodResult<Option<CodTransaction>> {
    let tx = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM cod_transactions WHERE id = ?1"),
            params![id.to_string()],
            from_row,
        )
        .optional()?;
    Ok(tx)
}

fn load_by_order(conn: &Connection, order_id: &str) -> CodResult<Option<CodTransaction>> {
    let tx = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM cod_transactions WHERE order_id = ?1"),
            params![order_id],
            from_row,
        )
        .optional()?;
    Ok(tx)
}

fn require(conn: &Connection, id: &TransactionId) -> CodResult<CodTransaction> {
    load(conn, id)?.ok_or_else(|| CodError::not_found("transaction", id.to_string()))
}

fn require_by_order(conn: &Connection, order_id: &str) -> CodResult<CodTransaction> {
    load_by_order(conn, order_id)?
        .ok_or_else(|| CodError::not_found("COD transaction for order", order_id))
}

/// Write every mutable column of `tx` back, guarded by its current version.
///
/// Returns the stored row (version bumped). `amount`, `order_id` and
/// `company_id` are never part of the update.
fn save(conn: &Connection, tx: &CodTransaction, now: DateTime<Utc>) -> CodResult<CodTransaction> {
    let changed = conn.execute(
        "UPDATE cod_transactions SET
            collection_status = ?1, collected_by_driver_id = ?2, collected_at = ?3,
            collection_proof = ?4, failure_reason = ?5,
            submitted_to_company = ?6, submitted_at = ?7, submitted_amount = ?8,
            company_received_by_user_id = ?9, company_received_at = ?10,
            transferred_to_sender = ?11, transferred_at = ?12, transfer_method = ?13,
            transfer_reference = ?14, transfer_proof = ?15,
            company_fee = ?16, adjustment_amount = ?17, adjustment_reason = ?18,
            version = version + 1, updated_at = ?19
         WHERE id = ?20 AND version = ?21",
        params![
            tx.collection_status.as_str(),
            tx.collected_by_driver_id,
            tx.collected_at.map(format_ts),
            tx.collection_proof,
            tx.failure_reason,
            tx.submitted_to_company,
            tx.submitted_at.map(format_ts),
            tx.submitted_amount.map(money::to_db),
            tx.company_received_by_user_id,
            tx.company_received_at.map(format_ts),
            tx.transferred_to_sender,
            tx.transferred_at.map(format_ts),
            tx.transfer_method,
            tx.transfer_reference,
            tx.transfer_proof,
            tx.company_fee.map(money::to_db),
            tx.adjustment_amount.map(money::to_db),
            tx.adjustment_reason,
            format_ts(now),
            tx.id.to_string(),
            tx.version,
        ],
    )?;

    if changed == 0 {
        return Err(CodError::StaleWrite {
            transaction_id: tx.id.to_string(),
        });
    }
    require(conn, &tx.id)
}

fn record_event(
    conn: &Connection,
    tx_id: &TransactionId,
    event_type: &str,
    actor_id: Option<&str>,
    payload: Value,
    now: DateTime<Utc>,
) -> CodResult<()> {
    conn.execute(
        "INSERT INTO cod_transaction_events (transaction_id, event_type, actor_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            tx_id.to_string(),
            event_type,
            actor_id,
            payload.to_string(),
            format_ts(now)
        ],
    )?;
    Ok(())
}

/// Refresh the driver's daily summary totals for the day `tx` was collected on.
fn touch_summary(conn: &Connection, tx: &CodTransaction, now: DateTime<Utc>) -> CodResult<()> {
    if let (Some(driver_id), Some(date)) = (tx.collected_by_driver_id.as_deref(), tx.collection_date())
    {
        reconciliation::refresh_totals(conn, driver_id, date, now)?;
    }
    Ok(())
}

/// Fee plus adjustment currently recorded against the row.
fn deductions(tx: &CodTransaction) -> Decimal {
    tx.company_fee.unwrap_or(Decimal::ZERO) + tx.adjustment_amount.unwrap_or(Decimal::ZERO)
}

fn non_empty(value: &str, field: &str) -> CodResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CodError::Validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

/// Create the pending COD obligation for an order.
pub fn open_transaction(
    db: &DbState,
    order: &OrderRef,
    now: DateTime<Utc>,
) -> CodResult<CodTransaction> {
    if order.cod_amount <= Decimal::ZERO {
        return Err(CodError::Validation(format!(
            "COD amount must be positive, order {} has {}",
            order.order_id, order.cod_amount
        )));
    }
    money::check_amount(order.cod_amount, "COD amount")?;

    let conn = db.lock()?;
    db::with_immediate_tx(&conn, |conn| {
        if let Some(existing) = load_by_order(conn, &order.order_id)? {
            return Err(CodError::Conflict(format!(
                "order {} already has COD transaction {}",
                order.order_id, existing.id
            )));
        }

        let id = TransactionId::new();
        let ts = format_ts(now);
        conn.execute(
            "INSERT INTO cod_transactions (id, order_id, company_id, amount, collection_status,
                version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 1, ?5, ?5)",
            params![
                id.to_string(),
                order.order_id,
                order.company_id,
                money::to_db(order.cod_amount),
                ts
            ],
        )?;
        record_event(
            conn,
            &id,
            "created",
            None,
            serde_json::json!({ "orderId": order.order_id, "amount": money::to_db(order.cod_amount) }),
            now,
        )?;

        info!(
            transaction_id = %id,
            order_id = %order.order_id,
            amount = %order.cod_amount,
            "COD transaction opened"
        );
        require(conn, &id)
    })
}

// ---------------------------------------------------------------------------
// Collect / fail
// ---------------------------------------------------------------------------

/// Record that `driver_id` took the cash for `order_id`.
pub fn collect(
    db: &DbState,
    order_id: &str,
    driver_id: &str,
    proof_uri: Option<String>,
    now: DateTime<Utc>,
) -> CodResult<CodTransaction> {
    let conn = db.lock()?;
    db::with_immediate_tx(&conn, |conn| {
        let mut tx = require_by_order(conn, order_id)?;
        match tx.collection_status {
            CollectionStatus::Pending => {}
            CollectionStatus::Collected => {
                return Err(CodError::Conflict(format!(
                    "order {order_id} was already collected by {}",
                    tx.collected_by_driver_id.as_deref().unwrap_or("unknown driver")
                )));
            }
            CollectionStatus::Failed => {
                return Err(CodError::Conflict(format!(
                    "collection for order {order_id} is marked failed"
                )));
            }
        }

        tx.collection_status = CollectionStatus::Collected;
        tx.collected_by_driver_id = Some(driver_id.to_string());
        tx.collected_at = Some(now);
        tx.collection_proof = proof_uri;

        let saved = save(conn, &tx, now)?;
        record_event(
            conn,
            &saved.id,
            "collected",
            Some(driver_id),
            serde_json::json!({ "proof": saved.collection_proof }),
            now,
        )?;
        touch_summary(conn, &saved, now)?;

        info!(
            transaction_id = %saved.id,
            order_id = %order_id,
            driver_id = %driver_id,
            amount = %saved.amount,
            "COD collected"
        );
        Ok(saved)
    })
}

/// Mark the collection for `order_id` as failed (recipient refused, parcel returned).
///
/// Allowed while pending, or collected but not yet submitted.
pub fn fail_collection(
    db: &DbState,
    order_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> CodResult<CodTransaction> {
    let reason = non_empty(reason, "failure reason")?;

    let conn = db.lock()?;
    db::with_immediate_tx(&conn, |conn| {
        let mut tx = require_by_order(conn, order_id)?;
        if tx.collection_status == CollectionStatus::Failed {
            return Err(CodError::Conflict(format!(
                "collection for order {order_id} is already failed"
            )));
        }
        if tx.submitted_to_company {
            return Err(CodError::Conflict(format!(
                "order {order_id} was already submitted to the company"
            )));
        }

        tx.collection_status = CollectionStatus::Failed;
        tx.failure_reason = Some(reason.clone());

        let saved = save(conn, &tx, now)?;
        record_event(
            conn,
            &saved.id,
            "failed",
            saved.collected_by_driver_id.as_deref(),
            serde_json::json!({ "reason": reason }),
            now,
        )?;
        touch_summary(conn, &saved, now)?;

        warn!(
            transaction_id = %saved.id,
            order_id = %order_id,
            reason = %reason,
            "COD collection failed"
        );
        Ok(saved)
    })
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// Hand a batch of collected transactions to the company, all or nothing.
///
/// `submitted_amount` is apportioned from the declared total; a declared total
/// below the batch's collected sum is a logged shortfall, above it is rejected.
pub fn submit(
    db: &DbState,
    batch: &SubmitBatch,
    now: DateTime<Utc>,
) -> CodResult<Vec<CodTransaction>> {
    let conn = db.lock()?;
    db::with_immediate_tx(&conn, |conn| {
        let mut rows = Vec::with_capacity(batch.transaction_ids().len());
        for id in batch.transaction_ids() {
            rows.push(require(conn, id)?);
        }

        let rejected: Vec<String> = rows
            .iter()
            .filter(|tx| {
                tx.collection_status != CollectionStatus::Collected
                    || tx.submitted_to_company
                    || tx.collected_by_driver_id.as_deref() != Some(batch.driver_id())
            })
            .map(|tx| tx.id.to_string())
            .collect();
        if !rejected.is_empty() {
            return Err(CodError::BatchConflict {
                transaction_ids: rejected,
            });
        }

        let amounts: Vec<Decimal> = rows.iter().map(|tx| tx.amount).collect();
        let collected_total = money::sum(amounts.iter().copied())?;
        let declared = batch.declared_total();
        if declared > collected_total {
            return Err(CodError::Validation(format!(
                "declared total {declared} exceeds collected total {collected_total}"
            )));
        }

        let shares = money::apportion(declared, &amounts)?;
        let shortfall = collected_total - declared;

        // Fees recorded before submission were bounded by the full amount;
        // the apportioned share must still cover them.
        let uncovered: Vec<String> = rows
            .iter()
            .zip(&shares)
            .filter(|(tx, share)| deductions(tx) > **share)
            .map(|(tx, share)| {
                format!("{} (share {share}, deductions {})", tx.id, deductions(tx))
            })
            .collect();
        if !uncovered.is_empty() {
            return Err(CodError::Validation(format!(
                "submitted share would not cover recorded fee and adjustment: {}",
                uncovered.join(", ")
            )));
        }

        let mut saved_rows = Vec::with_capacity(rows.len());
        for (mut tx, share) in rows.into_iter().zip(shares) {
            tx.submitted_to_company = true;
            tx.submitted_at = Some(now);
            tx.submitted_amount = Some(share);

            let saved = save(conn, &tx, now)?;
            record_event(
                conn,
                &saved.id,
                "submitted",
                Some(batch.driver_id()),
                serde_json::json!({
                    "submittedAmount": money::to_db(share),
                    "shortfall": money::to_db(saved.amount - share),
                    "declaredTotal": money::to_db(declared),
                }),
                now,
            )?;
            saved_rows.push(saved);
        }

        let days: BTreeSet<NaiveDate> = saved_rows
            .iter()
            .filter_map(CodTransaction::collection_date)
            .collect();
        for day in days {
            reconciliation::refresh_totals(conn, batch.driver_id(), day, now)?;
        }

        if !shortfall.is_zero() {
            warn!(
                driver_id = %batch.driver_id(),
                collected = %collected_total,
                declared = %declared,
                shortfall = %shortfall,
                "COD submission short of collected total"
            );
        }
        info!(
            driver_id = %batch.driver_id(),
            count = saved_rows.len(),
            declared = %declared,
            "COD batch submitted to company"
        );
        Ok(saved_rows)
    })
}

// ---------------------------------------------------------------------------
// Receive / transfer
// ---------------------------------------------------------------------------

/// Company staff confirm they hold the submitted cash.
pub fn receive(
    db: &DbState,
    id: &TransactionId,
    received_by: &str,
    now: DateTime<Utc>,
) -> CodResult<CodTransaction> {
    let received_by = non_empty(received_by, "receiving user")?;

    let conn = db.lock()?;
    db::with_immediate_tx(&conn, |conn| {
        let mut tx = require(conn, id)?;
        if !tx.submitted_to_company {
            return Err(CodError::Conflict(format!(
                "transaction {id} has not been submitted to the company"
            )));
        }
        if let Some(by) = tx.company_received_by_user_id.as_deref() {
            return Err(CodError::Conflict(format!(
                "transaction {id} was already received by {by}"
            )));
        }

        tx.company_received_by_user_id = Some(received_by.clone());
        tx.company_received_at = Some(now);

        let saved = save(conn, &tx, now)?;
        record_event(
            conn,
            &saved.id,
            "received",
            Some(&received_by),
            serde_json::json!({}),
            now,
        )?;
        touch_summary(conn, &saved, now)?;

        info!(transaction_id = %id, received_by = %received_by, "COD received by company");
        Ok(saved)
    })
}

/// Record the payout of the held cash to the sender.
pub fn transfer(
    db: &DbState,
    id: &TransactionId,
    details: &TransferDetails,
    now: DateTime<Utc>,
) -> CodResult<CodTransaction> {
    let method = non_empty(&details.method, "transfer method")?;
    let reference = non_empty(&details.reference, "transfer reference")?;

    let conn = db.lock()?;
    db::with_immediate_tx(&conn, |conn| {
        let mut tx = require(conn, id)?;
        if tx.transferred_to_sender {
            return Err(CodError::Conflict(format!(
                "transaction {id} was already transferred to the sender"
            )));
        }
        if tx.overall_status() != OverallStatus::Completed {
            return Err(CodError::Conflict(format!(
                "transaction {id} is {} and cannot be transferred before company receipt",
                tx.overall_status()
            )));
        }

        tx.transferred_to_sender = true;
        tx.transferred_at = Some(now);
        tx.transfer_method = Some(method.clone());
        tx.transfer_reference = Some(reference.clone());
        tx.transfer_proof = details.proof_uri.clone();

        let saved = save(conn, &tx, now)?;
        record_event(
            conn,
            &saved.id,
            "transferred",
            None,
            serde_json::json!({
                "method": method,
                "reference": reference,
                "payout": saved.payout_amount().map(money::to_db),
            }),
            now,
        )?;

        info!(
            transaction_id = %id,
            method = %method,
            reference = %reference,
            "COD transferred to sender"
        );
        Ok(saved)
    })
}

// ---------------------------------------------------------------------------
// Adjust
// ---------------------------------------------------------------------------

/// Record the company fee and any correction deducted before payout.
///
/// `0 <= fee + adjustment <= held amount`: a negative adjustment can offset
/// the fee but never pay out more than was held. Zero amounts with an empty
/// reason are accepted and clear earlier values.
pub fn adjust(
    db: &DbState,
    id: &TransactionId,
    fee: Decimal,
    adjustment: Decimal,
    reason: &str,
    now: DateTime<Utc>,
) -> CodResult<CodTransaction> {
    let reason = reason.trim();
    if (!fee.is_zero() || !adjustment.is_zero()) && reason.is_empty() {
        return Err(CodError::Validation(
            "a reason is required for a non-zero fee or adjustment".into(),
        ));
    }
    if fee < Decimal::ZERO {
        return Err(CodError::Validation(format!("company fee cannot be negative, got {fee}")));
    }
    money::check_amount(fee, "company fee")?;
    money::check_amount(adjustment, "adjustment")?;
    if fee + adjustment < Decimal::ZERO {
        return Err(CodError::Validation(format!(
            "adjustment {adjustment} would raise the payout above the held amount; \
             a negative adjustment may only offset the company fee {fee}"
        )));
    }

    let conn = db.lock()?;
    db::with_immediate_tx(&conn, |conn| {
        let mut tx = require(conn, id)?;
        if tx.transferred_to_sender {
            return Err(CodError::Conflict(format!(
                "transaction {id} was already transferred, adjustments are closed"
            )));
        }
        if tx.collection_status == CollectionStatus::Failed {
            return Err(CodError::Conflict(format!(
                "transaction {id} failed collection and holds no cash to adjust"
            )));
        }

        let base = tx.submitted_amount.unwrap_or(tx.amount);
        if fee + adjustment > base {
            return Err(CodError::Validation(format!(
                "fee {fee} and adjustment {adjustment} exceed the held amount {base}"
            )));
        }

        let new_fee = (!fee.is_zero()).then_some(fee);
        let new_adjustment = (!adjustment.is_zero()).then_some(adjustment);
        let new_reason = (new_fee.is_some() || new_adjustment.is_some()).then(|| reason.to_string());
        if tx.company_fee == new_fee
            && tx.adjustment_amount == new_adjustment
            && tx.adjustment_reason == new_reason
        {
            return Ok(tx);
        }

        tx.company_fee = new_fee;
        tx.adjustment_amount = new_adjustment;
        tx.adjustment_reason = new_reason;

        let saved = save(conn, &tx, now)?;
        record_event(
            conn,
            &saved.id,
            "adjusted",
            None,
            serde_json::json!({
                "fee": money::to_db(fee),
                "adjustment": money::to_db(adjustment),
                "reason": saved.adjustment_reason,
            }),
            now,
        )?;

        info!(
            transaction_id = %id,
            fee = %fee,
            adjustment = %adjustment,
            reason = %reason,
            "COD adjustment recorded"
        );
        Ok(saved)
    })
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn get(db: &DbState, id: &TransactionId) -> CodResult<CodTransaction> {
    let conn = db.lock()?;
    require(&conn, id)
}

pub fn get_by_order(db: &DbState, order_id: &str) -> CodResult<CodTransaction> {
    let conn = db.lock()?;
    require_by_order(&conn, order_id)
}

/// Audit trail of a transaction, oldest first.
pub fn events(db: &DbState, id: &TransactionId) -> CodResult<Vec<CodTransactionEvent>> {
    let conn = db.lock()?;
    require(&conn, id)?;
    let mut stmt = conn.prepare(
        "SELECT id, transaction_id, event_type, actor_id, payload, created_at
         FROM cod_transaction_events WHERE transaction_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![id.to_string()], |row| {
            let payload: String = row.get(4)?;
            let event_id: i64 = row.get(0)?;
            let payload = serde_json::from_str(&payload).map_err(|e| {
                conversion_error(4, format!("event {event_id} payload: {e}"))
            })?;
            Ok(CodTransactionEvent {
                id: event_id,
                transaction_id: row.get(1)?,
                event_type: row.get(2)?,
                actor_id: row.get(3)?,
                payload,
                created_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| match e {
            rusqlite::Error::FromSqlConversionFailure(..) => {
                CodError::CorruptRecord(format!("history of transaction {id}: {e}"))
            }
            other => CodError::Storage(other),
        })?;
    Ok(rows)
}

/// Transactions a driver collected and still holds, oldest collection first.
pub fn list_held_by_driver(db: &DbState, driver_id: &str) -> CodResult<Vec<CodTransaction>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM cod_transactions
         WHERE collected_by_driver_id = ?1
           AND collection_status = 'collected'
           AND submitted_to_company = 0
         ORDER BY collected_at, id"
    ))?;
    let rows = stmt
        .query_map(params![driver_id], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rust_decimal_macros::dec;

    fn test_db() -> DbState {
        db::open_in_memory().expect("open in-memory db")
    }

    fn seed_order(db: &DbState, order_id: &str, amount: Decimal) -> CodTransaction {
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO orders (id, company_id, cod_amount, created_at)
                 VALUES (?1, 'company-1', ?2, '2026-10-14T08:00:00.000Z')",
                params![order_id, money::to_db(amount)],
            )
            .unwrap();
        }
        let order = OrderRef {
            order_id: order_id.into(),
            company_id: "company-1".into(),
            cod_amount: amount,
        };
        open_transaction(db, &order, Utc::now()).expect("open transaction")
    }

    fn collected(db: &DbState, order_id: &str, amount: Decimal, driver: &str) -> CodTransaction {
        seed_order(db, order_id, amount);
        collect(db, order_id, driver, None, Utc::now()).expect("collect")
    }

    #[test]
    fn test_overall_status_is_derived_from_flags() {
        use CollectionStatus::*;
        assert_eq!(OverallStatus::derive(Pending, false, false), OverallStatus::PendingCollection);
        assert_eq!(OverallStatus::derive(Collected, false, false), OverallStatus::Collected);
        assert_eq!(
            OverallStatus::derive(Collected, true, false),
            OverallStatus::SubmittedToCompany
        );
        assert_eq!(OverallStatus::derive(Collected, true, true), OverallStatus::Completed);
        assert_eq!(OverallStatus::derive(Failed, false, false), OverallStatus::Failed);
    }

    #[test]
    fn test_open_rejects_duplicate_and_non_positive() {
        let db = test_db();
        let tx = seed_order(&db, "o1", dec!(500000));
        assert_eq!(tx.overall_status(), OverallStatus::PendingCollection);
        assert_eq!(tx.version, 1);

        let dup = OrderRef {
            order_id: "o1".into(),
            company_id: "company-1".into(),
            cod_amount: dec!(500000),
        };
        let err = open_transaction(&db, &dup, Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Conflict(_)), "got {err:?}");

        let zero = OrderRef {
            order_id: "o2".into(),
            company_id: "company-1".into(),
            cod_amount: Decimal::ZERO,
        };
        let err = open_transaction(&db, &zero, Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Validation(_)));
    }

    #[test]
    fn test_collect_sets_driver_once() {
        let db = test_db();
        seed_order(&db, "o1", dec!(100));
        let tx = collect(&db, "o1", "d1", Some("proof://1".into()), Utc::now()).unwrap();
        assert_eq!(tx.collection_status, CollectionStatus::Collected);
        assert_eq!(tx.collected_by_driver_id.as_deref(), Some("d1"));
        assert_eq!(tx.collection_proof.as_deref(), Some("proof://1"));
        assert_eq!(tx.overall_status(), OverallStatus::Collected);

        let err = collect(&db, "o1", "d2", None, Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Conflict(_)));
        let after = get_by_order(&db, "o1").unwrap();
        assert_eq!(after.collected_by_driver_id.as_deref(), Some("d1"));
    }

    #[test]
    fn test_collect_unknown_order_is_not_found() {
        let db = test_db();
        let err = collect(&db, "missing", "d1", None, Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::NotFound { .. }));
    }

    #[test]
    fn test_failed_collection_blocks_downstream() {
        let db = test_db();
        let tx = seed_order(&db, "o1", dec!(100));
        let failed = fail_collection(&db, "o1", "recipient refused", Utc::now()).unwrap();
        assert_eq!(failed.overall_status(), OverallStatus::Failed);

        assert!(matches!(
            collect(&db, "o1", "d1", None, Utc::now()).unwrap_err(),
            CodError::Conflict(_)
        ));
        assert!(matches!(
            adjust(&db, &tx.id, dec!(1), dec!(0), "fee", Utc::now()).unwrap_err(),
            CodError::Conflict(_)
        ));
        assert!(matches!(
            fail_collection(&db, "o1", "again", Utc::now()).unwrap_err(),
            CodError::Conflict(_)
        ));
        assert!(matches!(
            fail_collection(&db, "o1", "  ", Utc::now()).unwrap_err(),
            CodError::Validation(_)
        ));
    }

    #[test]
    fn test_cannot_fail_after_submission() {
        let db = test_db();
        let tx = collected(&db, "o1", dec!(100), "d1");
        let batch = SubmitBatch::new("d1", vec![tx.id], dec!(100)).unwrap();
        submit(&db, &batch, Utc::now()).unwrap();
        let err = fail_collection(&db, "o1", "lost", Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Conflict(_)));
    }

    #[test]
    fn test_submit_batch_validation() {
        assert!(matches!(
            SubmitBatch::new("d1", vec![], dec!(10)).unwrap_err(),
            CodError::Validation(_)
        ));
        let id = TransactionId::new();
        assert!(matches!(
            SubmitBatch::new("d1", vec![id, id], dec!(10)).unwrap_err(),
            CodError::Validation(_)
        ));
        assert!(matches!(
            SubmitBatch::new("d1", vec![id], dec!(0)).unwrap_err(),
            CodError::Validation(_)
        ));
        assert!(matches!(
            SubmitBatch::new(" ", vec![id], dec!(1)).unwrap_err(),
            CodError::Validation(_)
        ));
    }

    #[test]
    fn test_submit_is_all_or_nothing() {
        let db = test_db();
        let a = collected(&db, "oa", dec!(100), "d1");
        let b = seed_order(&db, "ob", dec!(50));

        let batch = SubmitBatch::new("d1", vec![a.id, b.id], dec!(150)).unwrap();
        let err = submit(&db, &batch, Utc::now()).unwrap_err();
        match err {
            CodError::BatchConflict { transaction_ids } => {
                assert_eq!(transaction_ids, vec![b.id.to_string()]);
            }
            other => panic!("expected BatchConflict, got {other:?}"),
        }

        let a_after = get(&db, &a.id).unwrap();
        assert!(!a_after.submitted_to_company);
        assert_eq!(a_after.version, a.version);
    }

    #[test]
    fn test_submit_rejects_other_drivers_and_resubmission() {
        let db = test_db();
        let mine = collected(&db, "o1", dec!(100), "d1");
        let theirs = collected(&db, "o2", dec!(100), "d2");

        let batch = SubmitBatch::new("d1", vec![mine.id, theirs.id], dec!(200)).unwrap();
        assert!(matches!(
            submit(&db, &batch, Utc::now()).unwrap_err(),
            CodError::BatchConflict { .. }
        ));

        let ok = SubmitBatch::new("d1", vec![mine.id], dec!(100)).unwrap();
        submit(&db, &ok, Utc::now()).unwrap();
        let err = submit(&db, &ok, Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::BatchConflict { .. }));
    }

    #[test]
    fn test_submit_rejects_unknown_id_and_overstated_total() {
        let db = test_db();
        let tx = collected(&db, "o1", dec!(100), "d1");

        let unknown = SubmitBatch::new("d1", vec![tx.id, TransactionId::new()], dec!(100)).unwrap();
        assert!(matches!(
            submit(&db, &unknown, Utc::now()).unwrap_err(),
            CodError::NotFound { .. }
        ));

        let too_much = SubmitBatch::new("d1", vec![tx.id], dec!(100.01)).unwrap();
        assert!(matches!(
            submit(&db, &too_much, Utc::now()).unwrap_err(),
            CodError::Validation(_)
        ));
        assert!(!get(&db, &tx.id).unwrap().submitted_to_company);
    }

    #[test]
    fn test_submit_shortfall_is_apportioned_and_logged() {
        let db = test_db();
        let a = collected(&db, "o1", dec!(200), "d1");
        let b = collected(&db, "o2", dec!(100), "d1");

        let batch = SubmitBatch::new("d1", vec![a.id, b.id], dec!(270)).unwrap();
        let saved = submit(&db, &batch, Utc::now()).unwrap();
        assert_eq!(saved[0].submitted_amount, Some(dec!(180)));
        assert_eq!(saved[1].submitted_amount, Some(dec!(90)));
        assert!(saved.iter().all(|t| t.overall_status() == OverallStatus::SubmittedToCompany));

        let history = events(&db, &a.id).unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.event_type, "submitted");
        assert_eq!(last.payload["shortfall"], "20");
    }

    #[test]
    fn test_receive_twice_is_conflict_and_state_unchanged() {
        let db = test_db();
        let tx = collected(&db, "o1", dec!(100), "d1");
        let err = receive(&db, &tx.id, "staff-1", Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Conflict(_)), "not yet submitted");

        submit(&db, &SubmitBatch::new("d1", vec![tx.id], dec!(100)).unwrap(), Utc::now()).unwrap();
        let first = receive(&db, &tx.id, "staff-1", Utc::now()).unwrap();
        assert_eq!(first.overall_status(), OverallStatus::Completed);

        let err = receive(&db, &tx.id, "staff-2", Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Conflict(_)));
        assert_eq!(get(&db, &tx.id).unwrap(), first);
    }

    #[test]
    fn test_transfer_only_touches_transfer_fields() {
        let db = test_db();
        let tx = collected(&db, "o1", dec!(100), "d1");
        submit(&db, &SubmitBatch::new("d1", vec![tx.id], dec!(100)).unwrap(), Utc::now()).unwrap();

        let details = TransferDetails {
            method: "bank_transfer".into(),
            reference: "REF-1".into(),
            proof_uri: Some("proof://transfer".into()),
        };
        let err = transfer(&db, &tx.id, &details, Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Conflict(_)), "not yet received");

        let received = receive(&db, &tx.id, "staff-1", Utc::now()).unwrap();
        let done = transfer(&db, &tx.id, &details, Utc::now()).unwrap();
        assert!(done.transferred_to_sender);
        assert_eq!(done.overall_status(), OverallStatus::Completed);

        let mut expected = received.clone();
        expected.transferred_to_sender = true;
        expected.transferred_at = done.transferred_at;
        expected.transfer_method = Some("bank_transfer".into());
        expected.transfer_reference = Some("REF-1".into());
        expected.transfer_proof = Some("proof://transfer".into());
        expected.version = done.version;
        expected.updated_at = done.updated_at;
        assert_eq!(done, expected);

        let err = transfer(&db, &tx.id, &details, Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Conflict(_)), "double transfer");
    }

    #[test]
    fn test_adjust_boundaries() {
        let db = test_db();
        let tx = collected(&db, "o1", dec!(100), "d1");

        let same = adjust(&db, &tx.id, dec!(0), dec!(0), "", Utc::now()).unwrap();
        assert_eq!(same.version, tx.version, "zero adjustment is a no-op");

        let err = adjust(&db, &tx.id, dec!(5), dec!(0), "", Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Validation(_)));
        let err = adjust(&db, &tx.id, dec!(0), dec!(-3), "  ", Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Validation(_)));
        let err = adjust(&db, &tx.id, dec!(-1), dec!(0), "refund", Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Validation(_)));
        let err = adjust(&db, &tx.id, dec!(80), dec!(30), "too much", Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Validation(_)));

        let adjusted = adjust(&db, &tx.id, dec!(5), dec!(2.5), "service fee, damaged box", Utc::now())
            .unwrap();
        assert_eq!(adjusted.company_fee, Some(dec!(5)));
        assert_eq!(adjusted.adjustment_amount, Some(dec!(2.5)));
        assert_eq!(adjusted.amount, dec!(100), "amount is immutable");

        submit(&db, &SubmitBatch::new("d1", vec![tx.id], dec!(100)).unwrap(), Utc::now()).unwrap();
        let received = receive(&db, &tx.id, "staff", Utc::now()).unwrap();
        assert_eq!(received.payout_amount(), Some(dec!(92.5)));
    }

    #[test]
    fn test_adjust_after_transfer_is_conflict() {
        let db = test_db();
        let tx = collected(&db, "o1", dec!(100), "d1");
        submit(&db, &SubmitBatch::new("d1", vec![tx.id], dec!(100)).unwrap(), Utc::now()).unwrap();
        receive(&db, &tx.id, "staff", Utc::now()).unwrap();
        let details = TransferDetails {
            method: "cash".into(),
            reference: "R".into(),
            proof_uri: None,
        };
        transfer(&db, &tx.id, &details, Utc::now()).unwrap();
        let err = adjust(&db, &tx.id, dec!(1), dec!(0), "late fee", Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Conflict(_)));
    }

    #[test]
    fn test_stale_version_is_rejected() {
        let db = test_db();
        let tx = seed_order(&db, "o1", dec!(100));
        collect(&db, "o1", "d1", None, Utc::now()).unwrap();

        // `tx` still carries version 1; the row is now at version 2.
        let conn = db.conn.lock().unwrap();
        let mut stale = tx.clone();
        stale.collection_status = CollectionStatus::Failed;
        let err = save(&conn, &stale, Utc::now()).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, CodError::StaleWrite { .. }));
    }

    #[test]
    fn test_collected_sum_never_below_submitted_sum() {
        let db = test_db();
        let a = collected(&db, "o1", dec!(120), "d1");
        let b = collected(&db, "o2", dec!(80), "d1");
        submit(&db, &SubmitBatch::new("d1", vec![a.id], dec!(100)).unwrap(), Utc::now()).unwrap();
        submit(&db, &SubmitBatch::new("d1", vec![b.id], dec!(80)).unwrap(), Utc::now()).unwrap();

        let conn = db.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT {SELECT_COLUMNS} FROM cod_transactions"))
            .unwrap();
        let all: Vec<CodTransaction> = stmt
            .query_map([], from_row)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let collected_sum = money::sum(
            all.iter()
                .filter(|t| t.collection_status == CollectionStatus::Collected)
                .map(|t| t.amount),
        )
        .unwrap();
        let submitted_sum = money::sum(all.iter().filter_map(|t| t.submitted_amount)).unwrap();
        assert!(collected_sum >= submitted_sum);
        assert_eq!(submitted_sum, dec!(180));
    }

    #[test]
    fn test_transaction_id_parse() {
        let id = TransactionId::new();
        assert_eq!(id.to_string().parse::<TransactionId>().unwrap(), id);
        assert!(matches!(
            "not-a-uuid".parse::<TransactionId>().unwrap_err(),
            CodError::Validation(_)
        ));
    }

    #[test]
    fn test_shortfall_share_must_cover_recorded_fee() {
        let db = test_db();
        let tx = collected(&db, "o1", dec!(100), "d1");
        adjust(&db, &tx.id, dec!(80), dec!(0), "handling fee", Utc::now()).unwrap();

        let short = SubmitBatch::new("d1", vec![tx.id], dec!(10)).unwrap();
        let err = submit(&db, &short, Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Validation(_)), "got {err:?}");

        let unchanged = get(&db, &tx.id).unwrap();
        assert!(!unchanged.submitted_to_company);
        assert_eq!(unchanged.submitted_amount, None);
        assert_eq!(crate::balance::pending_balance(&db, "d1").unwrap(), dec!(100));

        let covered = SubmitBatch::new("d1", vec![tx.id], dec!(90)).unwrap();
        submit(&db, &covered, Utc::now()).unwrap();
        let received = receive(&db, &tx.id, "staff", Utc::now()).unwrap();
        assert_eq!(received.payout_amount(), Some(dec!(10)));
        let company = crate::balance::company_balance(&db, "company-1").unwrap();
        assert_eq!(company.held_for_payout, dec!(10));
        assert!(company.awaiting_receipt >= Decimal::ZERO);
    }

    #[test]
    fn test_negative_adjustment_only_offsets_fee() {
        let db = test_db();
        let tx = collected(&db, "o1", dec!(100), "d1");

        let err = adjust(&db, &tx.id, dec!(0), dec!(-1000), "goodwill", Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Validation(_)));
        let err = adjust(&db, &tx.id, dec!(5), dec!(-5.01), "fee waived", Utc::now()).unwrap_err();
        assert!(matches!(err, CodError::Validation(_)));
        let err = adjust(&db, &tx.id, dec!(0), dec!(-2000000000000), "refund", Utc::now())
            .unwrap_err();
        assert!(matches!(err, CodError::Validation(_)));
        assert_eq!(get(&db, &tx.id).unwrap().version, tx.version);

        adjust(&db, &tx.id, dec!(5), dec!(-5), "fee waived", Utc::now()).unwrap();
        submit(&db, &SubmitBatch::new("d1", vec![tx.id], dec!(100)).unwrap(), Utc::now()).unwrap();
        let received = receive(&db, &tx.id, "staff", Utc::now()).unwrap();
        assert_eq!(received.payout_amount(), Some(dec!(100)));
    }

    #[test]
    fn test_oversized_amounts_are_rejected_and_ledger_stays_usable() {
        let db = test_db();
        for amount in [dec!(50000000000000000000000000000), money::MAX_AMOUNT + dec!(1), dec!(1.23456)] {
            let order = OrderRef {
                order_id: "huge".into(),
                company_id: "company-1".into(),
                cod_amount: amount,
            };
            let err = open_transaction(&db, &order, Utc::now()).unwrap_err();
            assert!(matches!(err, CodError::Validation(_)), "{amount}: {err:?}");
        }
        assert!(matches!(
            SubmitBatch::new("d1", vec![TransactionId::new()], dec!(50000000000000000000000000000))
                .unwrap_err(),
            CodError::Validation(_)
        ));

        let a = collected(&db, "o1", money::MAX_AMOUNT, "d1");
        let b = collected(&db, "o2", money::MAX_AMOUNT, "d1");
        let err = adjust(&db, &a.id, dec!(50000000000000000000000000000), dec!(0), "fee", Utc::now())
            .unwrap_err();
        assert!(matches!(err, CodError::Validation(_)));

        assert_eq!(
            crate::balance::pending_balance(&db, "d1").unwrap(),
            dec!(2000000000000)
        );
        let batch = SubmitBatch::new("d1", vec![a.id, b.id], dec!(2000000000000)).unwrap();
        submit(&db, &batch, Utc::now()).unwrap();
        receive(&db, &a.id, "staff", Utc::now()).unwrap();
        let company = crate::balance::company_balance(&db, "company-1").unwrap();
        assert_eq!(company.held_for_payout, money::MAX_AMOUNT);
        assert_eq!(company.awaiting_receipt, money::MAX_AMOUNT);
        assert!(db.lock().is_ok());
    }

    #[test]
    fn test_unreadable_event_payload_is_corrupt_record() {
        let db = test_db();
        let tx = collected(&db, "o1", dec!(100), "d1");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE cod_transaction_events SET payload = 'not json' WHERE transaction_id = ?1",
                params![tx.id.to_string()],
            )
            .unwrap();
        }
        let err = events(&db, &tx.id).unwrap_err();
        assert!(matches!(err, CodError::CorruptRecord(_)), "got {err:?}");
        assert_eq!(err.kind(), crate::ErrorKind::Failure);
    }
}
