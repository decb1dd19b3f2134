//! Driver/day reconciliation of COD cash.
//!
//! Owns the `driver_cod_summaries` table. Totals are refreshed by every
//! transaction mutation that touches a driver's day (inside the mutation's own
//! SQLite transaction), but `reconciliation_status` only changes when staff
//! run [`reconcile`]. Reconciling always recomputes from the transaction
//! store, so a day reconciled earlier flips to `discrepancy` if late
//! collections arrive.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{day_bounds, format_ts, opt_ts_col, ts_col};
use crate::collaborators::DriverDirectory;
use crate::db::{self, DbState};
use crate::error::{CodError, CodResult, ErrorKind};
use crate::money::{self, amount_col};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Pending,
    Reconciled,
    Discrepancy,
}

impl ReconciliationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconciliationStatus::Pending => "pending",
            ReconciliationStatus::Reconciled => "reconciled",
            ReconciliationStatus::Discrepancy => "discrepancy",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ReconciliationStatus::Pending),
            "reconciled" => Some(ReconciliationStatus::Reconciled),
            "discrepancy" => Some(ReconciliationStatus::Discrepancy),
            _ => None,
        }
    }
}

impl fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverCodSummary {
    pub driver_id: String,
    pub date: NaiveDate,
    pub total_collected: Decimal,
    pub total_submitted: Decimal,
    /// Submitted amounts the company has confirmed receiving.
    pub total_received: Decimal,
    pub pending_amount: Decimal,
    pub reconciliation_status: ReconciliationStatus,
    pub reconciled_by_user_id: Option<String>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverFailure {
    pub driver_id: String,
    pub kind: ErrorKind,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileAllReport {
    pub company_id: String,
    pub date: NaiveDate,
    pub summaries: Vec<DriverCodSummary>,
    pub failures: Vec<DriverFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DayTotals {
    collected: Decimal,
    submitted: Decimal,
    received: Decimal,
}

impl DayTotals {
    fn pending(&self) -> Decimal {
        (self.collected - self.submitted).max(Decimal::ZERO)
    }

    fn status(&self) -> ReconciliationStatus {
        if self.pending().is_zero() && self.submitted == self.received {
            ReconciliationStatus::Reconciled
        } else {
            ReconciliationStatus::Discrepancy
        }
    }
}

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

/// Sum the driver's non-failed collections whose `collected_at` falls on `date`.
fn compute_totals(conn: &Connection, driver_id: &str, date: NaiveDate) -> CodResult<DayTotals> {
    let (start, end) = day_bounds(date);
    let mut stmt = conn.prepare(
        "SELECT amount, submitted_to_company, submitted_amount,
                company_received_by_user_id IS NOT NULL
         FROM cod_transactions
         WHERE collected_by_driver_id = ?1
           AND collection_status = 'collected'
           AND collected_at >= ?2 AND collected_at < ?3",
    )?;
    let rows = stmt
        .query_map(params![driver_id, start, end], |row| {
            let amount = amount_col(row, 0)?;
            let submitted: bool = row.get(1)?;
            let submitted_amount = money::opt_amount_col(row, 2)?;
            let received: bool = row.get(3)?;
            Ok((amount, submitted, submitted_amount, received))
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| match e {
            rusqlite::Error::FromSqlConversionFailure(..) => {
                CodError::CorruptRecord(format!("driver {driver_id} on {date}: {e}"))
            }
            other => CodError::Storage(other),
        })?;

    let mut totals = DayTotals::default();
    for (amount, submitted, submitted_amount, received) in rows {
        totals.collected = money::add(totals.collected, amount)?;
        if submitted {
            let part = submitted_amount.unwrap_or(amount);
            totals.submitted = money::add(totals.submitted, part)?;
            if received {
                totals.received = money::add(totals.received, part)?;
            }
        }
    }
    Ok(totals)
}

/// Refresh stored totals for a driver/day without touching its status.
pub(crate) fn refresh_totals(
    conn: &Connection,
    driver_id: &str,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> CodResult<()> {
    let totals = compute_totals(conn, driver_id, date)?;
    conn.execute(
        "INSERT INTO driver_cod_summaries (driver_id, summary_date, total_collected,
            total_submitted, total_received, pending_amount, reconciliation_status, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)
         ON CONFLICT(driver_id, summary_date) DO UPDATE SET
            total_collected = excluded.total_collected,
            total_submitted = excluded.total_submitted,
            total_received = excluded.total_received,
            pending_amount = excluded.pending_amount,
            updated_at = excluded.updated_at",
        params![
            driver_id,
            date.to_string(),
            money::to_db(totals.collected),
            money::to_db(totals.submitted),
            money::to_db(totals.received),
            money::to_db(totals.pending()),
            format_ts(now),
        ],
    )?;
    Ok(())
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<DriverCodSummary> {
    let raw_date: String = row.get(1)?;
    let date = raw_date.parse::<NaiveDate>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
    })?;
    let raw_status: String = row.get(6)?;
    let reconciliation_status = ReconciliationStatus::parse(&raw_status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            Type::Text,
            format!("reconciliation status '{raw_status}'").into(),
        )
    })?;
    Ok(DriverCodSummary {
        driver_id: row.get(0)?,
        date,
        total_collected: amount_col(row, 2)?,
        total_submitted: amount_col(row, 3)?,
        total_received: amount_col(row, 4)?,
        pending_amount: amount_col(row, 5)?,
        reconciliation_status,
        reconciled_by_user_id: row.get(7)?,
        reconciled_at: opt_ts_col(row, 8)?,
        updated_at: ts_col(row, 9)?,
    })
}

fn load_summary(
    conn: &Connection,
    driver_id: &str,
    date: NaiveDate,
) -> CodResult<Option<DriverCodSummary>> {
    let summary = conn
        .query_row(
            "SELECT driver_id, summary_date, total_collected, total_submitted, total_received,
                    pending_amount, reconciliation_status, reconciled_by_user_id,
                    reconciled_at, updated_at
             FROM driver_cod_summaries WHERE driver_id = ?1 AND summary_date = ?2",
            params![driver_id, date.to_string()],
            summary_from_row,
        )
        .optional()?;
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

/// Recompute a driver's day and record the outcome.
///
/// `reconciled` when nothing collected is left unsubmitted and every submitted
/// amount has a company receipt; `discrepancy` otherwise. A day with no
/// collections reconciles trivially.
pub fn reconcile(
    db: &DbState,
    driver_id: &str,
    date: NaiveDate,
    reconciled_by: &str,
    now: DateTime<Utc>,
) -> CodResult<DriverCodSummary> {
    if reconciled_by.trim().is_empty() {
        return Err(CodError::Validation("reconciling user is required".into()));
    }

    let conn = db.lock()?;
    db::with_immediate_tx(&conn, |conn| {
        let totals = compute_totals(conn, driver_id, date)?;
        let status = totals.status();
        let ts = format_ts(now);

        conn.execute(
            "INSERT INTO driver_cod_summaries (driver_id, summary_date, total_collected,
                total_submitted, total_received, pending_amount, reconciliation_status,
                reconciled_by_user_id, reconciled_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(driver_id, summary_date) DO UPDATE SET
                total_collected = excluded.total_collected,
                total_submitted = excluded.total_submitted,
                total_received = excluded.total_received,
                pending_amount = excluded.pending_amount,
                reconciliation_status = excluded.reconciliation_status,
                reconciled_by_user_id = excluded.reconciled_by_user_id,
                reconciled_at = excluded.reconciled_at,
                updated_at = excluded.updated_at",
            params![
                driver_id,
                date.to_string(),
                money::to_db(totals.collected),
                money::to_db(totals.submitted),
                money::to_db(totals.received),
                money::to_db(totals.pending()),
                status.as_str(),
                reconciled_by.trim(),
                ts,
            ],
        )?;

        if status == ReconciliationStatus::Discrepancy {
            warn!(
                driver_id = %driver_id,
                date = %date,
                collected = %totals.collected,
                submitted = %totals.submitted,
                received = %totals.received,
                "COD reconciliation discrepancy"
            );
        } else {
            info!(driver_id = %driver_id, date = %date, total = %totals.collected, "COD day reconciled");
        }

        load_summary(conn, driver_id, date)?
            .ok_or_else(|| CodError::not_found("driver summary", format!("{driver_id}/{date}")))
    })
}

/// Reconcile every active driver of `company_id`, continuing past failures.
pub fn reconcile_all(
    db: &DbState,
    drivers: &dyn DriverDirectory,
    date: NaiveDate,
    company_id: &str,
    reconciled_by: &str,
    now: DateTime<Utc>,
) -> CodResult<ReconcileAllReport> {
    let roster = drivers.drivers_for_company(company_id)?;
    let mut report = ReconcileAllReport {
        company_id: company_id.to_string(),
        date,
        summaries: Vec::with_capacity(roster.len()),
        failures: Vec::new(),
    };

    for driver in roster {
        match reconcile(db, &driver.driver_id, date, reconciled_by, now) {
            Ok(summary) => report.summaries.push(summary),
            Err(e) => {
                warn!(driver_id = %driver.driver_id, error = %e, "Driver reconciliation failed");
                report.failures.push(DriverFailure {
                    driver_id: driver.driver_id,
                    kind: e.kind(),
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        company_id = %company_id,
        date = %date,
        reconciled = report.summaries.len(),
        failed = report.failures.len(),
        "Company reconciliation finished"
    );
    Ok(report)
}

pub fn get_summary(
    db: &DbState,
    driver_id: &str,
    date: NaiveDate,
) -> CodResult<Option<DriverCodSummary>> {
    let conn = db.lock()?;
    load_summary(&conn, driver_id, date)
}
