//! COD dashboard rollups.
//!
//! Computed on demand from the transaction store; nothing here is cached.
//! Buckets partition the transactions in scope: every row lands in exactly
//! one bucket, chosen from its derived overall status.

use rusqlite::types::{Type, Value as SqlValue};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::DbState;
use crate::error::CodResult;
use crate::money::{self, amount_col};
use crate::transactions::{CollectionStatus, OverallStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum DashboardScope {
    Global,
    Company(String),
    Driver(String),
}

impl From<Option<String>> for DashboardScope {
    fn from(company_id: Option<String>) -> Self {
        company_id.map_or(DashboardScope::Global, DashboardScope::Company)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub sum: Decimal,
    pub count: u64,
}

impl Bucket {
    fn add(&mut self, amount: Decimal) -> CodResult<()> {
        self.sum = money::add(self.sum, amount)?;
        self.count += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodDashboard {
    pub pending_collection: Bucket,
    /// Collected, not yet submitted.
    pub collected: Bucket,
    /// Submitted, not yet received.
    pub submitted: Bucket,
    /// Received, payout not yet recorded.
    pub awaiting_payout: Bucket,
    pub transferred: Bucket,
    pub failed: Bucket,
}

impl CodDashboard {
    pub fn total_count(&self) -> u64 {
        [
            self.pending_collection,
            self.collected,
            self.submitted,
            self.awaiting_payout,
            self.transferred,
            self.failed,
        ]
        .iter()
        .map(|b| b.count)
        .sum()
    }
}

pub fn dashboard(db: &DbState, scope: &DashboardScope) -> CodResult<CodDashboard> {
    let (filter, args): (&str, Vec<SqlValue>) = match scope {
        DashboardScope::Global => ("", Vec::new()),
        DashboardScope::Company(id) => ("WHERE company_id = ?1", vec![SqlValue::Text(id.clone())]),
        DashboardScope::Driver(id) => (
            "WHERE collected_by_driver_id = ?1",
            vec![SqlValue::Text(id.clone())],
        ),
    };

    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT amount, collection_status, submitted_to_company,
                company_received_by_user_id IS NOT NULL, transferred_to_sender
         FROM cod_transactions {filter}"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), |row| {
            let status: String = row.get(1)?;
            let collection = CollectionStatus::parse(&status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    Type::Text,
                    format!("collection status '{status}'").into(),
                )
            })?;
            Ok((
                amount_col(row, 0)?,
                collection,
                row.get::<_, bool>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut board = CodDashboard::default();
    for (amount, collection, submitted, received, transferred) in rows {
        let bucket = match OverallStatus::derive(collection, submitted, received) {
            OverallStatus::PendingCollection => &mut board.pending_collection,
            OverallStatus::Collected => &mut board.collected,
            OverallStatus::SubmittedToCompany => &mut board.submitted,
            OverallStatus::Completed if transferred => &mut board.transferred,
            OverallStatus::Completed => &mut board.awaiting_payout,
            OverallStatus::Failed => &mut board.failed,
        };
        bucket.add(amount)?;
    }
    Ok(board)
}
