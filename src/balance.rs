//! Cash-in-custody views.
//!
//! Pure reads over `cod_transactions`. Each view is one SELECT under the
//! connection lock, so a Submit is seen either entirely or not at all.

use rusqlite::params;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::db::DbState;
use crate::error::CodResult;
use crate::money::{self, amount_col, opt_amount_col};

/// Cash the driver has collected and not yet handed to the company.
pub fn pending_balance(db: &DbState, driver_id: &str) -> CodResult<Decimal> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT amount FROM cod_transactions
         WHERE collected_by_driver_id = ?1
           AND collection_status = 'collected'
           AND submitted_to_company = 0",
    )?;
    let amounts = stmt
        .query_map(params![driver_id], |row| amount_col(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    money::sum(amounts)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyBalance {
    /// Submitted by drivers, not yet confirmed received by staff.
    pub awaiting_receipt: Decimal,
    /// Received and owed to senders (net of fees and adjustments).
    pub held_for_payout: Decimal,
}

pub fn company_balance(db: &DbState, company_id: &str) -> CodResult<CompanyBalance> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT amount, submitted_amount, company_fee, adjustment_amount,
                company_received_by_user_id IS NOT NULL
         FROM cod_transactions
         WHERE company_id = ?1
           AND submitted_to_company = 1
           AND transferred_to_sender = 0",
    )?;
    let rows = stmt
        .query_map(params![company_id], |row| {
            Ok((
                amount_col(row, 0)?,
                opt_amount_col(row, 1)?,
                opt_amount_col(row, 2)?,
                opt_amount_col(row, 3)?,
                row.get::<_, bool>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut balance = CompanyBalance::default();
    for (amount, submitted, fee, adjustment, received) in rows {
        let submitted = submitted.unwrap_or(amount);
        if received {
            let deductions = money::add(
                fee.unwrap_or(Decimal::ZERO),
                adjustment.unwrap_or(Decimal::ZERO),
            )?;
            balance.held_for_payout = money::add(balance.held_for_payout, submitted - deductions)?;
        } else {
            balance.awaiting_receipt = money::add(balance.awaiting_receipt, submitted)?;
        }
    }
    Ok(balance)
}
