//! Fixed-point money helpers.
//!
//! Amounts are `rust_decimal::Decimal` in memory and canonical decimal TEXT in
//! SQLite. SQLite's `SUM()` would coerce TEXT to REAL, so every total in this
//! crate is summed in Rust from the stored strings.

use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::Row;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{CodError, CodResult};

/// Parse a stored amount column.
pub fn parse_amount(raw: &str) -> CodResult<Decimal> {
    Decimal::from_str(raw.trim())
        .map_err(|e| CodError::CorruptRecord(format!("bad decimal '{raw}': {e}")))
}

/// Read a TEXT amount column inside a rusqlite row mapper.
pub fn amount_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(raw.trim())
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn opt_amount_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        Decimal::from_str(raw.trim())
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Canonical storage form. `normalize` drops trailing zeros so equal values
/// always produce equal strings.
pub fn to_db(amount: Decimal) -> String {
    amount.normalize().to_string()
}

/// Largest amount a single COD obligation (or fee, adjustment, declared
/// total) may carry.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0xD4A5_1000, 0xE8, 0, false, 0);

/// Finest fraction accepted for incoming amounts.
pub const MAX_SCALE: u32 = 4;

/// Reject amounts outside `[-MAX_AMOUNT, MAX_AMOUNT]` or finer than `MAX_SCALE`.
///
/// Bounding inputs keeps every total the ledger can build far below
/// `Decimal::MAX`.
pub fn check_amount(amount: Decimal, what: &str) -> CodResult<()> {
    if amount.abs() > MAX_AMOUNT {
        return Err(CodError::Validation(format!(
            "{what} {amount} exceeds the maximum of {MAX_AMOUNT}"
        )));
    }
    if amount.normalize().scale() > MAX_SCALE {
        return Err(CodError::Validation(format!(
            "{what} {amount} has more than {MAX_SCALE} decimal places"
        )));
    }
    Ok(())
}

/// Overflow-checked addition.
pub fn add(a: Decimal, b: Decimal) -> CodResult<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| CodError::Validation(format!("amount overflow adding {a} and {b}")))
}

pub fn sum<I: IntoIterator<Item = Decimal>>(amounts: I) -> CodResult<Decimal> {
    amounts.into_iter().try_fold(Decimal::ZERO, add)
}

/// Split `total` across `weights` pro rata, using the largest-remainder method
/// at the finest scale present in the inputs.
///
/// Guarantees: the parts sum to `total` exactly and, when
/// `0 <= total <= sum(weights)`, no part exceeds its own weight.
pub fn apportion(total: Decimal, weights: &[Decimal]) -> CodResult<Vec<Decimal>> {
    let weight_sum = sum(weights.iter().copied())?;
    if weights.is_empty() || weight_sum.is_zero() {
        return Ok(vec![Decimal::ZERO; weights.len()]);
    }
    if total == weight_sum {
        return Ok(weights.to_vec());
    }

    let scale = weights
        .iter()
        .map(Decimal::scale)
        .chain(std::iter::once(total.scale()))
        .max()
        .unwrap_or(0);
    let unit = Decimal::new(1, scale);

    let mut parts = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    for (idx, weight) in weights.iter().enumerate() {
        let exact = weight
            .checked_mul(total)
            .and_then(|product| product.checked_div(weight_sum))
            .ok_or_else(|| {
                CodError::Validation(format!("cannot apportion {total} over {weight_sum}"))
            })?;
        let floored = exact.round_dp_with_strategy(scale, RoundingStrategy::ToNegativeInfinity);
        remainders.push((exact - floored, idx));
        parts.push(floored);
    }

    // Leftover is a whole number of units smaller than the number of parts.
    let mut leftover = total - sum(parts.iter().copied())?;
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, idx) in remainders {
        if leftover < unit {
            break;
        }
        parts[idx] += unit;
        leftover -= unit;
    }

    Ok(parts)
}
