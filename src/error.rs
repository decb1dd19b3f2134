//! Error taxonomy for the COD custody ledger.
//!
//! Every fallible operation returns [`CodError`]. Callers branch on
//! [`CodError::kind`] rather than on individual variants: `NotFound` and
//! `Validation` are caller mistakes and must not be retried, `Conflict`
//! means the current state forbids the operation, and `Failure` covers
//! storage and collaborator problems where nothing was committed.

use std::fmt;

use rusqlite::ErrorCode;
use serde::Serialize;

/// Coarse classification used by callers and the command bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Failure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Failure => "failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    /// A Submit batch was rejected; every offending transaction is named.
    #[error("submission rejected, transactions not eligible: {}", .transaction_ids.join(", "))]
    BatchConflict { transaction_ids: Vec<String> },

    /// The row changed between read and write (version token mismatch).
    #[error("transaction {transaction_id} was modified concurrently, re-read and retry")]
    StaleWrite { transaction_id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    /// A collaborator call (proof upload, webhook) failed before any state change.
    #[error("collaborator call failed: {0}")]
    Collaborator(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

impl CodError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CodError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CodError::NotFound { .. } => ErrorKind::NotFound,
            CodError::Conflict(_) | CodError::BatchConflict { .. } | CodError::StaleWrite { .. } => {
                ErrorKind::Conflict
            }
            CodError::Validation(_) => ErrorKind::Validation,
            CodError::Collaborator(_)
            | CodError::Storage(_)
            | CodError::LockPoisoned
            | CodError::CorruptRecord(_) => ErrorKind::Failure,
        }
    }

    /// True when re-invoking the same operation after re-reading state may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CodError::StaleWrite { .. } => true,
            CodError::Storage(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            _ => false,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for CodError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        CodError::LockPoisoned
    }
}

pub type CodResult<T> = Result<T, CodError>;
