//! COD custody ledger.
//!
//! Tracks cash-on-delivery money from the moment a driver takes it at the
//! door, through hand-over to the delivery company, to payout to the sender.
//! State lives in a local SQLite database; [`CodLedger`] is the entry point
//! and [`commands`] exposes it as JSON commands for the `cod-custody` binary.

pub mod balance;
pub mod clock;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod money;
pub mod reconciliation;
pub mod transactions;

pub use balance::CompanyBalance;
pub use clock::{Clock, SystemClock};
pub use collaborators::{
    DriverDirectory, DriverRef, HttpProofUploader, Notifier, OrderDirectory, OrderRef,
    ProofUploader, SqliteDirectory, TracingNotifier, WebhookNotifier,
};
pub use config::LedgerConfig;
pub use dashboard::{Bucket, CodDashboard, DashboardScope};
pub use error::{CodError, CodResult, ErrorKind};
pub use ledger::{CodLedger, ProofInput};
pub use reconciliation::{DriverCodSummary, DriverFailure, ReconcileAllReport, ReconciliationStatus};
pub use transactions::{
    CodTransaction, CodTransactionEvent, CollectionStatus, OverallStatus, SubmitBatch,
    TransactionId, TransferDetails,
};
