//! Local SQLite storage for the COD custody ledger.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the shared
//! connection state, and the `BEGIN IMMEDIATE` wrapper every state
//! transition runs inside.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::CodResult;

/// Shared database state. One connection, serialized by the mutex.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> CodResult<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock()?)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Open (or create) the database file at `db_path` and run pending migrations.
pub fn init(db_path: &Path) -> CodResult<DbState> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), error = %e, "Failed to create database directory");
                return Err(rusqlite::Error::InvalidPath(parent.to_path_buf()).into());
            }
        }
    }

    info!("Opening database at {}", db_path.display());
    let conn = Connection::open(db_path)?;
    configure(&conn, true)?;
    run_migrations(&conn)?;

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: db_path.to_path_buf(),
    })
}

/// In-memory database with the full schema. Used by tests and dry runs.
pub fn open_in_memory() -> CodResult<DbState> {
    let conn = Connection::open_in_memory()?;
    configure(&conn, false)?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn configure(conn: &Connection, wal: bool) -> CodResult<()> {
    if wal {
        // journal_mode returns a row, so it cannot go through execute_batch
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(mode = %mode, "WAL journal mode not available");
        }
    }
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Run `f` inside `BEGIN IMMEDIATE … COMMIT`, rolling back on any error.
///
/// `BEGIN IMMEDIATE` takes the write lock up front so two processes sharing
/// the file cannot both read-validate the same row before either writes.
pub fn with_immediate_tx<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> CodResult<T>,
) -> CodResult<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> CodResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn mark_version(conn: &Connection, version: i32) -> CodResult<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )?;
    Ok(())
}

/// v1: reference tables fed by the order workflow, and the transaction store.
fn migrate_v1(conn: &Connection) -> CodResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            cod_amount TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS drivers (
            id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            name TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_drivers_company ON drivers(company_id);

        CREATE TABLE IF NOT EXISTS cod_transactions (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL UNIQUE,
            company_id TEXT NOT NULL,
            amount TEXT NOT NULL,
            collection_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (collection_status IN ('pending', 'collected', 'failed')),
            collected_by_driver_id TEXT,
            collected_at TEXT,
            collection_proof TEXT,
            failure_reason TEXT,
            submitted_to_company INTEGER NOT NULL DEFAULT 0,
            submitted_at TEXT,
            submitted_amount TEXT,
            company_received_by_user_id TEXT,
            company_received_at TEXT,
            transferred_to_sender INTEGER NOT NULL DEFAULT 0,
            transferred_at TEXT,
            transfer_method TEXT,
            transfer_reference TEXT,
            transfer_proof TEXT,
            company_fee TEXT,
            adjustment_amount TEXT,
            adjustment_reason TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (transferred_to_sender = 0
                   OR (submitted_to_company = 1 AND company_received_by_user_id IS NOT NULL)),
            CHECK (collection_status <> 'failed'
                   OR (submitted_to_company = 0
                       AND company_received_by_user_id IS NULL
                       AND transferred_to_sender = 0))
        );
        CREATE INDEX IF NOT EXISTS idx_cod_tx_driver
            ON cod_transactions(collected_by_driver_id, collection_status, submitted_to_company);
        CREATE INDEX IF NOT EXISTS idx_cod_tx_company ON cod_transactions(company_id);
        CREATE INDEX IF NOT EXISTS idx_cod_tx_collected_at ON cod_transactions(collected_at);",
    )?;
    mark_version(conn, 1)?;
    info!("Applied migration v1");
    Ok(())
}

/// v2: append-only audit trail of transaction mutations.
fn migrate_v2(conn: &Connection) -> CodResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cod_transaction_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id TEXT NOT NULL REFERENCES cod_transactions(id),
            event_type TEXT NOT NULL,
            actor_id TEXT,
            payload TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cod_events_tx ON cod_transaction_events(transaction_id);",
    )?;
    mark_version(conn, 2)?;
    info!("Applied migration v2");
    Ok(())
}

/// v3: per driver per day reconciliation summaries.
fn migrate_v3(conn: &Connection) -> CodResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS driver_cod_summaries (
            driver_id TEXT NOT NULL,
            summary_date TEXT NOT NULL,
            total_collected TEXT NOT NULL DEFAULT '0',
            total_submitted TEXT NOT NULL DEFAULT '0',
            total_received TEXT NOT NULL DEFAULT '0',
            pending_amount TEXT NOT NULL DEFAULT '0',
            reconciliation_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (reconciliation_status IN ('pending', 'reconciled', 'discrepancy')),
            reconciled_by_user_id TEXT,
            reconciled_at TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (driver_id, summary_date)
        );",
    )?;
    mark_version(conn, 3)?;
    info!("Applied migration v3");
    Ok(())
}
