//! `CodLedger`: the boundary the order workflow, driver app and back office
//! talk to.
//!
//! Wraps the store functions with collaborator lookups. Directory lookups and
//! proof uploads run before the mutation (and before the database lock is
//! taken); notifications run after commit and only ever log their failures.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::balance::{self, CompanyBalance};
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    DriverDirectory, DriverRef, HttpProofUploader, Notifier, OrderDirectory, ProofUploader,
    SqliteDirectory, TracingNotifier, WebhookNotifier,
};
use crate::config::LedgerConfig;
use crate::dashboard::{self, CodDashboard, DashboardScope};
use crate::db::{self, DbState};
use crate::error::{CodError, CodResult};
use crate::reconciliation::{self, DriverCodSummary, ReconcileAllReport};
use crate::transactions::{
    self, CodTransaction, CodTransactionEvent, SubmitBatch, TransactionId, TransferDetails,
};

/// Proof of collection as handed over by the driver app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofInput {
    /// Already stored elsewhere.
    Uri(String),
    /// Raw image to push through the configured [`ProofUploader`].
    Upload { bytes: Vec<u8>, content_type: String },
}

pub struct CodLedger {
    db: Arc<DbState>,
    orders: Arc<dyn OrderDirectory>,
    drivers: Arc<dyn DriverDirectory>,
    uploader: Option<Arc<dyn ProofUploader>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl CodLedger {
    /// Ledger backed by the reference tables in `db`, logging notifications
    /// and without a proof uploader.
    pub fn new(db: Arc<DbState>) -> Self {
        let directory = Arc::new(SqliteDirectory::new(db.clone()));
        CodLedger {
            db,
            orders: directory.clone(),
            drivers: directory,
            uploader: None,
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
        }
    }

    /// Open the configured database and wire the HTTP collaborators it names.
    pub fn from_config(config: &LedgerConfig) -> CodResult<Self> {
        let db = Arc::new(db::init(&config.database_path)?);
        let mut ledger = CodLedger::new(db);
        if let Some(url) = &config.proof_upload_url {
            ledger = ledger.with_uploader(Arc::new(HttpProofUploader::new(
                url,
                config.http_timeout(),
            )?));
        }
        if let Some(url) = &config.notify_webhook_url {
            ledger = ledger.with_notifier(Arc::new(WebhookNotifier::new(
                url,
                config.http_timeout(),
            )?));
        }
        Ok(ledger)
    }

    pub fn with_orders(mut self, orders: Arc<dyn OrderDirectory>) -> Self {
        self.orders = orders;
        self
    }

    pub fn with_drivers(mut self, drivers: Arc<dyn DriverDirectory>) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn ProofUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn open_for_order(&self, order_id: &str) -> CodResult<CodTransaction> {
        let order = self
            .orders
            .find_order(order_id)?
            .ok_or_else(|| CodError::not_found("order", order_id))?;
        let tx = transactions::open_transaction(&self.db, &order, self.clock.now())?;
        self.announce(&tx);
        Ok(tx)
    }

    pub fn collect(
        &self,
        order_id: &str,
        driver_id: &str,
        proof: Option<ProofInput>,
    ) -> CodResult<CodTransaction> {
        let driver = self.require_driver(driver_id)?;
        if !driver.is_active {
            return Err(CodError::Validation(format!("driver {driver_id} is inactive")));
        }
        let current = transactions::get_by_order(&self.db, order_id)?;
        if driver.company_id != current.company_id {
            return Err(CodError::Validation(format!(
                "driver {driver_id} does not deliver for company {}",
                current.company_id
            )));
        }

        let proof_uri = match proof {
            None => None,
            Some(ProofInput::Uri(uri)) => Some(uri),
            Some(ProofInput::Upload {
                bytes,
                content_type,
            }) => {
                let uploader = self.uploader.as_ref().ok_or_else(|| {
                    CodError::Collaborator("no proof uploader is configured".into())
                })?;
                let uri = uploader.upload(&bytes, &content_type)?;
                debug!(order_id = %order_id, uri = %uri, "Collection proof uploaded");
                Some(uri)
            }
        };

        let tx = transactions::collect(&self.db, order_id, driver_id, proof_uri, self.clock.now())?;
        self.announce(&tx);
        Ok(tx)
    }

    pub fn fail_collection(&self, order_id: &str, reason: &str) -> CodResult<CodTransaction> {
        let tx = transactions::fail_collection(&self.db, order_id, reason, self.clock.now())?;
        self.announce(&tx);
        Ok(tx)
    }

    pub fn submit(&self, batch: &SubmitBatch) -> CodResult<Vec<CodTransaction>> {
        self.require_driver(batch.driver_id())?;
        let rows = transactions::submit(&self.db, batch, self.clock.now())?;
        for tx in &rows {
            self.announce(tx);
        }
        Ok(rows)
    }

    pub fn receive(&self, id: &TransactionId, received_by: &str) -> CodResult<CodTransaction> {
        let tx = transactions::receive(&self.db, id, received_by, self.clock.now())?;
        self.announce(&tx);
        Ok(tx)
    }

    pub fn transfer(
        &self,
        id: &TransactionId,
        details: &TransferDetails,
    ) -> CodResult<CodTransaction> {
        let tx = transactions::transfer(&self.db, id, details, self.clock.now())?;
        self.announce(&tx);
        Ok(tx)
    }

    pub fn adjust(
        &self,
        id: &TransactionId,
        fee: Decimal,
        adjustment: Decimal,
        reason: &str,
    ) -> CodResult<CodTransaction> {
        transactions::adjust(&self.db, id, fee, adjustment, reason, self.clock.now())
    }

    // -- reads --------------------------------------------------------------

    pub fn transaction(&self, id: &TransactionId) -> CodResult<CodTransaction> {
        transactions::get(&self.db, id)
    }

    pub fn transaction_for_order(&self, order_id: &str) -> CodResult<CodTransaction> {
        transactions::get_by_order(&self.db, order_id)
    }

    pub fn history(&self, id: &TransactionId) -> CodResult<Vec<CodTransactionEvent>> {
        transactions::events(&self.db, id)
    }

    pub fn held_by_driver(&self, driver_id: &str) -> CodResult<Vec<CodTransaction>> {
        self.require_driver(driver_id)?;
        transactions::list_held_by_driver(&self.db, driver_id)
    }

    pub fn pending_balance(&self, driver_id: &str) -> CodResult<Decimal> {
        self.require_driver(driver_id)?;
        balance::pending_balance(&self.db, driver_id)
    }

    pub fn company_balance(&self, company_id: &str) -> CodResult<CompanyBalance> {
        balance::company_balance(&self.db, company_id)
    }

    pub fn dashboard(&self, scope: &DashboardScope) -> CodResult<CodDashboard> {
        dashboard::dashboard(&self.db, scope)
    }

    // -- reconciliation -----------------------------------------------------

    pub fn reconcile(
        &self,
        driver_id: &str,
        date: NaiveDate,
        reconciled_by: &str,
    ) -> CodResult<DriverCodSummary> {
        self.require_driver(driver_id)?;
        reconciliation::reconcile(&self.db, driver_id, date, reconciled_by, self.clock.now())
    }

    pub fn reconcile_all(
        &self,
        date: NaiveDate,
        company_id: &str,
        reconciled_by: &str,
    ) -> CodResult<ReconcileAllReport> {
        reconciliation::reconcile_all(
            &self.db,
            self.drivers.as_ref(),
            date,
            company_id,
            reconciled_by,
            self.clock.now(),
        )
    }

    pub fn summary(&self, driver_id: &str, date: NaiveDate) -> CodResult<Option<DriverCodSummary>> {
        reconciliation::get_summary(&self.db, driver_id, date)
    }

    // -- helpers ------------------------------------------------------------

    fn require_driver(&self, driver_id: &str) -> CodResult<DriverRef> {
        self.drivers
            .find_driver(driver_id)?
            .ok_or_else(|| CodError::not_found("driver", driver_id))
    }

    fn announce(&self, tx: &CodTransaction) {
        let status = tx.overall_status();
        if let Err(e) = self.notifier.notify(&tx.order_id, status) {
            warn!(
                order_id = %tx.order_id,
                status = %status,
                error = %e,
                "COD status notification failed"
            );
        }
    }
}
