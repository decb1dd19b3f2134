use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use cod_custody::{
    db, Clock, CodResult, CodLedger, DashboardScope, DriverRef, ErrorKind, Notifier, OrderRef,
    OverallStatus, ProofInput, ReconciliationStatus, SqliteDirectory, SubmitBatch,
    TransferDetails,
};
use rust_decimal_macros::dec;

struct StepClock(Mutex<DateTime<Utc>>);

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.0.lock().unwrap();
        *now += Duration::minutes(5);
        *now
    }
}

#[derive(Default)]
struct Outbox(Mutex<Vec<(String, OverallStatus)>>);

impl Notifier for Outbox {
    fn notify(&self, order_id: &str, status: OverallStatus) -> CodResult<()> {
        self.0.lock().unwrap().push((order_id.to_string(), status));
        Ok(())
    }
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 14).unwrap()
}

fn ledger() -> (CodLedger, Arc<Outbox>) {
    let db = Arc::new(db::open_in_memory().unwrap());
    let directory = SqliteDirectory::new(db.clone());
    directory
        .register_driver(&DriverRef {
            driver_id: "D1".into(),
            company_id: "company-1".into(),
            name: Some("Dana".into()),
            is_active: true,
        })
        .unwrap();
    for (order_id, amount) in [("O1", dec!(500000)), ("O2", dec!(200000)), ("O3", dec!(100000))] {
        directory
            .register_order(&OrderRef {
                order_id: order_id.into(),
                company_id: "company-1".into(),
                cod_amount: amount,
            })
            .unwrap();
    }

    let start = Utc.with_ymd_and_hms(2026, 10, 14, 8, 0, 0).unwrap();
    let outbox = Arc::new(Outbox::default());
    let ledger = CodLedger::new(db)
        .with_clock(Arc::new(StepClock(Mutex::new(start))))
        .with_notifier(outbox.clone());
    (ledger, outbox)
}

#[test]
fn full_custody_chain_reconciles() {
    let (ledger, outbox) = ledger();

    let opened = ledger.open_for_order("O1").unwrap();
    assert_eq!(opened.overall_status(), OverallStatus::PendingCollection);

    let collected = ledger
        .collect("O1", "D1", Some(ProofInput::Uri("proof://o1".into())))
        .unwrap();
    assert_eq!(collected.overall_status(), OverallStatus::Collected);
    assert_eq!(ledger.pending_balance("D1").unwrap(), dec!(500000));

    let batch = SubmitBatch::new("D1", vec![collected.id], dec!(500000)).unwrap();
    let submitted = ledger.submit(&batch).unwrap();
    assert_eq!(submitted[0].submitted_amount, Some(dec!(500000)));
    assert_eq!(submitted[0].overall_status(), OverallStatus::SubmittedToCompany);

    let received = ledger.receive(&collected.id, "S1").unwrap();
    assert_eq!(received.overall_status(), OverallStatus::Completed);

    let summary = ledger.reconcile("D1", day(), "S1").unwrap();
    assert_eq!(summary.total_collected, dec!(500000));
    assert_eq!(summary.total_submitted, dec!(500000));
    assert_eq!(summary.pending_amount, dec!(0));
    assert_eq!(summary.reconciliation_status, ReconciliationStatus::Reconciled);

    let details = TransferDetails {
        method: "bank_transfer".into(),
        reference: "PAY-0001".into(),
        proof_uri: None,
    };
    let transferred = ledger.transfer(&collected.id, &details).unwrap();
    assert!(transferred.transferred_to_sender);
    assert_eq!(transferred.submitted_amount, received.submitted_amount);
    assert_eq!(transferred.company_received_by_user_id, received.company_received_by_user_id);

    let board = ledger
        .dashboard(&DashboardScope::Company("company-1".into()))
        .unwrap();
    assert_eq!(board.transferred.sum, dec!(500000));
    assert_eq!(board.total_count(), 1);

    let statuses: Vec<OverallStatus> = outbox.0.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert_eq!(
        statuses,
        vec![
            OverallStatus::PendingCollection,
            OverallStatus::Collected,
            OverallStatus::SubmittedToCompany,
            OverallStatus::Completed,
            OverallStatus::Completed,
        ]
    );

    let history: Vec<String> = ledger
        .history(&collected.id)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(history, ["created", "collected", "submitted", "received", "transferred"]);
}

#[test]
fn partial_submission_keeps_unnamed_cash_pending() {
    let (ledger, _) = ledger();
    ledger.open_for_order("O2").unwrap();
    ledger.open_for_order("O3").unwrap();
    let a = ledger.collect("O2", "D1", None).unwrap();
    let b = ledger.collect("O3", "D1", None).unwrap();
    assert_eq!(ledger.pending_balance("D1").unwrap(), dec!(300000));

    ledger
        .submit(&SubmitBatch::new("D1", vec![a.id], dec!(200000)).unwrap())
        .unwrap();
    assert_eq!(ledger.pending_balance("D1").unwrap(), b.amount);

    let summary = ledger.reconcile("D1", day(), "S1").unwrap();
    assert_eq!(summary.pending_amount, dec!(100000));
    assert_eq!(summary.reconciliation_status, ReconciliationStatus::Discrepancy);

    let second = ledger.receive(&a.id, "S1").unwrap();
    let again = ledger.receive(&a.id, "S2").unwrap_err();
    assert_eq!(again.kind(), ErrorKind::Conflict);
    assert_eq!(ledger.transaction(&a.id).unwrap(), second);
}

#[test]
fn reconcile_all_covers_company_roster() {
    let (ledger, _) = ledger();
    ledger.open_for_order("O2").unwrap();
    let tx = ledger.collect("O2", "D1", None).unwrap();
    ledger
        .submit(&SubmitBatch::new("D1", vec![tx.id], dec!(200000)).unwrap())
        .unwrap();
    ledger.receive(&tx.id, "S1").unwrap();

    let report = ledger.reconcile_all(day(), "company-1", "S1").unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(report.summaries.len(), 1);
    assert_eq!(report.summaries[0].total_received, dec!(200000));
    assert_eq!(
        ledger.summary("D1", day()).unwrap().map(|s| s.reconciliation_status),
        Some(ReconciliationStatus::Reconciled)
    );
}
