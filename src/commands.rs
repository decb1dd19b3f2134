//! JSON command bridge.
//!
//! One request per line: `{"id": <any>, "command": "<name>", "payload": {...}}`.
//! One response per line: `{"id", "success": true, "data"}` or
//! `{"id", "success": false, "error", "kind", "retryable"}`. Payload keys are
//! camelCase with snake_case aliases, and single-id commands also accept the
//! bare id string as payload.

use base64::Engine as _;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::collaborators::{DriverRef, OrderRef, SqliteDirectory};
use crate::dashboard::DashboardScope;
use crate::error::{CodError, CodResult};
use crate::ledger::{CodLedger, ProofInput};
use crate::money;
use crate::transactions::{SubmitBatch, TransactionId, TransferDetails};

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    command: String,
    #[serde(default)]
    payload: Value,
}

/// Money as either a JSON string or a JSON number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AmountArg {
    Text(String),
    Number(serde_json::Number),
}

impl AmountArg {
    fn parse(&self) -> CodResult<Decimal> {
        match self {
            AmountArg::Text(raw) => money::parse_amount(raw),
            AmountArg::Number(n) => money::parse_amount(&n.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    #[serde(alias = "order_id", alias = "id")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriverPayload {
    #[serde(alias = "driver_id", alias = "id")]
    driver_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompanyPayload {
    #[serde(alias = "company_id", alias = "id")]
    company_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionPayload {
    #[serde(alias = "transaction_id", alias = "id")]
    transaction_id: TransactionId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterOrderPayload {
    #[serde(alias = "order_id")]
    order_id: String,
    #[serde(alias = "company_id")]
    company_id: String,
    #[serde(alias = "cod_amount")]
    cod_amount: AmountArg,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterDriverPayload {
    #[serde(alias = "driver_id")]
    driver_id: String,
    #[serde(alias = "company_id")]
    company_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_active", alias = "is_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectPayload {
    #[serde(alias = "order_id")]
    order_id: String,
    #[serde(alias = "driver_id")]
    driver_id: String,
    #[serde(default, alias = "proof_uri")]
    proof_uri: Option<String>,
    /// Raw proof image, standard base64.
    #[serde(default, alias = "proof_base64")]
    proof_base64: Option<String>,
    #[serde(default, alias = "content_type")]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailPayload {
    #[serde(alias = "order_id")]
    order_id: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitPayload {
    #[serde(alias = "driver_id")]
    driver_id: String,
    #[serde(alias = "transaction_ids")]
    transaction_ids: Vec<TransactionId>,
    #[serde(alias = "declared_total")]
    declared_total: AmountArg,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivePayload {
    #[serde(alias = "transaction_id")]
    transaction_id: TransactionId,
    #[serde(alias = "received_by")]
    received_by: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferPayload {
    #[serde(alias = "transaction_id")]
    transaction_id: TransactionId,
    method: String,
    reference: String,
    #[serde(default, alias = "proof_uri")]
    proof_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdjustPayload {
    #[serde(alias = "transaction_id")]
    transaction_id: TransactionId,
    #[serde(default)]
    fee: Option<AmountArg>,
    #[serde(default)]
    adjustment: Option<AmountArg>,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcilePayload {
    #[serde(alias = "driver_id")]
    driver_id: String,
    date: NaiveDate,
    #[serde(alias = "reconciled_by")]
    reconciled_by: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileAllPayload {
    #[serde(alias = "company_id")]
    company_id: String,
    date: NaiveDate,
    #[serde(alias = "reconciled_by")]
    reconciled_by: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryPayload {
    #[serde(alias = "driver_id")]
    driver_id: String,
    date: NaiveDate,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DashboardPayload {
    #[serde(default, alias = "company_id")]
    company_id: Option<String>,
    #[serde(default, alias = "driver_id")]
    driver_id: Option<String>,
}

/// Wrap a bare string payload as `{key: value}`; objects pass through.
fn with_shorthand(payload: Value, key: &str) -> Value {
    match payload {
        Value::String(s) => json!({ key: s }),
        Value::Null => json!({}),
        other => other,
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Value, what: &str) -> CodResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| CodError::Validation(format!("Invalid {what} payload: {e}")))
}

fn to_data<T: Serialize>(value: &T) -> CodResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| CodError::CorruptRecord(format!("unserializable result: {e}")))
}

fn decode_proof(p: &CollectPayload) -> CodResult<Option<ProofInput>> {
    match (&p.proof_uri, &p.proof_base64) {
        (Some(_), Some(_)) => Err(CodError::Validation(
            "give either proofUri or proofBase64, not both".into(),
        )),
        (Some(uri), None) => Ok(Some(ProofInput::Uri(uri.trim().to_string()))),
        (None, Some(encoded)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| CodError::Validation(format!("proofBase64 is not valid base64: {e}")))?;
            if bytes.is_empty() {
                return Err(CodError::Validation("proof image is empty".into()));
            }
            Ok(Some(ProofInput::Upload {
                bytes,
                content_type: p
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            }))
        }
        (None, None) => Ok(None),
    }
}

/// Dispatch one command against the ledger.
pub fn handle_command(ledger: &CodLedger, command: &str, payload: Value) -> CodResult<Value> {
    debug!(command = %command, "Handling COD command");
    match command {
        "register_order" => {
            let p: RegisterOrderPayload = parse_payload(payload, "order")?;
            let order = OrderRef {
                order_id: p.order_id.trim().to_string(),
                company_id: p.company_id.trim().to_string(),
                cod_amount: p.cod_amount.parse()?,
            };
            SqliteDirectory::new(ledger.db().clone()).register_order(&order)?;
            to_data(&order)
        }
        "register_driver" => {
            let p: RegisterDriverPayload = parse_payload(payload, "driver")?;
            let driver = DriverRef {
                driver_id: p.driver_id.trim().to_string(),
                company_id: p.company_id.trim().to_string(),
                name: p.name,
                is_active: p.is_active,
            };
            SqliteDirectory::new(ledger.db().clone()).register_driver(&driver)?;
            to_data(&driver)
        }
        "open" => {
            let p: OrderPayload = parse_payload(with_shorthand(payload, "orderId"), "order")?;
            to_data(&ledger.open_for_order(&p.order_id)?)
        }
        "collect" => {
            let p: CollectPayload = parse_payload(payload, "collect")?;
            let proof = decode_proof(&p)?;
            to_data(&ledger.collect(&p.order_id, &p.driver_id, proof)?)
        }
        "fail_collection" => {
            let p: FailPayload = parse_payload(payload, "failure")?;
            to_data(&ledger.fail_collection(&p.order_id, &p.reason)?)
        }
        "submit" => {
            let p: SubmitPayload = parse_payload(payload, "submission")?;
            let batch = SubmitBatch::new(p.driver_id, p.transaction_ids, p.declared_total.parse()?)?;
            to_data(&ledger.submit(&batch)?)
        }
        "receive" => {
            let p: ReceivePayload = parse_payload(payload, "receipt")?;
            to_data(&ledger.receive(&p.transaction_id, &p.received_by)?)
        }
        "transfer" => {
            let p: TransferPayload = parse_payload(payload, "transfer")?;
            let details = TransferDetails {
                method: p.method,
                reference: p.reference,
                proof_uri: p.proof_uri,
            };
            to_data(&ledger.transfer(&p.transaction_id, &details)?)
        }
        "adjust" => {
            let p: AdjustPayload = parse_payload(payload, "adjustment")?;
            let fee = p.fee.as_ref().map(AmountArg::parse).transpose()?;
            let adjustment = p.adjustment.as_ref().map(AmountArg::parse).transpose()?;
            to_data(&ledger.adjust(
                &p.transaction_id,
                fee.unwrap_or(Decimal::ZERO),
                adjustment.unwrap_or(Decimal::ZERO),
                &p.reason,
            )?)
        }
        "get_transaction" => {
            let p: TransactionPayload =
                parse_payload(with_shorthand(payload, "transactionId"), "transaction")?;
            to_data(&ledger.transaction(&p.transaction_id)?)
        }
        "get_transaction_for_order" => {
            let p: OrderPayload = parse_payload(with_shorthand(payload, "orderId"), "order")?;
            to_data(&ledger.transaction_for_order(&p.order_id)?)
        }
        "history" => {
            let p: TransactionPayload =
                parse_payload(with_shorthand(payload, "transactionId"), "transaction")?;
            to_data(&ledger.history(&p.transaction_id)?)
        }
        "held_by_driver" => {
            let p: DriverPayload = parse_payload(with_shorthand(payload, "driverId"), "driver")?;
            to_data(&ledger.held_by_driver(&p.driver_id)?)
        }
        "pending_balance" => {
            let p: DriverPayload = parse_payload(with_shorthand(payload, "driverId"), "driver")?;
            let balance = ledger.pending_balance(&p.driver_id)?;
            Ok(json!({ "driverId": p.driver_id, "pendingBalance": money::to_db(balance) }))
        }
        "company_balance" => {
            let p: CompanyPayload =
                parse_payload(with_shorthand(payload, "companyId"), "company")?;
            to_data(&ledger.company_balance(&p.company_id)?)
        }
        "reconcile" => {
            let p: ReconcilePayload = parse_payload(payload, "reconcile")?;
            to_data(&ledger.reconcile(&p.driver_id, p.date, &p.reconciled_by)?)
        }
        "reconcile_all" => {
            let p: ReconcileAllPayload = parse_payload(payload, "reconcile")?;
            to_data(&ledger.reconcile_all(p.date, &p.company_id, &p.reconciled_by)?)
        }
        "summary" => {
            let p: SummaryPayload = parse_payload(payload, "summary")?;
            to_data(&ledger.summary(&p.driver_id, p.date)?)
        }
        "dashboard" => {
            let p: DashboardPayload = if payload.is_null() {
                DashboardPayload::default()
            } else {
                parse_payload(payload, "dashboard")?
            };
            let scope = match (p.company_id, p.driver_id) {
                (Some(_), Some(_)) => {
                    return Err(CodError::Validation(
                        "dashboard scope takes companyId or driverId, not both".into(),
                    ))
                }
                (None, Some(driver)) => DashboardScope::Driver(driver),
                (company, None) => DashboardScope::from(company),
            };
            to_data(&ledger.dashboard(&scope)?)
        }
        other => Err(CodError::Validation(format!("unknown command: {other}"))),
    }
}

fn error_response(id: Value, err: &CodError) -> Value {
    json!({
        "id": id,
        "success": false,
        "error": err.to_string(),
        "kind": err.kind(),
        "retryable": err.is_retryable(),
    })
}

/// Parse one request line, run it, and build the response object.
pub fn handle_line(ledger: &CodLedger, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            let err = CodError::Validation(format!("malformed request: {e}"));
            return error_response(Value::Null, &err);
        }
    };

    match handle_command(ledger, &request.command, request.payload) {
        Ok(data) => json!({ "id": request.id, "success": true, "data": data }),
        Err(err) => {
            warn!(command = %request.command, kind = %err.kind(), error = %err, "COD command failed");
            error_response(request.id, &err)
        }
    }
}
