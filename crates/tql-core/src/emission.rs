//! Emission: the one write path that consumes quota.
//!
//! For one order request: validate every line, allocate an order number if
//! none was supplied, reserve the scoped and aggregate balances for every
//! line as a single all-or-nothing step, then append the order with status
//! `Issued`. A failure at any point leaves quota balances and the order
//! ledger exactly as they were.
//!
//! Balance mutation happens nowhere else; callers hold the stores behind
//! `Arc` and go through [`EmissionEngine::emit`].

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{validate_lines, NewOrder, OrderLedger, ValidationError};
use crate::numbering::{NumberingSequencer, Period};
use crate::quota::{QuotaError, QuotaStore};
use crate::types::{LineRequest, QuotaKey};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Everything `emit` can fail with. Validation and quota failures are
/// returned before (or with full rollback of) any state change; `Storage`
/// and `NumberingConflict` come from the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmissionError {
    Validation(ValidationError),
    Quota(QuotaError),
    /// Lost an order-number allocation race. Retryable.
    NumberingConflict { order_number: String },
    /// Infrastructure failure; the order was not created.
    Storage { detail: String },
}

impl std::fmt::Display for EmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => e.fmt(f),
            Self::Quota(e) => e.fmt(f),
            Self::NumberingConflict { order_number } => {
                write!(f, "order number '{order_number}' was allocated concurrently; retry")
            }
            Self::Storage { detail } => write!(f, "order not created: {detail}"),
        }
    }
}

impl std::error::Error for EmissionError {}

impl From<ValidationError> for EmissionError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<QuotaError> for EmissionError {
    fn from(e: QuotaError) -> Self {
        Self::Quota(e)
    }
}

// ---------------------------------------------------------------------------
// EmitRequest
// ---------------------------------------------------------------------------

/// One order-emission request as presented by the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmitRequest {
    pub tender_id: String,
    /// Explicit order number; allocated from the sequencer when absent.
    #[serde(default)]
    pub order_number: Option<String>,
    pub issue_date: NaiveDate,
    pub beneficiary_service: String,
    #[serde(default)]
    pub external_reference: String,
    pub issuing_user: String,
    pub lines: Vec<LineRequest>,
}

impl EmitRequest {
    /// Quota demands of this request: per line, the per-service key and its
    /// tender-wide aggregate sibling.
    pub fn demands(&self) -> Vec<(QuotaKey, i64)> {
        let mut demands = Vec::with_capacity(self.lines.len() * 2);
        for line in &self.lines {
            let scoped = QuotaKey::scoped(
                self.tender_id.clone(),
                line.lot,
                line.item,
                self.beneficiary_service.clone(),
            );
            demands.push((scoped.global_of(), line.quantity));
            demands.push((scoped, line.quantity));
        }
        demands
    }
}

// ---------------------------------------------------------------------------
// EmissionEngine
// ---------------------------------------------------------------------------

/// Orchestrates quota store, order ledger and sequencer for one emission.
pub struct EmissionEngine {
    quota: Arc<QuotaStore>,
    ledger: Arc<OrderLedger>,
    sequencer: Arc<NumberingSequencer>,
}

impl EmissionEngine {
    pub fn new(
        quota: Arc<QuotaStore>,
        ledger: Arc<OrderLedger>,
        sequencer: Arc<NumberingSequencer>,
    ) -> Self {
        Self {
            quota,
            ledger,
            sequencer,
        }
    }

    pub fn quota(&self) -> &QuotaStore {
        &self.quota
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub fn sequencer(&self) -> &NumberingSequencer {
        &self.sequencer
    }

    /// Emit one purchase order. All-or-nothing; see module docs.
    pub fn emit(&self, request: EmitRequest) -> Result<Uuid, EmissionError> {
        // 1. Reject bad input before touching any balance.
        validate_lines(&request.lines)?;

        // 2. Resolve the order number.
        let order_number = match &request.order_number {
            Some(n) if !n.trim().is_empty() => {
                // Cheap early check; the ledger re-checks under its own lock.
                if self.ledger.contains_number(n) {
                    return Err(ValidationError::DuplicateOrderNumber {
                        order_number: n.clone(),
                    }
                    .into());
                }
                n.clone()
            }
            _ => self
                .sequencer
                .next_order_number(&request.tender_id, Period::from_date(request.issue_date)),
        };

        // 3. Reserve every balance this order consumes, atomically.
        let demands = request.demands();
        self.quota.reserve_batch(&demands)?;

        // 4. Append. The only failure left is an order-number race lost
        //    between the early check and here; compensate and report it
        //    as retryable.
        let new_order = NewOrder {
            order_number,
            tender_id: request.tender_id,
            issue_date: request.issue_date,
            beneficiary_service: request.beneficiary_service,
            external_reference: request.external_reference,
            issuing_user: request.issuing_user,
            lines: request.lines,
        };
        match self.ledger.create_order(new_order) {
            Ok(id) => Ok(id),
            Err(ValidationError::DuplicateOrderNumber { order_number }) => {
                self.quota.release_batch(&demands);
                Err(EmissionError::NumberingConflict { order_number })
            }
            Err(e) => {
                self.quota.release_batch(&demands);
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::OrderStatus;

    fn engine() -> EmissionEngine {
        let quota = Arc::new(QuotaStore::new());
        let ledger = Arc::new(OrderLedger::new());
        let sequencer = Arc::new(NumberingSequencer::new());
        EmissionEngine::new(quota, ledger, sequencer)
    }

    fn load_key(e: &EmissionEngine, lot: u32, item: u32, service: &str, max: i64) {
        e.quota()
            .load(QuotaKey::scoped("T1", lot, item, service), max)
            .unwrap();
        e.quota().load(QuotaKey::global("T1", lot, item), max).unwrap();
    }

    fn request(lines: Vec<LineRequest>) -> EmitRequest {
        EmitRequest {
            tender_id: "T1".to_string(),
            order_number: None,
            issue_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            beneficiary_service: "LAB CENTRAL".to_string(),
            external_reference: "SIM-0042".to_string(),
            issuing_user: "mgonzalez".to_string(),
            lines,
        }
    }

    #[test]
    fn emit_reserves_and_issues() {
        let e = engine();
        load_key(&e, 1, 1, "LAB CENTRAL", 100);

        let id = e.emit(request(vec![LineRequest::new(1, 1, 60, 1_000_000)])).unwrap();

        let scoped = QuotaKey::scoped("T1", 1, 1, "LAB CENTRAL");
        assert_eq!(e.quota().remaining(&scoped).unwrap(), 40);
        assert_eq!(e.quota().remaining(&scoped.global_of()).unwrap(), 40);

        let record = e.ledger().order_detail(id).unwrap();
        assert_eq!(record.header.status, OrderStatus::Issued);
        assert_eq!(record.header.order_number, "001/2024-03");
    }

    #[test]
    fn emit_rejects_insufficient_quota_with_detail() {
        let e = engine();
        load_key(&e, 1, 1, "LAB CENTRAL", 100);
        e.emit(request(vec![LineRequest::new(1, 1, 60, 1_000_000)])).unwrap();

        let err = e
            .emit(request(vec![LineRequest::new(1, 1, 50, 1_000_000)]))
            .unwrap_err();
        assert_eq!(
            err,
            EmissionError::Quota(QuotaError::InsufficientQuota {
                lot: 1,
                item: 1,
                requested: 50,
                available: 40
            })
        );
        // Nothing changed: emitted stays at 60, no second order exists.
        let scoped = QuotaKey::scoped("T1", 1, 1, "LAB CENTRAL");
        assert_eq!(e.quota().balance(&scoped).unwrap().emitted_quantity(), 60);
        assert_eq!(e.ledger().len(), 1);
    }

    #[test]
    fn emit_rejects_duplicate_lines_before_any_reservation() {
        let e = engine();
        load_key(&e, 1, 1, "LAB CENTRAL", 100);

        let err = e
            .emit(request(vec![
                LineRequest::new(1, 1, 10, 1_000_000),
                LineRequest::new(1, 1, 5, 1_000_000),
            ]))
            .unwrap_err();
        assert_eq!(
            err,
            EmissionError::Validation(ValidationError::DuplicateLine { lot: 1, item: 1 })
        );
        let scoped = QuotaKey::scoped("T1", 1, 1, "LAB CENTRAL");
        assert_eq!(e.quota().balance(&scoped).unwrap().emitted_quantity(), 0);
        assert!(e.ledger().is_empty());
    }

    #[test]
    fn emit_enforces_per_service_and_aggregate_caps_together() {
        let e = engine();
        // Two services each earmarked 80, but the aggregate row caps at 100.
        e.quota()
            .load(QuotaKey::scoped("T1", 1, 1, "LAB CENTRAL"), 80)
            .unwrap();
        e.quota()
            .load(QuotaKey::scoped("T1", 1, 1, "HOSPITAL SUR"), 80)
            .unwrap();
        e.quota().load(QuotaKey::global("T1", 1, 1), 100).unwrap();

        e.emit(request(vec![LineRequest::new(1, 1, 70, 1_000_000)])).unwrap();

        let mut second = request(vec![LineRequest::new(1, 1, 40, 1_000_000)]);
        second.beneficiary_service = "HOSPITAL SUR".to_string();
        let err = e.emit(second).unwrap_err();

        // The per-service row had room; the aggregate row did not.
        assert_eq!(
            err,
            EmissionError::Quota(QuotaError::InsufficientQuota {
                lot: 1,
                item: 1,
                requested: 40,
                available: 30
            })
        );
        // All-or-nothing: the scoped row for HOSPITAL SUR is untouched.
        assert_eq!(
            e.quota()
                .balance(&QuotaKey::scoped("T1", 1, 1, "HOSPITAL SUR"))
                .unwrap()
                .emitted_quantity(),
            0
        );
    }

    #[test]
    fn emit_with_explicit_number_skips_the_sequencer() {
        let e = engine();
        load_key(&e, 1, 1, "LAB CENTRAL", 100);

        let mut req = request(vec![LineRequest::new(1, 1, 10, 1_000_000)]);
        req.order_number = Some("099/2024-03".to_string());
        let id = e.emit(req).unwrap();
        assert_eq!(
            e.ledger().order_detail(id).unwrap().header.order_number,
            "099/2024-03"
        );

        // The sequencer was not consumed: next auto number starts at 001.
        let id2 = e.emit(request(vec![LineRequest::new(1, 1, 10, 1_000_000)])).unwrap();
        assert_eq!(
            e.ledger().order_detail(id2).unwrap().header.order_number,
            "001/2024-03"
        );
    }

    #[test]
    fn emit_with_taken_number_fails_without_consuming_quota() {
        let e = engine();
        load_key(&e, 1, 1, "LAB CENTRAL", 100);

        let mut first = request(vec![LineRequest::new(1, 1, 10, 1_000_000)]);
        first.order_number = Some("050/2024-03".to_string());
        e.emit(first).unwrap();

        let mut dup = request(vec![LineRequest::new(1, 1, 10, 1_000_000)]);
        dup.order_number = Some("050/2024-03".to_string());
        let err = e.emit(dup).unwrap_err();
        assert_eq!(
            err,
            EmissionError::Validation(ValidationError::DuplicateOrderNumber {
                order_number: "050/2024-03".to_string()
            })
        );
        let scoped = QuotaKey::scoped("T1", 1, 1, "LAB CENTRAL");
        assert_eq!(e.quota().balance(&scoped).unwrap().emitted_quantity(), 10);
    }

    #[test]
    fn emit_multiline_spans_multiple_keys() {
        let e = engine();
        load_key(&e, 1, 1, "LAB CENTRAL", 50);
        load_key(&e, 2, 3, "LAB CENTRAL", 20);

        let id = e
            .emit(request(vec![
                LineRequest::new(1, 1, 30, 2_000_000),
                LineRequest::new(2, 3, 20, 500_000),
            ]))
            .unwrap();

        assert_eq!(
            e.quota()
                .remaining(&QuotaKey::scoped("T1", 1, 1, "LAB CENTRAL"))
                .unwrap(),
            20
        );
        assert_eq!(
            e.quota()
                .remaining(&QuotaKey::scoped("T1", 2, 3, "LAB CENTRAL"))
                .unwrap(),
            0
        );
        let record = e.ledger().order_detail(id).unwrap();
        assert_eq!(record.total_micros(), 30 * 2_000_000 + 20 * 500_000);
    }
}
