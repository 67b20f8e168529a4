//! Append-only order ledger.
//!
//! Orders and their lines are written exactly once and never deleted;
//! cancellation only changes the header status, preserving audit history.
//! The ledger does not touch quota balances; orchestration of both happens
//! one level up, in [`crate::emission`], so this store stays usable on its
//! own (and trivially testable).
//!
//! Line validation lives here because the data layer is where duplicate
//! `(lot, item)` pairs must be rejected; upstream form handling is not
//! trusted to have done it.

use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::{check_transition, InvalidTransition, OrderStatus};
use crate::types::{LineRequest, Order, OrderLine};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejections raised before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// An order must carry at least one line.
    EmptyOrder,
    /// Line quantity must be strictly positive.
    NonPositiveQuantity { lot: u32, item: u32, quantity: i64 },
    /// Unit price must be non-negative.
    NegativeUnitPrice {
        lot: u32,
        item: u32,
        unit_price_micros: i64,
    },
    /// Two lines share the same `(lot, item)` within one order.
    DuplicateLine { lot: u32, item: u32 },
    /// Order numbers must be non-blank.
    BlankOrderNumber,
    /// The order number is already taken.
    DuplicateOrderNumber { order_number: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyOrder => write!(f, "order must contain at least one line"),
            Self::NonPositiveQuantity {
                lot,
                item,
                quantity,
            } => write!(
                f,
                "quantity for lot {lot} item {item} must be > 0, got {quantity}"
            ),
            Self::NegativeUnitPrice {
                lot,
                item,
                unit_price_micros,
            } => write!(
                f,
                "unit price for lot {lot} item {item} must be >= 0, got {unit_price_micros}"
            ),
            Self::DuplicateLine { lot, item } => write!(
                f,
                "order contains more than one line for lot {lot} item {item}"
            ),
            Self::BlankOrderNumber => write!(f, "order number must not be blank"),
            Self::DuplicateOrderNumber { order_number } => {
                write!(f, "order number '{order_number}' already exists")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Failures of a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    UnknownOrder { id: Uuid },
    Invalid(InvalidTransition),
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOrder { id } => write!(f, "no order with id {id}"),
            Self::Invalid(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for StatusError {}

impl From<InvalidTransition> for StatusError {
    fn from(e: InvalidTransition) -> Self {
        Self::Invalid(e)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a set of order lines without writing anything.
///
/// Exposed so emission can reject a request before reserving any quota.
pub fn validate_lines(lines: &[LineRequest]) -> Result<(), ValidationError> {
    if lines.is_empty() {
        return Err(ValidationError::EmptyOrder);
    }
    let mut seen: HashSet<(u32, u32)> = HashSet::with_capacity(lines.len());
    for line in lines {
        if line.quantity <= 0 {
            return Err(ValidationError::NonPositiveQuantity {
                lot: line.lot,
                item: line.item,
                quantity: line.quantity,
            });
        }
        if line.unit_price_micros < 0 {
            return Err(ValidationError::NegativeUnitPrice {
                lot: line.lot,
                item: line.item,
                unit_price_micros: line.unit_price_micros,
            });
        }
        if !seen.insert((line.lot, line.item)) {
            return Err(ValidationError::DuplicateLine {
                lot: line.lot,
                item: line.item,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// NewOrder / projections
// ---------------------------------------------------------------------------

/// A fully resolved order about to be appended (number already allocated).
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub order_number: String,
    pub tender_id: String,
    pub issue_date: NaiveDate,
    pub beneficiary_service: String,
    pub external_reference: String,
    pub issuing_user: String,
    pub lines: Vec<LineRequest>,
}

/// Stored order: header plus its lines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub header: Order,
    pub lines: Vec<OrderLine>,
}

impl OrderRecord {
    /// Sum of frozen line totals.
    pub fn total_micros(&self) -> i64 {
        self.lines.iter().map(|l| l.line_total_micros).sum()
    }
}

/// Listing row: header fields plus line count and total amount.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: Uuid,
    pub order_number: String,
    pub tender_id: String,
    pub issue_date: NaiveDate,
    pub beneficiary_service: String,
    pub issuing_user: String,
    pub status: OrderStatus,
    pub line_count: usize,
    pub total_micros: i64,
    pub created_at: chrono::DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// OrderLedger
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LedgerInner {
    orders: HashMap<Uuid, OrderRecord>,
    /// Creation order, for stable listings.
    sequence: Vec<Uuid>,
    numbers: HashSet<String>,
}

/// In-memory append-only store of orders.
#[derive(Default)]
pub struct OrderLedger {
    inner: Mutex<LedgerInner>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an order. Validates lines and number uniqueness, computes the
    /// frozen line totals, stamps `created_at`, and initializes the status
    /// to [`OrderStatus::Issued`]. Nothing is written on error.
    pub fn create_order(&self, new: NewOrder) -> Result<Uuid, ValidationError> {
        validate_lines(&new.lines)?;
        if new.order_number.trim().is_empty() {
            return Err(ValidationError::BlankOrderNumber);
        }

        let mut inner = self.inner.lock();
        if inner.numbers.contains(&new.order_number) {
            return Err(ValidationError::DuplicateOrderNumber {
                order_number: new.order_number,
            });
        }

        let id = Uuid::new_v4();
        let header = Order {
            id,
            order_number: new.order_number.clone(),
            tender_id: new.tender_id,
            issue_date: new.issue_date,
            beneficiary_service: new.beneficiary_service,
            external_reference: new.external_reference,
            issuing_user: new.issuing_user,
            status: OrderStatus::Issued,
            created_at: Utc::now(),
        };
        let lines = new.lines.into_iter().map(LineRequest::into_line).collect();

        inner.numbers.insert(new.order_number);
        inner.sequence.push(id);
        inner.orders.insert(id, OrderRecord { header, lines });
        Ok(id)
    }

    /// Change an order's status, enforcing the state machine.
    pub fn transition(&self, id: Uuid, to: OrderStatus) -> Result<(), StatusError> {
        let mut inner = self.inner.lock();
        let record = inner
            .orders
            .get_mut(&id)
            .ok_or(StatusError::UnknownOrder { id })?;
        check_transition(record.header.status, to)?;
        record.header.status = to;
        Ok(())
    }

    /// Current status of an order.
    pub fn status(&self, id: Uuid) -> Option<OrderStatus> {
        self.inner.lock().orders.get(&id).map(|r| r.header.status)
    }

    /// Whether an order number is already taken.
    pub fn contains_number(&self, order_number: &str) -> bool {
        self.inner.lock().numbers.contains(order_number)
    }

    /// Existing order numbers for one tender (sequencer reseeding).
    pub fn numbers_for_tender(&self, tender_id: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .sequence
            .iter()
            .filter_map(|id| inner.orders.get(id))
            .filter(|r| r.header.tender_id == tender_id)
            .map(|r| r.header.order_number.clone())
            .collect()
    }

    /// Summaries in creation order.
    pub fn list_orders(&self) -> Vec<OrderSummary> {
        let inner = self.inner.lock();
        inner
            .sequence
            .iter()
            .filter_map(|id| inner.orders.get(id))
            .map(|r| OrderSummary {
                id: r.header.id,
                order_number: r.header.order_number.clone(),
                tender_id: r.header.tender_id.clone(),
                issue_date: r.header.issue_date,
                beneficiary_service: r.header.beneficiary_service.clone(),
                issuing_user: r.header.issuing_user.clone(),
                status: r.header.status,
                line_count: r.lines.len(),
                total_micros: r.total_micros(),
                created_at: r.header.created_at,
            })
            .collect()
    }

    /// Full header + lines for one order.
    pub fn order_detail(&self, id: Uuid) -> Option<OrderRecord> {
        self.inner.lock().orders.get(&id).cloned()
    }

    /// Total quantity committed against a `(tender, lot, item, service)`
    /// line across all non-cancelled orders. Audit/consistency helper.
    pub fn committed_quantity(
        &self,
        tender_id: &str,
        lot: u32,
        item: u32,
        service: Option<&str>,
    ) -> i64 {
        let inner = self.inner.lock();
        inner
            .orders
            .values()
            .filter(|r| {
                r.header.tender_id == tender_id
                    && r.header.status != OrderStatus::Cancelled
                    && service.map_or(true, |s| r.header.beneficiary_service == s)
            })
            .flat_map(|r| &r.lines)
            .filter(|l| l.lot == lot && l.item == item)
            .map(|l| l.quantity)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order(number: &str, lines: Vec<LineRequest>) -> NewOrder {
        NewOrder {
            order_number: number.to_string(),
            tender_id: "T1".to_string(),
            issue_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            beneficiary_service: "LAB CENTRAL".to_string(),
            external_reference: "SIM-0042".to_string(),
            issuing_user: "mgonzalez".to_string(),
            lines,
        }
    }

    // --- Validation ---

    #[test]
    fn rejects_empty_order() {
        let ledger = OrderLedger::new();
        let err = ledger.create_order(new_order("001/2024-03", vec![])).unwrap_err();
        assert_eq!(err, ValidationError::EmptyOrder);
        assert!(ledger.is_empty());
    }

    #[test]
    fn rejects_zero_quantity() {
        let ledger = OrderLedger::new();
        let err = ledger
            .create_order(new_order("001/2024-03", vec![LineRequest::new(1, 1, 0, 100)]))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::NonPositiveQuantity {
                lot: 1,
                item: 1,
                quantity: 0
            }
        );
    }

    #[test]
    fn rejects_negative_unit_price() {
        let ledger = OrderLedger::new();
        let err = ledger
            .create_order(new_order("001/2024-03", vec![LineRequest::new(1, 1, 5, -1)]))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::NegativeUnitPrice {
                lot: 1,
                item: 1,
                unit_price_micros: -1
            }
        );
    }

    #[test]
    fn rejects_duplicate_lot_item_within_order() {
        let ledger = OrderLedger::new();
        let err = ledger
            .create_order(new_order(
                "001/2024-03",
                vec![LineRequest::new(1, 1, 5, 100), LineRequest::new(1, 1, 3, 100)],
            ))
            .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateLine { lot: 1, item: 1 });
        assert!(ledger.is_empty());
    }

    #[test]
    fn rejects_blank_order_number() {
        let ledger = OrderLedger::new();
        let err = ledger
            .create_order(new_order("  ", vec![LineRequest::new(1, 1, 5, 100)]))
            .unwrap_err();
        assert_eq!(err, ValidationError::BlankOrderNumber);
    }

    #[test]
    fn rejects_duplicate_order_number() {
        let ledger = OrderLedger::new();
        ledger
            .create_order(new_order("001/2024-03", vec![LineRequest::new(1, 1, 5, 100)]))
            .unwrap();
        let err = ledger
            .create_order(new_order("001/2024-03", vec![LineRequest::new(1, 2, 5, 100)]))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::DuplicateOrderNumber {
                order_number: "001/2024-03".to_string()
            }
        );
        assert_eq!(ledger.len(), 1);
    }

    // --- Creation ---

    #[test]
    fn create_freezes_line_totals_and_issues() {
        let ledger = OrderLedger::new();
        let id = ledger
            .create_order(new_order(
                "001/2024-03",
                vec![LineRequest::new(1, 1, 10, 2_500_000)],
            ))
            .unwrap();

        let record = ledger.order_detail(id).unwrap();
        assert_eq!(record.header.status, OrderStatus::Issued);
        assert_eq!(record.lines[0].line_total_micros, 25_000_000);
        assert_eq!(record.total_micros(), 25_000_000);
        assert!(ledger.contains_number("001/2024-03"));
    }

    // --- Status changes ---

    #[test]
    fn transition_enforces_state_machine() {
        let ledger = OrderLedger::new();
        let id = ledger
            .create_order(new_order("001/2024-03", vec![LineRequest::new(1, 1, 5, 100)]))
            .unwrap();

        ledger.transition(id, OrderStatus::Delivered).unwrap();
        assert_eq!(ledger.status(id), Some(OrderStatus::Delivered));

        let err = ledger.transition(id, OrderStatus::Issued).unwrap_err();
        assert_eq!(
            err,
            StatusError::Invalid(InvalidTransition {
                from: OrderStatus::Delivered,
                to: OrderStatus::Issued,
            })
        );
        // Status unchanged after the rejection.
        assert_eq!(ledger.status(id), Some(OrderStatus::Delivered));
    }

    #[test]
    fn transition_unknown_order() {
        let ledger = OrderLedger::new();
        let id = Uuid::new_v4();
        let err = ledger.transition(id, OrderStatus::Delivered).unwrap_err();
        assert_eq!(err, StatusError::UnknownOrder { id });
    }

    // --- Projections ---

    #[test]
    fn list_orders_reports_counts_and_totals_in_creation_order() {
        let ledger = OrderLedger::new();
        ledger
            .create_order(new_order(
                "001/2024-03",
                vec![
                    LineRequest::new(1, 1, 2, 1_000_000),
                    LineRequest::new(1, 2, 3, 1_000_000),
                ],
            ))
            .unwrap();
        ledger
            .create_order(new_order("002/2024-03", vec![LineRequest::new(2, 1, 1, 500_000)]))
            .unwrap();

        let listing = ledger.list_orders();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].order_number, "001/2024-03");
        assert_eq!(listing[0].line_count, 2);
        assert_eq!(listing[0].total_micros, 5_000_000);
        assert_eq!(listing[1].order_number, "002/2024-03");
    }

    #[test]
    fn committed_quantity_excludes_cancelled_orders() {
        let ledger = OrderLedger::new();
        let a = ledger
            .create_order(new_order("001/2024-03", vec![LineRequest::new(1, 1, 10, 100)]))
            .unwrap();
        let _b = ledger
            .create_order(new_order("002/2024-03", vec![LineRequest::new(1, 1, 7, 100)]))
            .unwrap();

        assert_eq!(ledger.committed_quantity("T1", 1, 1, None), 17);

        ledger.transition(a, OrderStatus::Cancelled).unwrap();
        assert_eq!(ledger.committed_quantity("T1", 1, 1, None), 7);
    }
}
