use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::OrderStatus;

// ---------------------------------------------------------------------------
// QuotaKey
// ---------------------------------------------------------------------------

/// Identifies one redistributable tender line.
///
/// `service = None` is the tender-wide aggregate row: it caps the total
/// emitted across every beneficiary service for the same `(lot, item)`.
/// Keys are `Ord` so multi-key reservations can acquire locks in a canonical
/// order (see [`crate::quota::QuotaStore::reserve_batch`]).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuotaKey {
    pub tender_id: String,
    pub lot: u32,
    pub item: u32,
    /// Beneficiary service this portion is earmarked for; `None` = aggregate.
    pub service: Option<String>,
}

impl QuotaKey {
    /// Key for a per-service quota portion.
    pub fn scoped<T, S>(tender_id: T, lot: u32, item: u32, service: S) -> Self
    where
        T: Into<String>,
        S: Into<String>,
    {
        Self {
            tender_id: tender_id.into(),
            lot,
            item,
            service: Some(service.into()),
        }
    }

    /// Key for the tender-wide aggregate row.
    pub fn global<T: Into<String>>(tender_id: T, lot: u32, item: u32) -> Self {
        Self {
            tender_id: tender_id.into(),
            lot,
            item,
            service: None,
        }
    }

    /// The aggregate sibling of this key (identity for aggregate keys).
    pub fn global_of(&self) -> Self {
        Self {
            tender_id: self.tender_id.clone(),
            lot: self.lot,
            item: self.item,
            service: None,
        }
    }

    pub fn is_global(&self) -> bool {
        self.service.is_none()
    }
}

// ---------------------------------------------------------------------------
// QuotaBalance
// ---------------------------------------------------------------------------

/// Adjudicated maximum vs cumulative emitted quantity for one [`QuotaKey`].
///
/// Invariant: `0 <= emitted_quantity <= max_quantity` at all times. Fields
/// are private; mutation happens only through the reservation path in
/// [`crate::quota::QuotaStore`], so the invariant cannot be violated from
/// outside this crate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaBalance {
    max_quantity: i64,
    emitted_quantity: i64,
}

impl QuotaBalance {
    /// Fresh balance with nothing emitted.
    ///
    /// # Panics (debug only)
    /// Panics if `max_quantity` < 0.
    pub fn new(max_quantity: i64) -> Self {
        debug_assert!(max_quantity >= 0, "max_quantity must be >= 0");
        Self {
            max_quantity,
            emitted_quantity: 0,
        }
    }

    /// Rehydrate a balance from persisted values.
    ///
    /// Returns `None` when the pair violates `0 <= emitted <= max`.
    pub fn with_emitted(max_quantity: i64, emitted_quantity: i64) -> Option<Self> {
        if max_quantity < 0 || emitted_quantity < 0 || emitted_quantity > max_quantity {
            return None;
        }
        Some(Self {
            max_quantity,
            emitted_quantity,
        })
    }

    pub fn max_quantity(&self) -> i64 {
        self.max_quantity
    }

    pub fn emitted_quantity(&self) -> i64 {
        self.emitted_quantity
    }

    /// Derived, never stored: `max - emitted`.
    pub fn remaining(&self) -> i64 {
        self.max_quantity - self.emitted_quantity
    }

    /// Share of the maximum already emitted, in percent (0 when max is 0).
    pub fn percent_emitted(&self) -> f64 {
        if self.max_quantity == 0 {
            return 0.0;
        }
        (self.emitted_quantity as f64 / self.max_quantity as f64) * 100.0
    }

    /// Check-and-decrement as one step. On failure returns the quantity that
    /// was actually available; the balance is not mutated.
    pub(crate) fn try_reserve(&mut self, quantity: i64) -> Result<(), i64> {
        let available = self.remaining();
        if quantity > available {
            return Err(available);
        }
        self.emitted_quantity += quantity;
        Ok(())
    }

    /// Undo a prior successful reservation of `quantity`.
    pub(crate) fn release(&mut self, quantity: i64) {
        debug_assert!(
            quantity <= self.emitted_quantity,
            "release exceeds emitted quantity"
        );
        self.emitted_quantity = (self.emitted_quantity - quantity).max(0);
    }
}

// ---------------------------------------------------------------------------
// Order header and lines
// ---------------------------------------------------------------------------

/// Purchase-order header. Created exactly once by emission; `status` is the
/// only field that changes afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    /// Human-readable number, unique across the system.
    pub order_number: String,
    pub tender_id: String,
    pub issue_date: NaiveDate,
    pub beneficiary_service: String,
    /// Upstream request reference (the SIMESE number in the source system).
    pub external_reference: String,
    pub issuing_user: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// One line of a purchase order. Owned exclusively by its order; never
/// deleted and never recomputed after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub lot: u32,
    pub item: u32,
    pub product_code: String,
    pub description: String,
    pub quantity: i64,
    pub unit_of_measure: String,
    /// Unit price in integer micros.
    pub unit_price_micros: i64,
    /// `quantity * unit_price_micros`, frozen at creation time.
    pub line_total_micros: i64,
    pub notes: String,
}

/// Input for one order line, before totals are computed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRequest {
    pub lot: u32,
    pub item: u32,
    #[serde(default)]
    pub product_code: String,
    #[serde(default)]
    pub description: String,
    pub quantity: i64,
    #[serde(default)]
    pub unit_of_measure: String,
    pub unit_price_micros: i64,
    #[serde(default)]
    pub notes: String,
}

impl LineRequest {
    pub fn new(lot: u32, item: u32, quantity: i64, unit_price_micros: i64) -> Self {
        Self {
            lot,
            item,
            product_code: String::new(),
            description: String::new(),
            quantity,
            unit_of_measure: String::new(),
            unit_price_micros,
            notes: String::new(),
        }
    }

    /// Freeze this request into a stored line.
    pub(crate) fn into_line(self) -> OrderLine {
        let line_total_micros = self.quantity * self.unit_price_micros;
        OrderLine {
            lot: self.lot,
            item: self.item,
            product_code: self.product_code,
            description: self.description,
            quantity: self.quantity,
            unit_of_measure: self.unit_of_measure,
            unit_price_micros: self.unit_price_micros,
            line_total_micros,
            notes: self.notes,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
