//! tql-core
//!
//! Order–quota ledger for tender ("licitación") purchase orders:
//! - Quota balances per (tender, lot, item, beneficiary service) with a
//!   tender-wide aggregate row acting as the global cap
//! - Atomic check-and-decrement reservation; multi-key reservations are
//!   all-or-nothing and serialized per key
//! - Append-only order ledger (orders are never deleted; cancellation is a
//!   status change)
//! - Serialized order-number allocation per tender/period
//! - Explicit order-status state machine
//!
//! All logic in this crate is in-memory and IO-free; persistence lives in
//! `tql-db`, which reuses the validation and state machine defined here.

mod types;

pub mod emission;
pub mod ledger;
pub mod lifecycle;
pub mod numbering;
pub mod quota;

pub use emission::{EmissionEngine, EmissionError, EmitRequest};
pub use ledger::{
    validate_lines, NewOrder, OrderLedger, OrderRecord, OrderSummary, StatusError,
    ValidationError,
};
pub use lifecycle::{check_transition, InvalidTransition, OrderStatus, UnknownStatus};
pub use numbering::{
    compose_number, fallback_number, leading_seq, NumberingSequencer, Period,
};
pub use quota::{QuotaError, QuotaStore, LOCK_TIMEOUT};
pub use types::{LineRequest, Order, OrderLine, QuotaBalance, QuotaKey};

/// Price/amount scale: micros (1e-6). Quantities are whole units.
pub const MICROS_SCALE: i64 = 1_000_000;
