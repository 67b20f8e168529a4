//! Order status state machine.
//!
//! # State diagram
//!
//! ```text
//!    emit
//!    ──────►  Issued ──────────► Delivered
//!                │                   │
//!                └───► Cancelled ◄───┘   (terminal)
//! ```
//!
//! `Cancelled` is terminal; nothing re-enters `Issued`; self-transitions are
//! rejected. Status changes never touch quota balances; cancelling an order
//! does not re-offer its quantity.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// OrderStatus
// ---------------------------------------------------------------------------

/// All valid states a purchase order can occupy after emission.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Initial state, set by emission.
    Issued,
    /// Goods received by the beneficiary service.
    Delivered,
    /// Order voided. **Terminal.** Consumed quota is not restored.
    Cancelled,
}

impl OrderStatus {
    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "Issued",
            Self::Delivered => "Delivered",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownStatus> {
        match s {
            "Issued" => Ok(Self::Issued),
            "Delivered" => Ok(Self::Delivered),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus {
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A persisted status string that is not part of the enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus {
    pub value: String,
}

impl std::fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown order status: '{}'", self.value)
    }
}

impl std::error::Error for UnknownStatus {}

/// Returned when a status change is not a legal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal status transition: {} -> {}",
            self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// Validate a status change against the state machine.
pub fn check_transition(from: OrderStatus, to: OrderStatus) -> Result<(), InvalidTransition> {
    use OrderStatus::*;

    match (from, to) {
        (Issued, Delivered) => Ok(()),
        (Issued, Cancelled) => Ok(()),
        (Delivered, Cancelled) => Ok(()),
        // Everything else (self-transitions, leaving Cancelled, any
        // re-entry into Issued) is illegal.
        (from, to) => Err(InvalidTransition { from, to }),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    #[test]
    fn legal_transitions() {
        check_transition(Issued, Delivered).unwrap();
        check_transition(Issued, Cancelled).unwrap();
        check_transition(Delivered, Cancelled).unwrap();
    }

    #[test]
    fn self_transitions_rejected() {
        for s in [Issued, Delivered, Cancelled] {
            let err = check_transition(s, s).unwrap_err();
            assert_eq!(err, InvalidTransition { from: s, to: s });
        }
    }

    #[test]
    fn nothing_leaves_cancelled() {
        for to in [Issued, Delivered] {
            assert!(check_transition(Cancelled, to).is_err());
        }
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn nothing_reenters_issued() {
        assert!(check_transition(Delivered, Issued).is_err());
        assert!(check_transition(Cancelled, Issued).is_err());
    }

    #[test]
    fn as_str_parse_round_trip() {
        for s in [Issued, Delivered, Cancelled] {
            assert_eq!(OrderStatus::parse(s.as_str()).unwrap(), s);
        }
        let err = OrderStatus::parse("Emitted").unwrap_err();
        assert_eq!(err.value, "Emitted");
    }
}
