//! Order-number allocation.
//!
//! Numbers follow the procurement office's format: a per-tender/per-month
//! correlative, zero-padded to three digits, composed with the tender's call
//! number when one is registered:
//!
//! ```text
//! 014/2024-15/03      seq 14, year 2024, call 15, month 03
//! 014/2024-03         same, tender without call metadata
//! ```
//!
//! Allocation is serialized per (tender, period): concurrent callers get
//! distinct, gapless, strictly increasing sequence numbers. The persisted
//! variant in `tql-db` uses a counter row for the same guarantee.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Period
// ---------------------------------------------------------------------------

/// Calendar period a correlative belongs to (year + month of issue).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Compose a full order number from its parts.
pub fn compose_number(seq: u32, period: Period, call_number: Option<&str>) -> String {
    match call_number {
        Some(call) => format!("{seq:03}/{}-{call}/{:02}", period.year, period.month),
        None => format!("{seq:03}/{}-{:02}", period.year, period.month),
    }
}

/// Leading correlative of an existing order number (`"014/2024-15/03"` → 14).
/// `None` when the number does not start with digits (timestamp fallbacks
/// longer than the correlative width are deliberately excluded).
pub fn leading_seq(number: &str) -> Option<u32> {
    let digits: String = number.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() > 6 {
        return None;
    }
    digits.parse().ok()
}

/// Timestamp-based number used when tender metadata cannot be resolved.
/// Always succeeds and never blocks order creation.
pub fn fallback_number(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

// ---------------------------------------------------------------------------
// NumberingSequencer
// ---------------------------------------------------------------------------

/// Serialized in-memory allocator of order-number correlatives.
#[derive(Default)]
pub struct NumberingSequencer {
    counters: Mutex<HashMap<(String, Period), u32>>,
    calls: RwLock<HashMap<String, String>>,
}

impl NumberingSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tender's call number (ingestion boundary). The latest
    /// registration wins; tenders without one compose the short format.
    pub fn register_call<T, C>(&self, tender_id: T, call_number: C)
    where
        T: Into<String>,
        C: Into<String>,
    {
        self.calls.write().insert(tender_id.into(), call_number.into());
    }

    /// Call number registered for a tender, if any.
    pub fn call_number(&self, tender_id: &str) -> Option<String> {
        self.calls.read().get(tender_id).cloned()
    }

    /// Fast-forward the counter past existing order numbers (restart resync).
    /// Numbers whose leading correlative cannot be parsed are skipped.
    pub fn seed<'a, I>(&self, tender_id: &str, period: Period, existing: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let highest = existing.into_iter().filter_map(leading_seq).max();
        if let Some(highest) = highest {
            let mut counters = self.counters.lock();
            let slot = counters
                .entry((tender_id.to_string(), period))
                .or_insert(0);
            *slot = (*slot).max(highest);
        }
    }

    /// Allocate the next correlative for a tender/period. Serialized: two
    /// concurrent calls never observe the same value.
    pub fn next_seq(&self, tender_id: &str, period: Period) -> u32 {
        let mut counters = self.counters.lock();
        let slot = counters
            .entry((tender_id.to_string(), period))
            .or_insert(0);
        *slot += 1;
        *slot
    }

    /// Allocate and compose the next full order number.
    pub fn next_order_number(&self, tender_id: &str, period: Period) -> String {
        let seq = self.next_seq(tender_id, period);
        let call = self.call_number(tender_id);
        compose_number(seq, period, call.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MARCH: Period = Period {
        year: 2024,
        month: 3,
    };

    #[test]
    fn composes_with_and_without_call_number() {
        assert_eq!(compose_number(14, MARCH, Some("15")), "014/2024-15/03");
        assert_eq!(compose_number(14, MARCH, None), "014/2024-03");
        assert_eq!(compose_number(7, Period { year: 2025, month: 11 }, None), "007/2025-11");
    }

    #[test]
    fn leading_seq_parses_correlative() {
        assert_eq!(leading_seq("014/2024-15/03"), Some(14));
        assert_eq!(leading_seq("007/2025-11"), Some(7));
        assert_eq!(leading_seq("no-digits"), None);
        // Timestamp fallbacks are not correlatives.
        assert_eq!(leading_seq("20240315101500"), None);
    }

    #[test]
    fn fallback_is_a_compact_timestamp() {
        let now = DateTime::parse_from_rfc3339("2024-03-15T10:15:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(fallback_number(now), "20240315101500");
    }

    #[test]
    fn sequences_are_per_tender_and_period() {
        let seq = NumberingSequencer::new();
        assert_eq!(seq.next_seq("T1", MARCH), 1);
        assert_eq!(seq.next_seq("T1", MARCH), 2);
        // A different tender or period starts its own correlative.
        assert_eq!(seq.next_seq("T2", MARCH), 1);
        assert_eq!(seq.next_seq("T1", Period { year: 2024, month: 4 }), 1);
    }

    #[test]
    fn next_order_number_uses_registered_call() {
        let seq = NumberingSequencer::new();
        seq.register_call("T1", "15");
        assert_eq!(seq.next_order_number("T1", MARCH), "001/2024-15/03");
        assert_eq!(seq.next_order_number("T1", MARCH), "002/2024-15/03");
        assert_eq!(seq.next_order_number("T2", MARCH), "001/2024-03");
    }

    #[test]
    fn seed_fast_forwards_past_existing_numbers() {
        let seq = NumberingSequencer::new();
        seq.seed(
            "T1",
            MARCH,
            ["004/2024-03", "011/2024-03", "garbage", "20240315101500"],
        );
        assert_eq!(seq.next_seq("T1", MARCH), 12);
    }

    #[test]
    fn seed_never_rewinds() {
        let seq = NumberingSequencer::new();
        seq.next_seq("T1", MARCH);
        seq.next_seq("T1", MARCH); // counter at 2
        seq.seed("T1", MARCH, ["001/2024-03"]);
        assert_eq!(seq.next_seq("T1", MARCH), 3);
    }

    #[test]
    fn concurrent_allocation_is_gapless_and_distinct() {
        use std::sync::Arc;
        use std::thread;

        let seq = Arc::new(NumberingSequencer::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let seq = Arc::clone(&seq);
            handles.push(thread::spawn(move || seq.next_seq("T1", MARCH)));
        }
        let mut got: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        got.sort_unstable();
        let expected: Vec<u32> = (1..=50).collect();
        assert_eq!(got, expected);
    }
}
