//! Quota store: atomic reservation of adjudicated quantities.
//!
//! # Design
//!
//! One balance cell per [`QuotaKey`], each behind its own mutex. A
//! reservation is a single check-and-decrement under that mutex, so two
//! concurrent emissions can never both validate against a stale remaining
//! value. Multi-key reservations ([`QuotaStore::reserve_batch`]) acquire the
//! involved locks in canonical key order, check every balance, then apply
//! every decrement before releasing. All-or-nothing: no other caller
//! can observe a half-applied batch.
//!
//! Lock acquisition is bounded: a cell that stays contended past
//! [`LOCK_TIMEOUT`] fails the operation with a retryable
//! [`QuotaError::Contention`] instead of hanging the caller. Reservations
//! against disjoint keys proceed fully in parallel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::types::{QuotaBalance, QuotaKey};

/// Upper bound on waiting for a contended balance cell.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// All failures the quota store can surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// Requested more than the remaining balance. Recoverable: the caller
    /// corrects the quantity and retries.
    InsufficientQuota {
        lot: u32,
        item: u32,
        requested: i64,
        available: i64,
    },
    /// No balance loaded for this key.
    UnknownKey { lot: u32, item: u32 },
    /// A balance for this key already exists; maxima are set once.
    AlreadyLoaded { lot: u32, item: u32 },
    /// Reservation quantities must be strictly positive.
    NonPositiveQuantity { quantity: i64 },
    /// A balance cell stayed locked past [`LOCK_TIMEOUT`]. Retryable.
    Contention { lot: u32, item: u32 },
}

impl std::fmt::Display for QuotaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientQuota {
                lot,
                item,
                requested,
                available,
            } => write!(
                f,
                "insufficient quota for lot {lot} item {item}: requested {requested}, available {available}"
            ),
            Self::UnknownKey { lot, item } => {
                write!(f, "no quota balance loaded for lot {lot} item {item}")
            }
            Self::AlreadyLoaded { lot, item } => {
                write!(f, "quota balance for lot {lot} item {item} already loaded")
            }
            Self::NonPositiveQuantity { quantity } => {
                write!(f, "reservation quantity must be > 0, got {quantity}")
            }
            Self::Contention { lot, item } => write!(
                f,
                "timed out waiting for quota balance of lot {lot} item {item}; retry"
            ),
        }
    }
}

impl std::error::Error for QuotaError {}

// ---------------------------------------------------------------------------
// QuotaStore
// ---------------------------------------------------------------------------

type BalanceCell = Arc<Mutex<QuotaBalance>>;

/// In-memory quota balances with per-key locking.
///
/// Balance rows are created once by tender ingestion ([`QuotaStore::load`])
/// and mutated only through the reservation path.
#[derive(Default)]
pub struct QuotaStore {
    entries: RwLock<HashMap<QuotaKey, BalanceCell>>,
}

impl QuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Ingestion boundary
    // -----------------------------------------------------------------------

    /// Register the adjudicated maximum for a key. Set once; a second load
    /// for the same key fails with [`QuotaError::AlreadyLoaded`].
    pub fn load(&self, key: QuotaKey, max_quantity: i64) -> Result<(), QuotaError> {
        self.load_balance(key, QuotaBalance::new(max_quantity))
    }

    /// Register a rehydrated balance (persistence replay path).
    pub fn load_balance(&self, key: QuotaKey, balance: QuotaBalance) -> Result<(), QuotaError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(QuotaError::AlreadyLoaded {
                lot: key.lot,
                item: key.item,
            });
        }
        entries.insert(key, Arc::new(Mutex::new(balance)));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Remaining balance for a key at the instant of the call.
    pub fn remaining(&self, key: &QuotaKey) -> Result<i64, QuotaError> {
        let cell = self.cell(key)?;
        let bal = lock_cell(&cell, key)?;
        Ok(bal.remaining())
    }

    /// Snapshot of the balance for a key.
    pub fn balance(&self, key: &QuotaKey) -> Result<QuotaBalance, QuotaError> {
        let cell = self.cell(key)?;
        let bal = lock_cell(&cell, key)?;
        Ok(*bal)
    }

    /// Snapshot of every balance, sorted by key.
    pub fn balances(&self) -> Vec<(QuotaKey, QuotaBalance)> {
        let entries = self.entries.read();
        let mut out: Vec<(QuotaKey, QuotaBalance)> = entries
            .iter()
            .map(|(k, cell)| (k.clone(), *cell.lock()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Per-service balances for one tender that still have quantity left,
    /// sorted by key. This is the item-picker view of the emission workflow.
    pub fn open_balances(&self, tender_id: &str, service: Option<&str>) -> Vec<(QuotaKey, QuotaBalance)> {
        self.balances()
            .into_iter()
            .filter(|(k, b)| {
                k.tender_id == tender_id
                    && !k.is_global()
                    && b.remaining() > 0
                    && service.map_or(true, |s| k.service.as_deref() == Some(s))
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Reservation
    // -----------------------------------------------------------------------

    /// Atomically check and decrement the balance for one key.
    pub fn reserve(&self, key: &QuotaKey, quantity: i64) -> Result<(), QuotaError> {
        if quantity <= 0 {
            return Err(QuotaError::NonPositiveQuantity { quantity });
        }
        let cell = self.cell(key)?;
        let mut bal = lock_cell(&cell, key)?;
        bal.try_reserve(quantity)
            .map_err(|available| QuotaError::InsufficientQuota {
                lot: key.lot,
                item: key.item,
                requested: quantity,
                available,
            })
    }

    /// Atomically check and decrement the tender-wide aggregate balance.
    pub fn reserve_global(
        &self,
        tender_id: &str,
        lot: u32,
        item: u32,
        quantity: i64,
    ) -> Result<(), QuotaError> {
        self.reserve(&QuotaKey::global(tender_id, lot, item), quantity)
    }

    /// All-or-nothing reservation across several keys.
    ///
    /// Demands for the same key are summed. Locks are taken in canonical key
    /// order so overlapping batches cannot deadlock; with all locks held,
    /// every balance is checked before any is decremented. On failure no
    /// balance has changed and the first offending key is reported.
    pub fn reserve_batch(&self, demands: &[(QuotaKey, i64)]) -> Result<(), QuotaError> {
        if demands.is_empty() {
            return Ok(());
        }
        for (_, quantity) in demands {
            if *quantity <= 0 {
                return Err(QuotaError::NonPositiveQuantity {
                    quantity: *quantity,
                });
            }
        }

        // BTreeMap both aggregates duplicate keys and fixes the lock order.
        let mut wanted: BTreeMap<&QuotaKey, i64> = BTreeMap::new();
        for (key, quantity) in demands {
            *wanted.entry(key).or_insert(0) += quantity;
        }

        // Resolve every cell up front so an unknown key fails before locking.
        let mut cells: Vec<(&QuotaKey, i64, BalanceCell)> = Vec::with_capacity(wanted.len());
        for (&key, &quantity) in &wanted {
            cells.push((key, quantity, self.cell(key)?));
        }

        let mut guards: Vec<MutexGuard<'_, QuotaBalance>> = Vec::with_capacity(cells.len());
        for (key, _, cell) in &cells {
            guards.push(lock_cell(cell, key)?);
        }

        // Check all...
        for (guard, &(key, quantity, _)) in guards.iter().zip(&cells) {
            let available = guard.remaining();
            if quantity > available {
                return Err(QuotaError::InsufficientQuota {
                    lot: key.lot,
                    item: key.item,
                    requested: quantity,
                    available,
                });
            }
        }

        // ...then apply all. Cannot fail: every check passed under the locks
        // we still hold.
        for (guard, (_, quantity, _)) in guards.iter_mut().zip(&cells) {
            guard
                .try_reserve(*quantity)
                .expect("checked under held lock");
        }

        Ok(())
    }

    /// Undo a previously applied [`reserve_batch`](Self::reserve_batch).
    /// Compensation path for an order append that fails after reservation.
    pub(crate) fn release_batch(&self, demands: &[(QuotaKey, i64)]) {
        let mut released: BTreeMap<&QuotaKey, i64> = BTreeMap::new();
        for (key, quantity) in demands {
            *released.entry(key).or_insert(0) += quantity;
        }
        for (key, quantity) in released {
            if let Some(cell) = self.entries.read().get(key).cloned() {
                cell.lock().release(quantity);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn cell(&self, key: &QuotaKey) -> Result<BalanceCell, QuotaError> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or(QuotaError::UnknownKey {
                lot: key.lot,
                item: key.item,
            })
    }
}

fn lock_cell<'a>(
    cell: &'a BalanceCell,
    key: &QuotaKey,
) -> Result<MutexGuard<'a, QuotaBalance>, QuotaError> {
    cell.try_lock_for(LOCK_TIMEOUT)
        .ok_or(QuotaError::Contention {
            lot: key.lot,
            item: key.item,
        })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
