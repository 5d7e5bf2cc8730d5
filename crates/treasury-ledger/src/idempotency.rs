//! Replay guard for balance mutations.
//!
//! Each merchant row remembers the idempotency keys it has applied. A
//! mutation whose key is already known is a replay: it succeeds without
//! touching the balance or the journal.
//!
//! Release, settlement and deposit markers are permanent: forgetting one
//! would let a payout release twice or a deposit credit twice. Reservation
//! keys supplied by callers live in an LRU-style bounded window so memory
//! usage stays predictable for merchants with long histories.

use std::collections::{HashSet, VecDeque};

use treasury_types::{IdempotencyKey, constants::IDEMPOTENCY_KEYS_PER_MERCHANT};

/// Applied idempotency keys: permanent markers plus a bounded window of
/// request keys with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    /// Markers that are never evicted.
    permanent: HashSet<IdempotencyKey>,
    /// Request keys that have already been applied.
    applied: HashSet<IdempotencyKey>,
    /// Insertion order for eviction (front = oldest).
    order: VecDeque<IdempotencyKey>,
    /// Maximum number of entries before eviction kicks in.
    max_size: usize,
}

impl IdempotencyGuard {
    /// Create a new guard with the given maximum cache size.
    ///
    /// # Panics
    /// Panics if `max_size` is zero.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "IdempotencyGuard max_size must be > 0");
        Self {
            permanent: HashSet::new(),
            applied: HashSet::new(),
            order: VecDeque::new(),
            max_size,
        }
    }

    /// Record `key` as applied for good. Returns `false` if it was already
    /// known.
    pub fn mark_permanent(&mut self, key: IdempotencyKey) -> bool {
        if self.applied.contains(&key) {
            return false;
        }
        self.permanent.insert(key)
    }

    /// Record request key `key` as applied; it may be evicted later.
    /// Returns `false` if it was already known.
    pub fn mark_applied(&mut self, key: IdempotencyKey) -> bool {
        if self.is_applied(&key) {
            return false;
        }

        if self.applied.len() >= self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                self.applied.remove(&oldest);
            }
        }

        self.applied.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn is_applied(&self, key: &IdempotencyKey) -> bool {
        self.permanent.contains(key) || self.applied.contains(key)
    }

    pub fn len(&self) -> usize {
        self.permanent.len() + self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permanent.is_empty() && self.applied.is_empty()
    }
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new(IDEMPOTENCY_KEYS_PER_MERCHANT)
    }
}
