// Pending Table — correlation key -> result slot for every in-flight request
//
// Both the dispatch task (on completion) and the waiting caller (on timeout)
// remove entries. `remove` hands the slot to whichever caller got there first
// and returns `None` to the other.

use super::slot::ResultSlot;
use crate::hashing::CorrelationKey;
use crate::VerifyError;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use zeroize::Zeroizing;

/// One accepted verification request awaiting dispatch
pub struct PendingRequest {
    key: CorrelationKey,
    /// The client identifier; zeroized when the last reference drops
    original_value: Zeroizing<String>,
    accepted_at: Instant,
    slot: Arc<ResultSlot>,
}

impl PendingRequest {
    pub fn new(key: CorrelationKey, original_value: &str, slot: Arc<ResultSlot>) -> Self {
        Self {
            key,
            original_value: Zeroizing::new(original_value.to_string()),
            accepted_at: Instant::now(),
            slot,
        }
    }

    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub fn original_value(&self) -> &str {
        &self.original_value
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    pub fn slot(&self) -> &Arc<ResultSlot> {
        &self.slot
    }
}

// Keeps the identifier out of any `{:?}` output
impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("original_value", &"<redacted>")
            .field("age", &self.accepted_at.elapsed())
            .field("slot", &self.slot)
            .finish()
    }
}

/// Concurrent map of in-flight requests
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<CorrelationKey, Arc<ResultSlot>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot under `key`. A key that is already present is rejected
    /// and the existing entry is left untouched.
    pub fn insert(&self, key: CorrelationKey, slot: Arc<ResultSlot>) -> Result<(), VerifyError> {
        match self.entries.lock().entry(key) {
            Entry::Occupied(_) => Err(VerifyError::CorrelationCollision),
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, key: &CorrelationKey) -> Option<Arc<ResultSlot>> {
        self.entries.lock().get(key).cloned()
    }

    /// Remove and return the slot for `key`; `None` if already removed
    pub fn remove(&self, key: &CorrelationKey) -> Option<Arc<ResultSlot>> {
        self.entries.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Empty the table, returning every slot that was still registered
    pub fn drain(&self) -> Vec<Arc<ResultSlot>> {
        self.entries.lock().drain().map(|(_, slot)| slot).collect()
    }
}
