//! Correlation ID generation

use crate::CorrelationId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{self, AtomicU64};

/// Thread-safe generator for correlation IDs
///
/// IDs are handed out monotonically and tracked as live until released,
/// so a settlement can tell whether its ID is still outstanding.
pub struct IdGenerator {
    live: Mutex<HashSet<CorrelationId>>,
    next_id: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Get the next available ID and mark it live
    pub fn allocate(&self) -> CorrelationId {
        let id = CorrelationId(self.next_id.fetch_add(1, atomic::Ordering::Relaxed));
        self.live.lock().insert(id);
        id
    }

    /// Release an ID. Returns false if it was not live.
    pub fn release(&self, id: CorrelationId) -> bool {
        self.live.lock().remove(&id)
    }

    pub fn is_live(&self, id: CorrelationId) -> bool {
        self.live.lock().contains(&id)
    }

    /// Number of IDs allocated and not yet released
    pub fn outstanding(&self) -> usize {
        self.live.lock().len()
    }

    /// Forget every live ID without resetting the counter
    pub fn release_all(&self) -> usize {
        let mut live = self.live.lock();
        let count = live.len();
        live.clear();
        count
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
