//! Per-VM-name serialization.
//!
//! Operations on different VM names run in parallel; operations on the same
//! name queue behind each other, so a delete cannot interleave with a create
//! rollback or a start with a delete's force stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard returned by [`NameLocks::acquire`]. The name is unlocked on drop.
pub type NameGuard = OwnedMutexGuard<()>;

/// A lock table keyed by VM name.
#[derive(Default)]
pub struct NameLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `name` is free and take it.
    pub async fn acquire(&self, name: &str) -> NameGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody holds or waits on.
            locks.retain(|key, lock| key == name || Arc::strong_count(lock) > 1);
            locks.entry(name.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of names currently tracked.
    pub fn tracked(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }
}
