// ABOUTME: Per-key serial execution: work for one key runs one at a time, in arrival order.
// ABOUTME: Each key owns a fair async mutex; idle, unheld keys are evicted so the map stays bounded.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;

struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    last_used: Instant,
}

impl Slot {
    /// Nobody holds or waits on this slot's lock
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.lock) == 1
    }
}

/// Serializes async work per key
pub struct KeyedSerialQueue<K> {
    slots: Mutex<HashMap<K, Slot>>,
    idle_after: Duration,
    max_keys: usize,
}

impl<K> KeyedSerialQueue<K>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    pub fn new(idle_after: Duration, max_keys: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle_after,
            max_keys: max_keys.max(1),
        }
    }

    /// Wait for this key's turn. Work for the key is serialized until the guard drops;
    /// waiters are served in the order they called `acquire`.
    pub async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if slots.len() >= self.max_keys && !slots.contains_key(key) {
                // At capacity: drop every unheld key, not just the long-idle ones.
                slots.retain(|_, slot| !slot.is_idle());
            }
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                last_used: now,
            });
            slot.last_used = now;
            slot.lock.clone()
        };
        lock.lock_owned().await
    }

    /// Remove keys that have been idle longer than the configured window. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let before = slots.len();
        let idle_after = self.idle_after;
        slots.retain(|key, slot| {
            let age = now.saturating_duration_since(slot.last_used);
            if age > idle_after && slot.is_idle() {
                tracing::debug!(key = %key, idle_secs = age.as_secs(), "Evicting idle serial queue");
                false
            } else {
                true
            }
        });
        before - slots.len()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
