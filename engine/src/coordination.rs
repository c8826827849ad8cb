//! Async coordination primitives.
//!
//! Three small tools underpin the engine's concurrency discipline: a
//! registry of named async locks (per-item and per-table), a single-slot
//! serializer for Push/Pull/Purge actions, and a cooperative
//! cancellation token checked at batch and page boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A registry of async mutexes keyed by string.
///
/// Locks are created on demand and dropped once the last guard for a
/// key is released; the map holds only weak references, so it never
/// grows with the set of items ever touched.
#[derive(Default)]
pub struct LockMap {
    locks: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
}

/// Guard for a named lock; the lock releases on drop.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl LockMap {
    /// Creates an empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, waiting if it is held.
    pub async fn acquire(&self, key: &str) -> LockGuard {
        let lock = {
            let mut locks = self.locks.lock().expect("lock map poisoned");
            match locks.get(key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let fresh = Arc::new(Mutex::new(()));
                    locks.insert(key.to_string(), Arc::downgrade(&fresh));
                    if locks.len() % 64 == 0 {
                        locks.retain(|_, weak| weak.strong_count() > 0);
                    }
                    fresh
                }
            }
        };
        LockGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of live entries, counting expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.locks.lock().expect("lock map poisoned").len()
    }

    /// True when no entries exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-slot serializer for sync actions.
///
/// Push, pull, and purge acquire the slot for their whole run, so no
/// two actions ever interleave. Local mutations do not take the slot;
/// they serialize against actions through the store/queue writer lock.
#[derive(Default)]
pub struct ActionSlot {
    slot: Mutex<()>,
}

impl ActionSlot {
    /// Creates a free slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the slot, waiting for a running action to finish.
    pub async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.slot.lock().await
    }
}

/// Cooperative cancellation flag.
///
/// Long-running calls accept a token and poll it at safe points: push
/// between operations, pull between pages. Cancelling never interrupts
/// an in-flight remote call.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a live token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once [`CancellationToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
