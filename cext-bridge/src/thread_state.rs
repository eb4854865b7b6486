//! Thread-specific storage and native locks for extension threading APIs.
//!
//! Extensions allocate thread-specific storage keys and lock ids through
//! the bridge. Both are plain integers handed to native code, allocated
//! from monotonically increasing counters; the first key and the first
//! lock id are 1, so 0 never names a live slot.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

/// Key of a thread-specific storage slot.
pub type SlotKey = i64;

/// Id of a native lock.
pub type LockId = i64;

// ============================================================================
// Thread-specific storage
// ============================================================================

/// Per-key, per-thread value storage.
pub struct ThreadLocalSlotTable<V> {
    slots: DashMap<SlotKey, DashMap<ThreadId, V>>,
    next_key: AtomicI64,
}

impl<V> ThreadLocalSlotTable<V> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_key: AtomicI64::new(0),
        }
    }

    /// Allocate a fresh key.
    pub fn create_key(&self) -> SlotKey {
        let key = self.next_key.fetch_add(1, Ordering::AcqRel) + 1;
        self.slots.insert(key, DashMap::new());
        key
    }

    /// Store `value` for the calling thread.
    ///
    /// Setting a deleted key recreates its slot.
    pub fn set(&self, key: SlotKey, value: V) {
        self.set_for(thread::current().id(), key, value);
    }

    /// Store `value` for a specific thread.
    pub fn set_for(&self, thread: ThreadId, key: SlotKey, value: V) {
        self.slots.entry(key).or_default().insert(thread, value);
    }

    /// Delete a key and every thread's value for it.
    pub fn delete(&self, key: SlotKey) -> bool {
        self.slots.remove(&key).is_some()
    }

    /// Drop every value stored by `thread`.
    pub fn forget_thread(&self, thread: ThreadId) {
        for slot in self.slots.iter() {
            slot.value().remove(&thread);
        }
    }

    /// Whether `key` is live.
    pub fn contains_key(&self, key: SlotKey) -> bool {
        self.slots.contains_key(&key)
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        self.slots.len()
    }
}

impl<V: Clone> ThreadLocalSlotTable<V> {
    /// The calling thread's value for `key`.
    pub fn get(&self, key: SlotKey) -> Option<V> {
        self.get_for(thread::current().id(), key)
    }

    /// A specific thread's value for `key`.
    pub fn get_for(&self, thread: ThreadId, key: SlotKey) -> Option<V> {
        let slot = self.slots.get(&key)?;
        let value = slot.get(&thread)?;
        Some(value.clone())
    }
}

impl<V> Default for ThreadLocalSlotTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for ThreadLocalSlotTable<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLocalSlotTable")
            .field("keys", &self.slots.len())
            .field("next_key", &self.next_key.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Native locks
// ============================================================================

/// How long [`NativeLock::acquire`] may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Fail immediately if the lock is held.
    NoWait,
    /// Block until the lock is free.
    Forever,
    /// Block for at most the given duration.
    Timeout(Duration),
}

/// A non-reentrant lock that may be released by any thread.
#[derive(Debug, Default)]
pub struct NativeLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl NativeLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock; returns whether it was acquired.
    pub fn acquire(&self, wait: LockWait) -> bool {
        let mut locked = self.locked.lock();
        match wait {
            LockWait::NoWait => {}
            LockWait::Forever => {
                while *locked {
                    self.released.wait(&mut locked);
                }
            }
            LockWait::Timeout(timeout) => {
                let deadline = Instant::now() + timeout;
                while *locked {
                    if self.released.wait_until(&mut locked, deadline).timed_out() {
                        break;
                    }
                }
            }
        }

        if *locked {
            return false;
        }
        *locked = true;
        true
    }

    /// Release the lock; returns `false` if it was not held.
    pub fn release(&self) -> bool {
        let mut locked = self.locked.lock();
        if !*locked {
            return false;
        }
        *locked = false;
        self.released.notify_one();
        true
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }
}

/// Lock ids handed to native code.
#[derive(Debug, Default)]
pub struct NativeLockTable {
    locks: DashMap<LockId, Arc<NativeLock>>,
    next_id: AtomicI64,
}

impl NativeLockTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new unlocked lock.
    pub fn allocate(&self) -> LockId {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.locks.insert(id, Arc::new(NativeLock::new()));
        id
    }

    /// Look up a lock.
    pub fn get(&self, id: LockId) -> Option<Arc<NativeLock>> {
        self.locks.get(&id).map(|lock| Arc::clone(lock.value()))
    }

    /// Acquire a lock by id; unknown ids are never acquired.
    pub fn acquire(&self, id: LockId, wait: LockWait) -> bool {
        // Clone out of the map so a blocking wait holds no shard lock.
        match self.get(id) {
            Some(lock) => lock.acquire(wait),
            None => false,
        }
    }

    /// Release a lock by id.
    pub fn release(&self, id: LockId) -> bool {
        self.get(id).is_some_and(|lock| lock.release())
    }

    /// Free a lock id.
    pub fn free(&self, id: LockId) -> bool {
        self.locks.remove(&id).is_some()
    }

    /// Number of live locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no locks are live.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
