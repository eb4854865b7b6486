//! Identity-preserving wrapper caches.
//!
//! Native code compares object pointers for identity, so the bridge must
//! hand out the same wrapper for the same value for as long as that value
//! is reachable.
//!
//! - [`PrimitiveWrapperCache`]: one immortal wrapper per small integer in
//!   `[-5, 256]`, created eagerly and never replaced.
//! - [`ProcWrapperCache`]: per-owner arrays of slot wrappers. Owners are
//!   held weakly, so a cache entry never keeps its owner type alive; dead
//!   entries are evicted on lookup or by [`ProcWrapperCache::purge`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Smallest cached integer.
pub const SMALL_INT_MIN: i64 = -5;

/// Largest cached integer.
pub const SMALL_INT_MAX: i64 = 256;

/// Number of cached integers.
pub const SMALL_INT_COUNT: usize = (SMALL_INT_MAX - SMALL_INT_MIN + 1) as usize;

/// Reference count reported for immortal wrappers.
pub const IMMORTAL_REFCOUNT: i64 = i64::MAX / 2;

/// Wrapper around a cached small integer.
#[derive(Debug, PartialEq, Eq)]
pub struct PrimitiveWrapper {
    value: i32,
}

impl PrimitiveWrapper {
    /// The wrapped value.
    pub fn value(&self) -> i32 {
        self.value
    }

    /// Cached wrappers are never deallocated.
    pub fn refcount(&self) -> i64 {
        IMMORTAL_REFCOUNT
    }
}

/// Fixed table of small-integer wrappers.
pub struct PrimitiveWrapperCache {
    entries: Box<[Arc<PrimitiveWrapper>]>,
}

impl PrimitiveWrapperCache {
    /// Create the cache with every entry populated.
    pub fn new() -> Self {
        let entries = (SMALL_INT_MIN..=SMALL_INT_MAX)
            .map(|value| Arc::new(PrimitiveWrapper { value: value as i32 }))
            .collect();
        Self { entries }
    }

    /// Whether `value` has a cached wrapper.
    pub fn contains(value: i64) -> bool {
        (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&value)
    }

    /// The cached wrapper for `value`.
    pub fn get(&self, value: i64) -> Option<Arc<PrimitiveWrapper>> {
        if !Self::contains(value) {
            return None;
        }
        let index = (value - SMALL_INT_MIN) as usize;
        self.entries.get(index).cloned()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; the cache is populated at construction.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PrimitiveWrapperCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrimitiveWrapperCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimitiveWrapperCache")
            .field("range", &(SMALL_INT_MIN..=SMALL_INT_MAX))
            .finish()
    }
}

struct OwnerSlots<O, W> {
    owner: Weak<O>,
    slots: Box<[Option<Arc<W>>]>,
}

/// Slot wrappers keyed weakly by their owner.
pub struct ProcWrapperCache<O, W> {
    slot_count: usize,
    /// Keyed by owner address. The weak reference keeps the allocation, and
    /// so the key, reserved until the entry is removed.
    owners: Mutex<HashMap<usize, OwnerSlots<O, W>>>,
}

impl<O, W> ProcWrapperCache<O, W> {
    /// Create a cache with `slot_count` slots per owner.
    pub fn new(slot_count: usize) -> Self {
        Self {
            slot_count,
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// Slots per owner.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// The wrapper at `slot` for `owner`, created by `create` on first use.
    ///
    /// Returns `None` when `slot` is out of range.
    pub fn get_or_create<F>(&self, owner: &Arc<O>, slot: usize, create: F) -> Option<Arc<W>>
    where
        F: FnOnce() -> W,
    {
        if slot >= self.slot_count {
            return None;
        }
        let key = Arc::as_ptr(owner) as *const () as usize;
        let mut owners = self.owners.lock();

        let stale = owners
            .get(&key)
            .is_some_and(|entry| entry.owner.strong_count() == 0);
        if stale {
            owners.remove(&key);
        }

        let entry = owners.entry(key).or_insert_with(|| OwnerSlots {
            owner: Arc::downgrade(owner),
            slots: (0..self.slot_count).map(|_| None).collect(),
        });
        let wrapper = entry.slots[slot].get_or_insert_with(|| Arc::new(create()));
        Some(Arc::clone(wrapper))
    }

    /// The wrapper at `slot` for `owner`, if one was created.
    pub fn get(&self, owner: &Arc<O>, slot: usize) -> Option<Arc<W>> {
        let key = Arc::as_ptr(owner) as *const () as usize;
        let owners = self.owners.lock();
        let entry = owners.get(&key)?;
        if entry.owner.strong_count() == 0 {
            return None;
        }
        entry.slots.get(slot)?.clone()
    }

    /// Drop entries whose owner is gone; returns how many were removed.
    pub fn purge(&self) -> usize {
        let mut owners = self.owners.lock();
        let before = owners.len();
        owners.retain(|_, entry| entry.owner.strong_count() > 0);
        before - owners.len()
    }

    /// Number of owners with an entry (including dead ones not yet purged).
    pub fn owner_count(&self) -> usize {
        self.owners.lock().len()
    }
}

impl<O, W> fmt::Debug for ProcWrapperCache<O, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcWrapperCache")
            .field("slot_count", &self.slot_count)
            .field("owners", &self.owner_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_cache_range() {
        let cache = PrimitiveWrapperCache::new();
        assert_eq!(cache.len(), 262);
        assert_eq!(cache.get(-5).unwrap().value(), -5);
        assert_eq!(cache.get(0).unwrap().value(), 0);
        assert_eq!(cache.get(256).unwrap().value(), 256);
        assert!(cache.get(-6).is_none());
        assert!(cache.get(257).is_none());
    }

    #[test]
    fn test_primitive_cache_identity() {
        let cache = PrimitiveWrapperCache::new();
        for value in SMALL_INT_MIN..=SMALL_INT_MAX {
            let a = cache.get(value).unwrap();
            let b = cache.get(value).unwrap();
            assert!(Arc::ptr_eq(&a, &b));
            assert_eq!(a.refcount(), IMMORTAL_REFCOUNT);
        }
    }

    #[derive(Debug)]
    struct TypeObject;

    #[test]
    fn test_proc_wrapper_identity_per_owner() {
        let cache: ProcWrapperCache<TypeObject, String> = ProcWrapperCache::new(4);
        let owner = Arc::new(TypeObject);

        let first = cache.get_or_create(&owner, 2, || "tp_call".to_string()).unwrap();
        let second = cache.get_or_create(&owner, 2, || unreachable!()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.get(&owner, 1).is_none());
        assert!(cache.get_or_create(&owner, 4, || "oob".to_string()).is_none());

        let other = Arc::new(TypeObject);
        let third = cache.get_or_create(&other, 2, || "tp_call".to_string()).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_proc_wrapper_entries_do_not_keep_owner_alive() {
        let cache: ProcWrapperCache<TypeObject, u32> = ProcWrapperCache::new(1);
        let owner = Arc::new(TypeObject);
        let weak = Arc::downgrade(&owner);
        cache.get_or_create(&owner, 0, || 7).unwrap();

        drop(owner);
        assert!(weak.upgrade().is_none());
        assert_eq!(cache.owner_count(), 1);
        assert_eq!(cache.purge(), 1);
        assert_eq!(cache.owner_count(), 0);
    }
}
