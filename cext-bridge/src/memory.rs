//! # Native Memory Tracking
//!
//! Bookkeeping for memory handed out by the native allocator on behalf of
//! extensions.
//!
//! ## Design
//!
//! - [`NativeMemoryLedger`] keeps two disjoint maps, *allocated* and
//!   *freed*. An address moves from one to the other on every traced free
//!   and back on the next traced allocation at the same address, so a
//!   second free of the same address is recognizable as a double free.
//! - [`TraceMallocDomain`]s are independent byte-accounting namespaces
//!   addressed by small integer ids.
//! - [`MemoryPressure`] accounts bytes against a ceiling. When a request
//!   does not fit, it runs a bounded number of collection rounds with a
//!   growing pause between them before reporting out-of-memory.
//!
//! The ledger itself is not synchronized; owners serialize access to it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::{DiagnosticPolicy, MemoryConfig};
use crate::error::{BridgeError, BridgeResult, ConsistencyKind};

/// An opaque native address.
///
/// The bridge compares and hashes these but never dereferences them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NativePointer(u64);

impl NativePointer {
    /// The null address.
    pub const NULL: NativePointer = NativePointer(0);

    /// Wrap a raw address.
    pub const fn new(address: u64) -> Self {
        NativePointer(address)
    }

    /// The raw address.
    pub const fn address(self) -> u64 {
        self.0
    }

    /// Whether this is the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<usize> for NativePointer {
    fn from(address: usize) -> Self {
        NativePointer(address as u64)
    }
}

impl fmt::Display for NativePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for NativePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativePointer({:#x})", self.0)
    }
}

/// What is known about a traced allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    /// The allocated address.
    pub pointer: NativePointer,
    /// Name of the type the memory was allocated for, if known.
    pub type_tag: Option<String>,
    /// Description of the managed frame that requested the memory.
    pub site: Option<String>,
    /// Size in bytes; `None` for static registrations.
    pub size: Option<u64>,
}

/// Counts of diagnostics emitted by a ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Frees of already-freed addresses.
    pub double_frees: u64,
    /// Frees of addresses whose allocation was never traced.
    pub untracked_frees: u64,
    /// Accesses to freed addresses.
    pub invalid_accesses: u64,
}

impl LedgerStats {
    /// Total number of diagnostics.
    pub fn total(&self) -> u64 {
        self.double_frees + self.untracked_frees + self.invalid_accesses
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Allocation/free ledger for native memory.
///
/// An address is never in both the allocated and the freed map.
pub struct NativeMemoryLedger {
    allocated: HashMap<NativePointer, AllocationRecord>,
    /// Freed addresses with the record they had when freed, if any.
    freed: HashMap<NativePointer, Option<AllocationRecord>>,
    domains: Vec<TraceMallocDomain>,
    policy: DiagnosticPolicy,
    check_accesses: bool,
    stats: LedgerStats,
}

impl NativeMemoryLedger {
    /// Create an empty ledger with the given diagnostic policy.
    pub fn new(policy: DiagnosticPolicy) -> Self {
        Self {
            allocated: HashMap::new(),
            freed: HashMap::new(),
            domains: Vec::new(),
            policy,
            check_accesses: false,
            stats: LedgerStats::default(),
        }
    }

    /// Create a ledger from memory configuration.
    pub fn from_config(config: &MemoryConfig) -> Self {
        let mut ledger = Self::new(config.diagnostics);
        ledger.check_accesses = config.trace_native_memory;
        ledger
    }

    /// Enable or disable [`check_access`](Self::check_access).
    pub fn set_check_accesses(&mut self, enabled: bool) {
        self.check_accesses = enabled;
    }

    /// The diagnostic policy in effect.
    pub fn policy(&self) -> DiagnosticPolicy {
        self.policy
    }

    /// Record a fresh allocation.
    ///
    /// # Panics
    ///
    /// Panics if `pointer` is already recorded as allocated: the allocator
    /// handed out the same memory twice.
    pub fn trace_alloc(
        &mut self,
        pointer: NativePointer,
        site: Option<&str>,
        type_tag: Option<&str>,
        size: u64,
    ) {
        assert!(
            !self.allocated.contains_key(&pointer),
            "native memory allocator reserved same memory twice: {}",
            pointer
        );
        self.freed.remove(&pointer);
        self.allocated.insert(
            pointer,
            AllocationRecord {
                pointer,
                type_tag: type_tag.map(str::to_owned),
                site: site.map(str::to_owned),
                size: Some(size),
            },
        );
    }

    /// Record a free and return the record the allocation had.
    ///
    /// Freeing an already-freed address or one whose allocation was never
    /// traced is reported as a diagnostic. The ledger is updated either
    /// way; under [`DiagnosticPolicy::Strict`] the diagnostic is also
    /// returned as an error.
    pub fn trace_free(
        &mut self,
        pointer: NativePointer,
        site: Option<&str>,
        type_tag: Option<&str>,
    ) -> BridgeResult<Option<AllocationRecord>> {
        let record = self.allocated.remove(&pointer);
        let already_freed = self.freed.insert(pointer, record.clone()).is_some();

        if already_freed {
            self.stats.double_frees += 1;
            error!(
                %pointer,
                site = site.unwrap_or("<unknown>"),
                type_tag = type_tag.unwrap_or("<unknown>"),
                "freeing memory that was already freed (double free)"
            );
            self.diagnostic(pointer, ConsistencyKind::DoubleFree)?;
        } else if record.is_none() {
            self.stats.untracked_frees += 1;
            info!(
                %pointer,
                site = site.unwrap_or("<unknown>"),
                type_tag = type_tag.unwrap_or("<unknown>"),
                "freeing non-allocated memory (double free or untraced allocation)"
            );
            self.diagnostic(pointer, ConsistencyKind::UntrackedFree)?;
        }

        Ok(record)
    }

    /// Register long-lived memory (static types, module state).
    ///
    /// Unlike [`trace_alloc`](Self::trace_alloc), registering an address
    /// that is already allocated is not an error.
    pub fn trace_static_memory(
        &mut self,
        pointer: NativePointer,
        site: Option<&str>,
        type_tag: Option<&str>,
    ) {
        self.freed.remove(&pointer);
        self.allocated.insert(
            pointer,
            AllocationRecord {
                pointer,
                type_tag: type_tag.map(str::to_owned),
                site: site.map(str::to_owned),
                size: None,
            },
        );
    }

    /// Whether `pointer` may be accessed.
    ///
    /// Only addresses explicitly recorded as freed are reported as not
    /// allocated; memory the ledger never saw is assumed valid.
    pub fn is_allocated(&self, pointer: NativePointer) -> bool {
        if self.freed.contains_key(&pointer) {
            debug_assert!(!self.allocated.contains_key(&pointer));
            return false;
        }
        true
    }

    /// Report an access to freed memory when access checking is enabled.
    pub fn check_access(&mut self, pointer: NativePointer) -> BridgeResult<()> {
        if !self.check_accesses || self.is_allocated(pointer) {
            return Ok(());
        }
        self.stats.invalid_accesses += 1;
        error!(%pointer, "access to invalid memory");
        self.diagnostic(pointer, ConsistencyKind::InvalidAccess)
    }

    fn diagnostic(&self, pointer: NativePointer, kind: ConsistencyKind) -> BridgeResult<()> {
        match self.policy {
            DiagnosticPolicy::Log => Ok(()),
            DiagnosticPolicy::Strict => Err(BridgeError::MemoryConsistency { pointer, kind }),
        }
    }

    /// The record of a live allocation.
    pub fn allocation(&self, pointer: NativePointer) -> Option<&AllocationRecord> {
        self.allocated.get(&pointer)
    }

    /// Number of live allocations.
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Number of addresses currently marked freed.
    pub fn freed_count(&self) -> usize {
        self.freed.len()
    }

    /// Bytes held by live allocations with a known size.
    pub fn traced_bytes(&self) -> u64 {
        self.allocated.values().filter_map(|r| r.size).sum()
    }

    /// Live allocations, in no particular order.
    pub fn live_allocations(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.allocated.values()
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> LedgerStats {
        self.stats
    }

    /// Find the domain with `id`, creating it if needed, and return its
    /// index.
    pub fn find_or_create_domain(&mut self, id: u32) -> usize {
        if let Some(index) = self.domains.iter().position(|d| d.id == id) {
            return index;
        }
        self.domains.push(TraceMallocDomain::new(id));
        self.domains.len() - 1
    }

    /// The domain at `index`.
    pub fn domain(&self, index: usize) -> Option<&TraceMallocDomain> {
        self.domains.get(index)
    }

    /// The domain at `index`, mutably.
    pub fn domain_mut(&mut self, index: usize) -> Option<&mut TraceMallocDomain> {
        self.domains.get_mut(index)
    }
}

impl Default for NativeMemoryLedger {
    fn default() -> Self {
        Self::new(DiagnosticPolicy::default())
    }
}

impl fmt::Debug for NativeMemoryLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeMemoryLedger")
            .field("allocated", &self.allocated.len())
            .field("freed", &self.freed.len())
            .field("domains", &self.domains.len())
            .field("policy", &self.policy)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Byte accounting for one tracing domain.
#[derive(Debug, Clone)]
pub struct TraceMallocDomain {
    id: u32,
    sizes: HashMap<NativePointer, u64>,
}

impl TraceMallocDomain {
    fn new(id: u32) -> Self {
        Self {
            id,
            sizes: HashMap::new(),
        }
    }

    /// The domain id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Account `size` bytes at `pointer`, replacing any earlier entry.
    pub fn track(&mut self, pointer: NativePointer, size: u64) {
        self.sizes.insert(pointer, size);
    }

    /// Stop accounting `pointer`; returns its size, or 0 if untracked.
    pub fn untrack(&mut self, pointer: NativePointer) -> u64 {
        self.sizes.remove(&pointer).unwrap_or(0)
    }

    /// Bytes currently accounted.
    pub fn total_bytes(&self) -> u64 {
        self.sizes.values().sum()
    }

    /// Number of tracked addresses.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

// ============================================================================
// Memory Pressure
// ============================================================================

/// Collector entry points used while waiting for native memory.
pub trait CollectionHooks {
    /// Run a full collection of the managed heap.
    fn full_collection(&self);

    /// Process objects whose finalization released native memory.
    fn drain_finalization_queue(&self) {}

    /// Run pending asynchronous actions (signal handlers, finalizers
    /// scheduled on the calling thread).
    fn run_async_actions(&self) {}

    /// Give the collector time to make progress.
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// The caller's managed execution state.
///
/// The collection loop leaves the managed execution context for its whole
/// duration so that other threads and finalizers can run.
pub trait ExecutionContext {
    /// Leave the managed execution context.
    fn exit(&self);

    /// Re-enter the managed execution context.
    fn enter(&self);
}

/// Execution context for callers without managed state.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedContext;

impl ExecutionContext for DetachedContext {
    fn exit(&self) {}
    fn enter(&self) {}
}

/// Re-enters the execution context on drop.
struct ExitedContext<'a, E: ExecutionContext + ?Sized> {
    context: &'a E,
}

impl<'a, E: ExecutionContext + ?Sized> ExitedContext<'a, E> {
    fn exit(context: &'a E) -> Self {
        context.exit();
        Self { context }
    }
}

impl<E: ExecutionContext + ?Sized> Drop for ExitedContext<'_, E> {
    fn drop(&mut self) {
        self.context.enter();
    }
}

/// Native memory accounting against a ceiling.
pub struct MemoryPressure {
    allocated: AtomicU64,
    /// 0 means unlimited.
    ceiling: u64,
    max_retries: u32,
    backoff_step: Duration,
    collection_rounds: AtomicU64,
}

impl MemoryPressure {
    /// Create a pressure account.
    pub fn new(ceiling: u64, max_retries: u32, backoff_step: Duration) -> Self {
        Self {
            allocated: AtomicU64::new(0),
            ceiling,
            max_retries,
            backoff_step,
            collection_rounds: AtomicU64::new(0),
        }
    }

    /// Create a pressure account from memory configuration.
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(
            config.max_native_memory,
            config.collection_retries,
            config.collection_backoff,
        )
    }

    /// Bytes currently accounted.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// The ceiling in bytes (0 = unlimited).
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Collection rounds run so far.
    pub fn collection_rounds(&self) -> u64 {
        self.collection_rounds.load(Ordering::Relaxed)
    }

    /// Account `size` more bytes, collecting if the ceiling would be
    /// exceeded.
    ///
    /// Each collection round grows the pause by the backoff step, runs a
    /// full collection, pauses, drains the finalization queue and runs
    /// async actions before rechecking. `context` is exited for the whole
    /// loop and re-entered on every exit path.
    pub fn increase<H, E>(&self, size: u64, hooks: &H, context: &E) -> BridgeResult<()>
    where
        H: CollectionHooks + ?Sized,
        E: ExecutionContext + ?Sized,
    {
        if self.try_reserve(size) {
            return Ok(());
        }

        let _exited = ExitedContext::exit(context);
        let mut delay = Duration::ZERO;
        for round in 1..=self.max_retries {
            delay += self.backoff_step;
            self.collection_rounds.fetch_add(1, Ordering::Relaxed);
            debug!(round, requested = size, ?delay, "full collection due to native memory");

            hooks.full_collection();
            hooks.pause(delay);
            hooks.drain_finalization_queue();
            hooks.run_async_actions();

            if self.try_reserve(size) {
                return Ok(());
            }
        }

        Err(BridgeError::OutOfMemory {
            requested: size,
            allocated: self.allocated(),
            ceiling: self.ceiling,
            retries: self.max_retries,
        })
    }

    /// Release `size` bytes.
    pub fn reduce(&self, size: u64) {
        let _ = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            });
    }

    fn try_reserve(&self, size: u64) -> bool {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(size)?;
                (self.ceiling == 0 || next <= self.ceiling).then_some(next)
            })
            .is_ok()
    }
}

impl fmt::Debug for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPressure")
            .field("allocated", &self.allocated())
            .field("ceiling", &self.ceiling)
            .field("max_retries", &self.max_retries)
            .field("backoff_step", &self.backoff_step)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
