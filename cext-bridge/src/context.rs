//! Per-context bridge state.
//!
//! A [`BridgeContext`] owns every table the bridge keeps for one managed
//! context: the native memory ledger and pressure counter, thread-specific
//! storage and locks, closures, loaded modules and the wrapper cache, plus
//! the coordinator that loads the backend and extensions into it.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::closure::HandleClosureRegistry;
use crate::config::BridgeConfig;
use crate::dispatch::DispatchContext;
use crate::error::BridgeResult;
use crate::loader::{Collaborators, ExtensionLoadCoordinator, ModuleSpec, NativeModeClaim};
use crate::memory::{
    AllocationRecord, CollectionHooks, ExecutionContext, MemoryPressure, NativeMemoryLedger,
    NativePointer,
};
use crate::module::{ModuleIndexTable, ModuleRef};
use crate::shutdown::{shutdown_hooks, ShutdownHooks};
use crate::thread_state::{NativeLockTable, ThreadLocalSlotTable};
use crate::wrappers::PrimitiveWrapperCache;

/// Bridge state of one managed context.
pub struct BridgeContext {
    config: BridgeConfig,
    ledger: Mutex<NativeMemoryLedger>,
    pressure: MemoryPressure,
    slots: ThreadLocalSlotTable<usize>,
    locks: NativeLockTable,
    closures: Arc<HandleClosureRegistry>,
    modules: Arc<Mutex<ModuleIndexTable>>,
    primitives: PrimitiveWrapperCache,
    loader: ExtensionLoadCoordinator,
    next_module_number: AtomicI64,
}

impl BridgeContext {
    /// Create a context using the process-wide native mode claim and
    /// shutdown hooks.
    pub fn new(config: BridgeConfig, collaborators: Collaborators) -> Arc<Self> {
        Self::with_process_state(config, collaborators, NativeModeClaim::global(), shutdown_hooks())
    }

    /// Create a context with explicit process-wide state.
    pub fn with_process_state(
        config: BridgeConfig,
        collaborators: Collaborators,
        claim: Arc<NativeModeClaim>,
        hooks: &'static ShutdownHooks,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| {
            let closures = Arc::new(HandleClosureRegistry::from_config(&config.loading));
            let modules = Arc::new(Mutex::new(ModuleIndexTable::new()));
            // The backend receives the context address as its environment.
            let environment = this.as_ptr() as usize;
            let loader = ExtensionLoadCoordinator::new(
                config.loading.clone(),
                collaborators,
                Arc::clone(&closures),
                Arc::clone(&modules),
            )
            .with_claim(claim)
            .with_shutdown_hooks(hooks)
            .with_environment(environment);

            Self {
                ledger: Mutex::new(NativeMemoryLedger::from_config(&config.memory)),
                pressure: MemoryPressure::from_config(&config.memory),
                slots: ThreadLocalSlotTable::new(),
                locks: NativeLockTable::new(),
                closures,
                modules,
                primitives: PrimitiveWrapperCache::new(),
                loader,
                next_module_number: AtomicI64::new(0),
                config,
            }
        })
    }

    /// The configuration this context was created with.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Address handed to native code as this context's environment.
    pub fn environment(&self) -> usize {
        self as *const Self as usize
    }

    /// Dispatch context for calls made on behalf of this context.
    pub fn dispatch_context(&self) -> DispatchContext {
        DispatchContext::new(self.environment())
    }

    // ------------------------------------------------------------------------
    // Native memory
    // ------------------------------------------------------------------------

    /// Lock the native memory ledger.
    pub fn ledger(&self) -> MutexGuard<'_, NativeMemoryLedger> {
        self.ledger.lock()
    }

    /// Record a native allocation.
    pub fn trace_alloc(
        &self,
        pointer: NativePointer,
        site: Option<&str>,
        type_tag: Option<&str>,
        size: u64,
    ) {
        self.ledger.lock().trace_alloc(pointer, site, type_tag, size);
    }

    /// Record a native free.
    pub fn trace_free(
        &self,
        pointer: NativePointer,
        site: Option<&str>,
        type_tag: Option<&str>,
    ) -> BridgeResult<Option<AllocationRecord>> {
        self.ledger.lock().trace_free(pointer, site, type_tag)
    }

    /// Register long-lived native memory.
    pub fn trace_static_memory(&self, pointer: NativePointer, site: Option<&str>, type_tag: Option<&str>) {
        self.ledger.lock().trace_static_memory(pointer, site, type_tag);
    }

    /// Whether `pointer` is currently allocated.
    pub fn is_allocated(&self, pointer: NativePointer) -> bool {
        self.ledger.lock().is_allocated(pointer)
    }

    /// Report an access to freed memory when tracing is enabled.
    pub fn check_access(&self, pointer: NativePointer) -> BridgeResult<()> {
        self.ledger.lock().check_access(pointer)
    }

    /// Native memory pressure accounting.
    pub fn pressure(&self) -> &MemoryPressure {
        &self.pressure
    }

    /// Account `size` bytes of native memory, collecting if over the ceiling.
    pub fn reserve_native_memory<H, E>(&self, size: u64, hooks: &H, context: &E) -> BridgeResult<()>
    where
        H: CollectionHooks + ?Sized,
        E: ExecutionContext + ?Sized,
    {
        self.pressure.increase(size, hooks, context)
    }

    /// Return `size` bytes of native memory.
    pub fn release_native_memory(&self, size: u64) {
        self.pressure.reduce(size);
    }

    // ------------------------------------------------------------------------
    // Threads, closures, modules
    // ------------------------------------------------------------------------

    /// Thread-specific storage.
    pub fn slots(&self) -> &ThreadLocalSlotTable<usize> {
        &self.slots
    }

    /// Native locks.
    pub fn locks(&self) -> &NativeLockTable {
        &self.locks
    }

    /// Native closures over managed callables.
    pub fn closures(&self) -> &HandleClosureRegistry {
        &self.closures
    }

    /// Lock the module index.
    pub fn modules(&self) -> MutexGuard<'_, ModuleIndexTable> {
        self.modules.lock()
    }

    /// Small-integer wrappers.
    pub fn primitives(&self) -> &PrimitiveWrapperCache {
        &self.primitives
    }

    /// The backend and extension loader.
    pub fn loader(&self) -> &ExtensionLoadCoordinator {
        &self.loader
    }

    /// Import an extension module.
    pub fn import_extension(&self, spec: &ModuleSpec) -> BridgeResult<ModuleRef> {
        self.loader.import_extension(spec)
    }

    /// Allocate a module number; numbers start at 1.
    pub fn next_module_number(&self) -> i64 {
        self.next_module_number.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Context exit: run the native finalizer.
    pub fn exit(&self) {
        self.loader.finalize();
    }
}

impl fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeContext")
            .field("ledger", &*self.ledger.lock())
            .field("pressure", &self.pressure)
            .field("closures", &self.closures)
            .field("modules", &*self.modules.lock())
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}
