//! Extension Loading Integration Tests
//!
//! Drives the backend and extension loading flows end to end with fake
//! libraries and module hosts. Raw-address entrypoints are real
//! `extern "C"` functions, so those paths go through libffi and the
//! builtin lookup closure is called from native code.

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use cext_bridge::config::{BridgeConfig, LoadingConfig};
use cext_bridge::error::{BridgeError, BridgeResult, GuestException};
use cext_bridge::ffi::FfiValue;
use cext_bridge::loader::{
    BackendLoader, BuiltinResolver, Collaborators, ExtensionLoadCoordinator, InitResult,
    InitSymbol, Invocable, InvokeError, LoadedLibrary, ModuleHost, ModuleSpec, NativeModeClaim,
};
use cext_bridge::module::{
    AttributeModule, ExtensionModule, ModuleIndexTable, ModuleRef, FILE_ATTRIBUTE,
    LIBRARY_ATTRIBUTE,
};
use cext_bridge::shutdown::ShutdownHooks;
use cext_bridge::{BridgeContext, HandleClosureRegistry};
use parking_lot::Mutex;

// ============================================================================
// Fakes
// ============================================================================

struct FakeLibrary {
    path: String,
    symbols: HashMap<String, InitSymbol>,
}

impl FakeLibrary {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            symbols: HashMap::new(),
        }
    }

    fn with(mut self, name: &str, symbol: InitSymbol) -> Self {
        self.symbols.insert(name.to_string(), symbol);
        self
    }

    fn executable<T: Invocable + 'static>(self, name: &str, target: Arc<T>) -> Self {
        self.with(name, InitSymbol::Executable(target))
    }
}

impl LoadedLibrary for FakeLibrary {
    fn path(&self) -> &str {
        &self.path
    }

    fn lookup(&self, symbol: &str) -> Option<InitSymbol> {
        self.symbols.get(symbol).cloned()
    }
}

#[derive(Default)]
struct FakeLoader {
    backend: Option<Arc<dyn LoadedLibrary>>,
    extensions: HashMap<String, Arc<dyn LoadedLibrary>>,
    native_loads: AtomicUsize,
    portable_loads: AtomicUsize,
}

impl FakeLoader {
    fn with_backend(backend: FakeLibrary) -> Self {
        Self {
            backend: Some(Arc::new(backend)),
            ..Self::default()
        }
    }

    fn find(&self, path: &Path) -> BridgeResult<Arc<dyn LoadedLibrary>> {
        let key = path.to_string_lossy();
        if let Some(library) = self.extensions.get(key.as_ref()) {
            return Ok(Arc::clone(library));
        }
        self.backend
            .clone()
            .ok_or_else(|| BridgeError::internal(format!("no library at {}", key)))
    }
}

impl BackendLoader for FakeLoader {
    fn load_native(&self, path: &Path) -> BridgeResult<Arc<dyn LoadedLibrary>> {
        self.native_loads.fetch_add(1, Ordering::SeqCst);
        self.find(path)
    }

    fn load_portable(&self, path: &Path) -> BridgeResult<Arc<dyn LoadedLibrary>> {
        self.portable_loads.fetch_add(1, Ordering::SeqCst);
        self.find(path)
    }
}

struct OffsetBuiltins;

impl BuiltinResolver for OffsetBuiltins {
    fn resolve(&self, id: i32) -> usize {
        0x1000 + id as usize
    }
}

#[derive(Default)]
struct FakeHost {
    results: HashMap<usize, InitResult>,
    indices: HashMap<usize, usize>,
    registered: Mutex<Vec<String>>,
    built: Mutex<Vec<(String, usize)>>,
    reject: Option<GuestException>,
}

impl FakeHost {
    fn single_phase(mut self, result: usize, module: ModuleRef, definition: usize, index: usize) -> Self {
        self.results.insert(result, InitResult::Module { module, definition });
        self.indices.insert(definition, index);
        self
    }

    fn multi_phase(mut self, result: usize, type_known: bool) -> Self {
        self.results.insert(
            result,
            InitResult::Definition {
                pointer: result,
                type_known,
            },
        );
        self
    }
}

impl ModuleHost for FakeHost {
    fn check_result(&self, _symbol: &str, _result: &FfiValue) -> BridgeResult<()> {
        match &self.reject {
            Some(exception) => Err(exception.clone().into()),
            None => Ok(()),
        }
    }

    fn to_managed(&self, result: &FfiValue) -> BridgeResult<InitResult> {
        let address = result.as_address().unwrap_or(0);
        self.results
            .get(&address)
            .cloned()
            .ok_or_else(|| BridgeError::internal(format!("unexpected init result {:#x}", address)))
    }

    fn read_module_index(&self, definition: usize) -> BridgeResult<usize> {
        self.indices
            .get(&definition)
            .copied()
            .ok_or_else(|| BridgeError::internal("definition without index"))
    }

    fn register_module(&self, name: &str, _module: ModuleRef) {
        self.registered.lock().push(name.to_string());
    }

    fn create_from_definition(
        &self,
        spec: &ModuleSpec,
        definition: usize,
        _library: Arc<dyn LoadedLibrary>,
    ) -> BridgeResult<ModuleRef> {
        self.built.lock().push((spec.name.clone(), definition));
        Ok(Arc::new(AttributeModule::new(spec.name.clone())))
    }
}

/// Invocable returning a fixed value once it gets the argument count it wants.
struct Fixed {
    expected: usize,
    result: FfiValue,
    seen: Mutex<Vec<Vec<FfiValue>>>,
}

impl Fixed {
    fn new(expected: usize, result: FfiValue) -> Arc<Self> {
        Arc::new(Self {
            expected,
            result,
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl Invocable for Fixed {
    fn invoke(&self, args: &[FfiValue]) -> Result<FfiValue, InvokeError> {
        self.seen.lock().push(args.to_vec());
        if args.len() < self.expected {
            return Err(InvokeError::Arity {
                expected: self.expected,
            });
        }
        Ok(self.result.clone())
    }
}

struct Raising(GuestException);

impl Invocable for Raising {
    fn invoke(&self, _args: &[FfiValue]) -> Result<FfiValue, InvokeError> {
        Err(self.0.clone().into())
    }
}

/// Not directly executable; only callable through its native address.
struct AddressOnly(usize);

impl Invocable for AddressOnly {
    fn invoke(&self, _args: &[FfiValue]) -> Result<FfiValue, InvokeError> {
        Err(InvokeError::Unsupported)
    }

    fn address(&self) -> Option<usize> {
        Some(self.0)
    }
}

// ============================================================================
// Native entrypoints
// ============================================================================

thread_local! {
    static INIT_ENV: Cell<usize> = const { Cell::new(0) };
    static BUILTIN_SEEN: Cell<usize> = const { Cell::new(0) };
    static FINALIZE_ARRAY: Cell<usize> = const { Cell::new(0) };
}

extern "C" fn backend_init(env: *mut c_void, lookup: *mut c_void) {
    INIT_ENV.with(|c| c.set(env as usize));
    // SAFETY: the bridge passes its builtin lookup closure here.
    let lookup: extern "C" fn(i32) -> *mut c_void = unsafe { std::mem::transmute(lookup) };
    BUILTIN_SEEN.with(|c| c.set(lookup(7) as usize));
}

extern "C" fn get_finalize_array() -> *mut c_void {
    FINALIZE_ARRAY.with(|c| c.get()) as *mut c_void
}

extern "C" fn pyinit_raw() -> *mut c_void {
    0xd100 as *mut c_void
}

const BACKEND_PATH: &str = "./libcapi-native.so";

// ============================================================================
// Fixture
// ============================================================================

fn leaked_hooks() -> &'static ShutdownHooks {
    Box::leak(Box::new(ShutdownHooks::new()))
}

struct Fixture {
    coordinator: ExtensionLoadCoordinator,
    loader: Arc<FakeLoader>,
    host: Arc<FakeHost>,
    closures: Arc<HandleClosureRegistry>,
    modules: Arc<Mutex<ModuleIndexTable>>,
    hooks: &'static ShutdownHooks,
}

fn fixture(config: LoadingConfig, loader: FakeLoader, host: FakeHost, claim: Arc<NativeModeClaim>) -> Fixture {
    let loader = Arc::new(loader);
    let host = Arc::new(host);
    let closures = Arc::new(HandleClosureRegistry::new());
    let modules = Arc::new(Mutex::new(ModuleIndexTable::new()));
    let hooks = leaked_hooks();
    let coordinator = ExtensionLoadCoordinator::new(
        config,
        Collaborators {
            loader: loader.clone(),
            builtins: Arc::new(OffsetBuiltins),
            host: host.clone(),
        },
        Arc::clone(&closures),
        Arc::clone(&modules),
    )
    .with_claim(claim)
    .with_shutdown_hooks(hooks)
    .with_environment(0xe000);

    Fixture {
        coordinator,
        loader,
        host,
        closures,
        modules,
        hooks,
    }
}

fn raw_backend() -> FakeLibrary {
    FakeLibrary::new(BACKEND_PATH).with("initialize_capi", InitSymbol::Address(backend_init as usize))
}

fn default_fixture(host: FakeHost) -> Fixture {
    fixture(
        LoadingConfig::default(),
        FakeLoader::with_backend(raw_backend()),
        host,
        Arc::new(NativeModeClaim::new()),
    )
}

// ============================================================================
// Backend
// ============================================================================

#[test]
fn test_raw_backend_init_receives_environment_and_lookup() {
    let f = default_fixture(FakeHost::default());
    let backend = f.coordinator.ensure_backend_loaded().unwrap();

    assert!(backend.is_native());
    assert_eq!(INIT_ENV.with(|c| c.get()), 0xe000);
    assert_eq!(BUILTIN_SEEN.with(|c| c.get()), 0x1007);
    assert_eq!(f.closures.len(), 1);
    assert!(f.closures.delegate_for(backend.builtin_lookup()).is_some());
}

#[test]
fn test_backend_load_is_idempotent() {
    let f = default_fixture(FakeHost::default());
    let first = f.coordinator.ensure_backend_loaded().unwrap();
    let second = f.coordinator.ensure_backend_loaded().unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(f.loader.native_loads.load(Ordering::SeqCst), 1);
    assert_eq!(f.closures.len(), 1);
}

#[test]
fn test_executable_backend_init_gets_null_context() {
    let init = Fixed::new(2, FfiValue::Void);
    let backend = FakeLibrary::new(BACKEND_PATH).executable("initialize_capi", Arc::clone(&init));
    let f = fixture(
        LoadingConfig::default(),
        FakeLoader::with_backend(backend),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    let backend = f.coordinator.ensure_backend_loaded().unwrap();

    let seen = init.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], vec![FfiValue::null(), FfiValue::address(backend.builtin_lookup())]);
}

#[test]
fn test_backend_init_arity_is_padded() {
    let init = Fixed::new(4, FfiValue::Void);
    let backend = FakeLibrary::new(BACKEND_PATH).executable("initialize_capi", Arc::clone(&init));
    let f = fixture(
        LoadingConfig::default(),
        FakeLoader::with_backend(backend),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    f.coordinator.ensure_backend_loaded().unwrap();

    let seen = init.seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].len(), 4);
    assert_eq!(seen[1][2], FfiValue::null());
    assert_eq!(seen[1][3], FfiValue::null());
}

#[test]
fn test_racing_contexts_share_one_native_backend() {
    let claim = Arc::new(NativeModeClaim::new());
    let fixtures: Vec<_> = (0..4)
        .map(|_| {
            Arc::new(fixture(
                LoadingConfig::default(),
                FakeLoader::with_backend(raw_backend()),
                FakeHost::default(),
                Arc::clone(&claim),
            ))
        })
        .collect();
    let barrier = Arc::new(Barrier::new(fixtures.len()));

    let handles: Vec<_> = fixtures
        .iter()
        .map(|f| {
            let f = Arc::clone(f);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                f.coordinator.ensure_backend_loaded().unwrap().is_native()
            })
        })
        .collect();
    let native: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(native.iter().filter(|n| **n).count(), 1);
    let portable: usize = fixtures
        .iter()
        .map(|f| f.loader.portable_loads.load(Ordering::SeqCst))
        .sum();
    assert_eq!(portable, 3);
    // The fallback warning was already emitted by one of the losers.
    assert!(!claim.warn_fallback_once());
}

#[test]
fn test_native_modules_disabled_uses_portable_without_claiming() {
    let claim = Arc::new(NativeModeClaim::new());
    let config = LoadingConfig {
        native_modules: false,
        ..LoadingConfig::default()
    };
    let f = fixture(config, FakeLoader::with_backend(raw_backend()), FakeHost::default(), Arc::clone(&claim));
    let backend = f.coordinator.ensure_backend_loaded().unwrap();

    assert!(!backend.is_native());
    assert!(!claim.is_claimed());
    assert_eq!(f.loader.portable_loads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_missing_backend_init_symbol() {
    let f = fixture(
        LoadingConfig::default(),
        FakeLoader::with_backend(FakeLibrary::new(BACKEND_PATH)),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    let err = f.coordinator.ensure_backend_loaded().unwrap_err();
    match err {
        BridgeError::InitializationFailure { symbol, .. } => assert_eq!(symbol, "initialize_capi"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(f.coordinator.backend().is_none());
}

#[test]
fn test_backend_failure_without_native_access() {
    let config = LoadingConfig {
        native_access_allowed: false,
        ..LoadingConfig::default()
    };
    let f = fixture(
        config,
        FakeLoader::with_backend(FakeLibrary::new(BACKEND_PATH)),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    let err = f.coordinator.ensure_backend_loaded().unwrap_err();
    assert!(matches!(err, BridgeError::ImportFailure { .. }));
    assert!(err.to_string().contains("native access is not allowed"));
}

#[test]
fn test_managed_backend_failure_stays_initialization_failure() {
    let config = LoadingConfig {
        native_access_allowed: false,
        backend_library: "libcapi-managed.so".to_string(),
        ..LoadingConfig::default()
    };
    let f = fixture(
        config,
        FakeLoader::with_backend(FakeLibrary::new("./libcapi-managed.so")),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    let err = f.coordinator.ensure_backend_loaded().unwrap_err();
    assert!(matches!(err, BridgeError::InitializationFailure { .. }));
}

#[test]
fn test_guest_exception_from_backend_init_passes_through() {
    let backend = FakeLibrary::new(BACKEND_PATH).executable(
        "initialize_capi",
        Arc::new(Raising(GuestException::new("SystemError", "capi broken"))),
    );
    let f = fixture(
        LoadingConfig::default(),
        FakeLoader::with_backend(backend),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    let err = f.coordinator.ensure_backend_loaded().unwrap_err();
    assert_eq!(err.to_string(), "SystemError: capi broken");
    assert!(err.is_guest());
}

#[test]
fn test_unsupported_backend_init_is_bound_by_address() {
    let backend = FakeLibrary::new(BACKEND_PATH)
        .executable("initialize_capi", Arc::new(AddressOnly(backend_init as usize)));
    let f = fixture(
        LoadingConfig::default(),
        FakeLoader::with_backend(backend),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    f.coordinator.ensure_backend_loaded().unwrap();
    assert_eq!(INIT_ENV.with(|c| c.get()), 0xe000);
    assert_eq!(BUILTIN_SEEN.with(|c| c.get()), 0x1007);
}

// ============================================================================
// Finalizer
// ============================================================================

/// A reset array targeting one leaked slot; returns (array, slot).
fn reset_array(initial: usize, replacement: usize) -> (usize, &'static AtomicUsize) {
    let slot: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(initial)));
    let words: &'static [usize] = Box::leak(vec![slot.as_ptr() as usize, replacement, 0].into_boxed_slice());
    (words.as_ptr() as usize, slot)
}

fn finalizing_backend() -> FakeLibrary {
    raw_backend().with(
        "get_finalize_capi_pointer_array",
        InitSymbol::Address(get_finalize_array as usize),
    )
}

#[test]
fn test_finalizer_installed_and_run_on_exit() {
    let (array, slot) = reset_array(1, 99);
    FINALIZE_ARRAY.with(|c| c.set(array));
    let f = fixture(
        LoadingConfig::default(),
        FakeLoader::with_backend(finalizing_backend()),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );

    let backend = f.coordinator.ensure_backend_loaded().unwrap();
    assert!(backend.has_finalizer());
    assert_eq!(f.hooks.len(), 1);

    f.coordinator.finalize();
    assert_eq!(slot.load(Ordering::SeqCst), 99);
    assert!(f.hooks.is_empty());
    assert!(!backend.has_finalizer());
}

#[test]
fn test_finalizer_left_to_shutdown_in_progress() {
    let (array, slot) = reset_array(1, 42);
    FINALIZE_ARRAY.with(|c| c.set(array));
    let f = fixture(
        LoadingConfig::default(),
        FakeLoader::with_backend(finalizing_backend()),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    f.coordinator.ensure_backend_loaded().unwrap();

    assert_eq!(f.hooks.run_all(), 1);
    assert_eq!(slot.load(Ordering::SeqCst), 42);
    slot.store(7, Ordering::SeqCst);

    f.coordinator.finalize();
    assert_eq!(slot.load(Ordering::SeqCst), 7);
}

#[test]
fn test_null_finalize_array_installs_nothing() {
    FINALIZE_ARRAY.with(|c| c.set(0));
    let f = fixture(
        LoadingConfig::default(),
        FakeLoader::with_backend(finalizing_backend()),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    let backend = f.coordinator.ensure_backend_loaded().unwrap();
    assert!(!backend.has_finalizer());
    assert!(f.hooks.is_empty());
}

#[test]
fn test_portable_backend_installs_no_finalizer() {
    let (array, _slot) = reset_array(1, 2);
    FINALIZE_ARRAY.with(|c| c.set(array));
    let config = LoadingConfig {
        native_modules: false,
        ..LoadingConfig::default()
    };
    let f = fixture(
        config,
        FakeLoader::with_backend(finalizing_backend()),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    assert!(!f.coordinator.ensure_backend_loaded().unwrap().has_finalizer());
}

// ============================================================================
// Extension modules
// ============================================================================

fn attribute_module(name: &str) -> (Arc<AttributeModule>, ModuleRef) {
    let module = Arc::new(AttributeModule::new(name));
    let as_ref: ModuleRef = module.clone();
    (module, as_ref)
}

#[test]
fn test_init_symbol_uses_last_name_component() {
    let f = default_fixture(FakeHost::default());
    assert_eq!(f.coordinator.init_symbol_name("pkg.sub._speedups"), "PyInit__speedups");
    assert_eq!(f.coordinator.init_symbol_name("json"), "PyInit_json");
}

#[test]
fn test_missing_init_symbol_is_import_failure() {
    let f = default_fixture(FakeHost::default());
    let library: Arc<dyn LoadedLibrary> = Arc::new(FakeLibrary::new("/ext/_csv.so"));
    let spec = ModuleSpec::new("_csv", "/ext/_csv.so");

    let err = f.coordinator.load_extension_module(library, &spec).unwrap_err();
    match err {
        BridgeError::ImportFailure { name, path, message } => {
            assert_eq!(name, "_csv");
            assert_eq!(path, "/ext/_csv.so");
            assert!(message.contains("PyInit__csv"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(f.modules.lock().is_empty());
    assert_eq!(f.modules.lock().extension_count(), 0);
}

#[test]
fn test_single_phase_module_is_stamped_and_indexed() {
    let (module, as_ref) = attribute_module("pkg.fast");
    let host = FakeHost::default().single_phase(0xd000, as_ref, 0xdef0, 3);
    let f = default_fixture(host);
    let library: Arc<dyn LoadedLibrary> = Arc::new(
        FakeLibrary::new("/ext/fast.so").executable("PyInit_fast", Fixed::new(0, FfiValue::address(0xd000))),
    );
    let spec = ModuleSpec::new("pkg.fast", "/ext/fast.so");

    let loaded = f.coordinator.load_extension_module(library, &spec).unwrap();
    assert_eq!(loaded.name(), "pkg.fast");

    let file = module.attribute(FILE_ATTRIBUTE).unwrap();
    assert_eq!(file.as_str(), Some("/ext/fast.so"));
    let library = module.attribute(LIBRARY_ATTRIBUTE).unwrap();
    assert_eq!(library.as_library().unwrap().path(), "/ext/fast.so");

    let modules = f.modules.lock();
    assert_eq!(modules.len(), 4);
    assert_eq!(modules.module_count(), 1);
    assert_eq!(modules.get(3).unwrap().name(), "pkg.fast");
    assert_eq!(modules.find_extension("/ext/fast.so", "pkg.fast"), Some(0xdef0));
    assert_eq!(*f.host.registered.lock(), vec!["pkg.fast".to_string()]);
    assert_eq!(f.coordinator.loaded_library_count(), 1);
}

#[test]
fn test_raw_module_init_is_bound_and_called() {
    let (_module, as_ref) = attribute_module("rawmod");
    let host = FakeHost::default().single_phase(0xd100, as_ref, 0xdef1, 0);
    let f = default_fixture(host);
    let library: Arc<dyn LoadedLibrary> = Arc::new(
        FakeLibrary::new("/ext/rawmod.so").with("PyInit_rawmod", InitSymbol::Address(pyinit_raw as usize)),
    );

    f.coordinator
        .load_extension_module(library, &ModuleSpec::new("rawmod", "/ext/rawmod.so"))
        .unwrap();
    assert_eq!(f.modules.lock().get(0).unwrap().name(), "rawmod");
}

#[test]
fn test_module_init_arity_is_padded() {
    let (_module, as_ref) = attribute_module("wide");
    let host = FakeHost::default().single_phase(0xd200, as_ref, 0xdef2, 1);
    let f = default_fixture(host);
    let init = Fixed::new(2, FfiValue::address(0xd200));
    let library: Arc<dyn LoadedLibrary> =
        Arc::new(FakeLibrary::new("/ext/wide.so").executable("PyInit_wide", Arc::clone(&init)));

    f.coordinator
        .load_extension_module(library, &ModuleSpec::new("wide", "/ext/wide.so"))
        .unwrap();
    let seen = init.seen.lock();
    assert_eq!(seen.last().unwrap(), &vec![FfiValue::null(), FfiValue::null()]);
}

#[test]
fn test_multi_phase_definition_goes_to_host() {
    let f = default_fixture(FakeHost::default().multi_phase(0xd300, true));
    let library: Arc<dyn LoadedLibrary> = Arc::new(
        FakeLibrary::new("/ext/multi.so").executable("PyInit_multi", Fixed::new(0, FfiValue::address(0xd300))),
    );

    let module = f
        .coordinator
        .load_extension_module(library, &ModuleSpec::new("multi", "/ext/multi.so"))
        .unwrap();
    assert_eq!(module.name(), "multi");
    assert_eq!(*f.host.built.lock(), vec![("multi".to_string(), 0xd300)]);
    assert!(f.modules.lock().is_empty());
    assert_eq!(f.coordinator.loaded_library_count(), 0);
}

#[test]
fn test_multi_phase_with_unknown_type_fails() {
    let f = default_fixture(FakeHost::default().multi_phase(0xd400, false));
    let library: Arc<dyn LoadedLibrary> = Arc::new(
        FakeLibrary::new("/ext/bad.so").executable("PyInit_bad", Fixed::new(0, FfiValue::address(0xd400))),
    );

    let err = f
        .coordinator
        .load_extension_module(library, &ModuleSpec::new("bad", "/ext/bad.so"))
        .unwrap_err();
    match err {
        BridgeError::InitializationFailure { symbol, message } => {
            assert_eq!(symbol, "PyInit_bad");
            assert!(message.contains("uninitialized object"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(f.host.built.lock().is_empty());
}

#[test]
fn test_guest_exception_from_module_init_passes_through() {
    let f = default_fixture(FakeHost::default());
    let library: Arc<dyn LoadedLibrary> = Arc::new(
        FakeLibrary::new("/ext/boom.so")
            .executable("PyInit_boom", Arc::new(Raising(GuestException::new("ImportError", "boom")))),
    );

    let err = f
        .coordinator
        .load_extension_module(library, &ModuleSpec::new("boom", "/ext/boom.so"))
        .unwrap_err();
    assert!(matches!(err, BridgeError::Guest(ref e) if e.type_name == "ImportError"));
    assert!(f.modules.lock().is_empty());
}

#[test]
fn test_rejected_result_propagates() {
    let host = FakeHost {
        reject: Some(GuestException::new("SystemError", "NULL result without error")),
        ..FakeHost::default()
    };
    let f = default_fixture(host);
    let library: Arc<dyn LoadedLibrary> = Arc::new(
        FakeLibrary::new("/ext/null.so").executable("PyInit_null", Fixed::new(0, FfiValue::null())),
    );

    let err = f
        .coordinator
        .load_extension_module(library, &ModuleSpec::new("null", "/ext/null.so"))
        .unwrap_err();
    assert!(err.is_guest());
}

#[test]
fn test_module_load_without_native_access() {
    let config = LoadingConfig {
        native_access_allowed: false,
        ..LoadingConfig::default()
    };
    let f = fixture(
        config,
        FakeLoader::with_backend(raw_backend()),
        FakeHost::default(),
        Arc::new(NativeModeClaim::new()),
    );
    let library: Arc<dyn LoadedLibrary> = Arc::new(
        FakeLibrary::new("/ext/m.so").executable("PyInit_m", Fixed::new(0, FfiValue::null())),
    );
    let err = f
        .coordinator
        .load_extension_module(library, &ModuleSpec::new("m", "/ext/m.so"))
        .unwrap_err();
    assert!(matches!(err, BridgeError::ImportFailure { .. }));
}

// ============================================================================
// Through the context
// ============================================================================

#[test]
fn test_context_imports_extension_end_to_end() {
    let (_module, as_ref) = attribute_module("ctxmod");
    let host = Arc::new(FakeHost::default().single_phase(0xd500, as_ref, 0xdef5, 2));
    let mut loader = FakeLoader::with_backend(raw_backend());
    loader.extensions.insert(
        "/ext/ctxmod.so".to_string(),
        Arc::new(
            FakeLibrary::new("/ext/ctxmod.so")
                .executable("PyInit_ctxmod", Fixed::new(0, FfiValue::address(0xd500))),
        ),
    );

    let ctx = BridgeContext::with_process_state(
        BridgeConfig::default(),
        Collaborators {
            loader: Arc::new(loader),
            builtins: Arc::new(OffsetBuiltins),
            host,
        },
        Arc::new(NativeModeClaim::new()),
        leaked_hooks(),
    );

    let module = ctx
        .import_extension(&ModuleSpec::new("ctxmod", "/ext/ctxmod.so"))
        .unwrap();
    assert_eq!(module.name(), "ctxmod");
    assert_eq!(INIT_ENV.with(|c| c.get()), ctx.environment());
    assert_eq!(ctx.modules().get(2).unwrap().name(), "ctxmod");
    assert_eq!(ctx.closures().len(), 1);
    ctx.exit();
}
