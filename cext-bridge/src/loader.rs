//! # Extension Loading
//!
//! Brings up the native backend once per context and initializes extension
//! modules from loaded libraries.
//!
//! ## Design
//!
//! The process can host at most one backend in native form. The first
//! context to claim [`NativeModeClaim`] wins; later contexts fall back to
//! the portable form and a single warning is logged for the whole process.
//!
//! Init entrypoints are tolerated in three shapes:
//!
//! - an executable symbol, invoked directly;
//! - a raw address, bound to a textual signature and called through libffi;
//! - an executable that reports a larger arity, retried with the missing
//!   arguments filled with null pointers.
//!
//! Extension init results come in two flavors. A single-phase result is a
//! fully realized module that gets stamped, registered and indexed here. A
//! multi-phase result is a definition handed to the host's module builder.
//!
//! ```text
//!   import_extension(spec)
//!     ├─ ensure_backend_loaded()  ── claim ─ load ─ init ─ finalizer
//!     ├─ BackendLoader::load_*    (extension library)
//!     └─ load_extension_module()  ── init symbol ─ check ─ single/multi phase
//! ```

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::closure::{Delegate, Executable, HandleClosureRegistry};
use crate::config::LoadingConfig;
use crate::error::{BridgeError, BridgeResult, GuestException};
use crate::ffi::{BoundFunction, DynamicLibrary, FfiValue};
use crate::memory::NativePointer;
use crate::module::{
    ExtensionKey, ModuleAttribute, ModuleIndexTable, ModuleRef, FILE_ATTRIBUTE, LIBRARY_ATTRIBUTE,
};
use crate::shutdown::{shutdown_hooks, HookId, NativeFinalizer, ShutdownError, ShutdownHooks};

/// Signature of a raw backend init entrypoint.
pub const BACKEND_INIT_SIGNATURE: &str = "(ENV,(SINT32):POINTER):VOID";

/// Signature of the builtin lookup closure handed to the backend.
pub const BUILTIN_LOOKUP_SIGNATURE: &str = "(SINT32):POINTER";

/// Signature of a raw extension init entrypoint.
pub const MODULE_INIT_SIGNATURE: &str = "():POINTER";

/// Signature of the optional finalize entrypoint.
pub const FINALIZE_SIGNATURE: &str = "():POINTER";

const NATIVE_ACCESS_NOT_ALLOWED: &str = "native access is not allowed";

// ============================================================================
// Collaborators
// ============================================================================

/// Failure modes of [`Invocable::invoke`].
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// The symbol cannot be invoked directly.
    #[error("symbol is not executable")]
    Unsupported,
    /// The symbol expects a different number of arguments.
    #[error("expected {expected} arguments")]
    Arity {
        /// Arguments the symbol expects.
        expected: usize,
    },
    /// Guest code raised an exception.
    #[error(transparent)]
    Guest(#[from] GuestException),
    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

/// A symbol that can be invoked without going through libffi.
pub trait Invocable: Send + Sync {
    /// Invoke with the given arguments.
    fn invoke(&self, args: &[FfiValue]) -> Result<FfiValue, InvokeError>;

    /// Native address to bind when direct invocation is unsupported.
    fn address(&self) -> Option<usize> {
        None
    }
}

/// A symbol resolved from a loaded library.
#[derive(Clone)]
pub enum InitSymbol {
    /// Directly invocable.
    Executable(Arc<dyn Invocable>),
    /// A raw native function address.
    Address(usize),
}

impl fmt::Debug for InitSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitSymbol::Executable(_) => f.write_str("Executable"),
            InitSymbol::Address(addr) => write!(f, "Address({})", NativePointer::from(*addr)),
        }
    }
}

/// A loaded backend or extension library.
pub trait LoadedLibrary: Send + Sync {
    /// Path the library was loaded from.
    fn path(&self) -> &str;

    /// Resolve an exported symbol.
    fn lookup(&self, symbol: &str) -> Option<InitSymbol>;
}

impl LoadedLibrary for DynamicLibrary {
    fn path(&self) -> &str {
        self.name()
    }

    fn lookup(&self, symbol: &str) -> Option<InitSymbol> {
        self.symbol_address(symbol).ok().map(InitSymbol::Address)
    }
}

/// Loads libraries in native or portable form.
pub trait BackendLoader: Send + Sync {
    /// Load a library as native code.
    fn load_native(&self, path: &Path) -> BridgeResult<Arc<dyn LoadedLibrary>>;

    /// Load a library in the portable execution form.
    fn load_portable(&self, path: &Path) -> BridgeResult<Arc<dyn LoadedLibrary>>;
}

/// Loads libraries with the platform dynamic loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLibraryLoader;

impl BackendLoader for NativeLibraryLoader {
    fn load_native(&self, path: &Path) -> BridgeResult<Arc<dyn LoadedLibrary>> {
        // SAFETY: loading runs library constructors; backend and extension
        // libraries are trusted by whoever configured their paths.
        let library = unsafe { DynamicLibrary::load(path)? };
        Ok(Arc::new(library))
    }

    fn load_portable(&self, path: &Path) -> BridgeResult<Arc<dyn LoadedLibrary>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Err(BridgeError::import(
            name,
            path.display().to_string(),
            "portable execution is not available with the platform loader",
        ))
    }
}

/// Resolves builtin ids requested by the backend during init.
pub trait BuiltinResolver: Send + Sync {
    /// Native address of builtin `id`, or 0 if unknown.
    fn resolve(&self, id: i32) -> usize;
}

/// An extension init result in managed form.
#[derive(Clone)]
pub enum InitResult {
    /// A fully realized module (single-phase init).
    Module {
        /// The module object.
        module: ModuleRef,
        /// Its native module definition.
        definition: usize,
    },
    /// A module definition to be built (multi-phase init).
    Definition {
        /// The native definition.
        pointer: usize,
        /// Whether the definition's type is discoverable.
        type_known: bool,
    },
}

/// The managed side of module initialization.
pub trait ModuleHost: Send + Sync {
    /// Validate an init result; errors (usually guest exceptions) abort
    /// the load.
    fn check_result(&self, symbol: &str, result: &FfiValue) -> BridgeResult<()>;

    /// Convert an init result to managed form.
    fn to_managed(&self, result: &FfiValue) -> BridgeResult<InitResult>;

    /// Read the module index stored in a native module definition.
    fn read_module_index(&self, definition: usize) -> BridgeResult<usize>;

    /// Publish a module under its fully qualified name.
    fn register_module(&self, name: &str, module: ModuleRef);

    /// Build a module from a multi-phase definition.
    fn create_from_definition(
        &self,
        spec: &ModuleSpec,
        definition: usize,
        library: Arc<dyn LoadedLibrary>,
    ) -> BridgeResult<ModuleRef>;
}

/// Collaborators the coordinator delegates to.
#[derive(Clone)]
pub struct Collaborators {
    /// Library loading.
    pub loader: Arc<dyn BackendLoader>,
    /// Builtin lookup during backend init.
    pub builtins: Arc<dyn BuiltinResolver>,
    /// Module object handling.
    pub host: Arc<dyn ModuleHost>,
}

/// Name and path of an extension to import.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleSpec {
    /// Fully qualified module name.
    pub name: String,
    /// Path of the extension library.
    pub path: String,
}

impl ModuleSpec {
    /// Create a spec.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

// ============================================================================
// Native mode claim
// ============================================================================

/// Process-wide "native backend in use" flag.
#[derive(Debug, Default)]
pub struct NativeModeClaim {
    claimed: AtomicBool,
    warned: AtomicBool,
}

static GLOBAL_CLAIM: OnceLock<Arc<NativeModeClaim>> = OnceLock::new();

impl NativeModeClaim {
    /// Create an unclaimed instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance.
    pub fn global() -> Arc<NativeModeClaim> {
        Arc::clone(GLOBAL_CLAIM.get_or_init(|| Arc::new(NativeModeClaim::new())))
    }

    /// Claim native mode; exactly one caller ever gets `true`.
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether native mode has been claimed.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Returns `true` exactly once; callers log the fallback warning then.
    pub fn warn_fallback_once(&self) -> bool {
        self.warned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ============================================================================
// Backend
// ============================================================================

struct InstalledFinalizer {
    hook: HookId,
    finalizer: Arc<NativeFinalizer>,
}

/// A loaded and initialized backend.
pub struct Backend {
    library: Arc<dyn LoadedLibrary>,
    native: bool,
    builtin_lookup: usize,
    finalizer: Mutex<Option<InstalledFinalizer>>,
}

impl Backend {
    /// The backend library.
    pub fn library(&self) -> &Arc<dyn LoadedLibrary> {
        &self.library
    }

    /// Whether the backend runs as native code.
    pub fn is_native(&self) -> bool {
        self.native
    }

    /// Native pointer of the builtin lookup closure.
    pub fn builtin_lookup(&self) -> usize {
        self.builtin_lookup
    }

    /// Whether a shutdown finalizer is installed.
    pub fn has_finalizer(&self) -> bool {
        self.finalizer.lock().is_some()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("path", &self.library.path())
            .field("native", &self.native)
            .field("builtin_lookup", &NativePointer::from(self.builtin_lookup))
            .finish()
    }
}

/// Invoke, retrying once with null padding when more arguments are expected.
fn invoke_tolerant(target: &dyn Invocable, args: &[FfiValue]) -> Result<FfiValue, InvokeError> {
    match target.invoke(args) {
        Err(InvokeError::Arity { expected }) if expected > args.len() => {
            let mut padded = args.to_vec();
            padded.resize(expected, FfiValue::null());
            target.invoke(&padded)
        }
        other => other,
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Per-context backend and extension loading.
pub struct ExtensionLoadCoordinator {
    config: LoadingConfig,
    collaborators: Collaborators,
    closures: Arc<HandleClosureRegistry>,
    modules: Arc<Mutex<ModuleIndexTable>>,
    claim: Arc<NativeModeClaim>,
    hooks: &'static ShutdownHooks,
    environment: usize,
    backend: Mutex<Option<Arc<Backend>>>,
    /// Libraries of single-phase modules, kept mapped for the context.
    loaded_libraries: Mutex<Vec<Arc<dyn LoadedLibrary>>>,
}

impl ExtensionLoadCoordinator {
    /// Create a coordinator using the process-wide claim and shutdown hooks.
    pub fn new(
        config: LoadingConfig,
        collaborators: Collaborators,
        closures: Arc<HandleClosureRegistry>,
        modules: Arc<Mutex<ModuleIndexTable>>,
    ) -> Self {
        Self {
            config,
            collaborators,
            closures,
            modules,
            claim: NativeModeClaim::global(),
            hooks: shutdown_hooks(),
            environment: 0,
            backend: Mutex::new(None),
            loaded_libraries: Mutex::new(Vec::new()),
        }
    }

    /// Use a specific native mode claim.
    pub fn with_claim(mut self, claim: Arc<NativeModeClaim>) -> Self {
        self.claim = claim;
        self
    }

    /// Use a specific shutdown hook list.
    pub fn with_shutdown_hooks(mut self, hooks: &'static ShutdownHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Environment pointer passed to raw backend init entrypoints.
    pub fn with_environment(mut self, environment: usize) -> Self {
        self.environment = environment;
        self
    }

    /// The loading configuration.
    pub fn config(&self) -> &LoadingConfig {
        &self.config
    }

    /// The backend, if loaded.
    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.backend.lock().clone()
    }

    /// Number of libraries kept alive by single-phase modules.
    pub fn loaded_library_count(&self) -> usize {
        self.loaded_libraries.lock().len()
    }

    /// Init symbol for an extension: the configured prefix plus the last
    /// dotted component of its name.
    pub fn init_symbol_name(&self, module_name: &str) -> String {
        let short = module_name.rsplit('.').next().unwrap_or(module_name);
        format!("{}{}", self.config.module_init_prefix, short)
    }

    fn native_access_denied(&self) -> bool {
        // A managed build of the backend needs no native access.
        !self.config.native_access_allowed && !self.config.backend_library.contains("managed")
    }

    /// Load and initialize the backend unless this context already did.
    pub fn ensure_backend_loaded(&self) -> BridgeResult<Arc<Backend>> {
        let mut slot = self.backend.lock();
        if let Some(backend) = slot.as_ref() {
            return Ok(Arc::clone(backend));
        }

        let path = self.config.backend_path();
        let backend = self
            .load_backend(&path)
            .map_err(|e| self.normalize_backend_error(&path, e))?;
        let backend = Arc::new(backend);
        *slot = Some(Arc::clone(&backend));
        Ok(backend)
    }

    fn normalize_backend_error(&self, path: &Path, error: BridgeError) -> BridgeError {
        if error.is_guest() {
            return error;
        }
        if self.native_access_denied() {
            return BridgeError::import(
                self.config.backend_library.clone(),
                path.display().to_string(),
                NATIVE_ACCESS_NOT_ALLOWED,
            );
        }
        BridgeError::initialization(self.config.backend_init_symbol.clone(), error.to_string())
    }

    fn claim_native_mode(&self) -> bool {
        if !self.config.native_modules {
            return false;
        }
        if self.claim.try_claim() {
            return true;
        }
        if self.claim.warn_fallback_once() {
            warn!(
                "native modules are enabled, but only one context per process can use them; \
                 this and later contexts use the portable backend"
            );
        }
        false
    }

    fn load_backend(&self, path: &Path) -> BridgeResult<Backend> {
        let native = self.claim_native_mode();
        info!(
            path = %path.display(),
            mode = if native { "native" } else { "portable" },
            "loading extension backend"
        );
        let library = if native {
            self.collaborators.loader.load_native(path)?
        } else {
            self.collaborators.loader.load_portable(path)?
        };

        let builtin_lookup = self.register_builtin_lookup()?;
        let symbol = &self.config.backend_init_symbol;
        let init = library.lookup(symbol).ok_or_else(|| {
            BridgeError::initialization(
                symbol.clone(),
                format!("symbol not found in '{}'", library.path()),
            )
        })?;
        self.invoke_backend_init(init, builtin_lookup)?;
        debug!(symbol = %symbol, "backend initialized");

        let finalizer = if native && self.config.install_native_finalizer {
            self.install_finalizer(&*library)
        } else {
            None
        };

        Ok(Backend {
            library,
            native,
            builtin_lookup,
            finalizer: Mutex::new(finalizer),
        })
    }

    fn register_builtin_lookup(&self) -> BridgeResult<usize> {
        let builtins = Arc::clone(&self.collaborators.builtins);
        let lookup: Executable = Arc::new(move |args: &[FfiValue]| -> FfiValue {
            match args.first().and_then(FfiValue::as_i32) {
                Some(id) => FfiValue::address(builtins.resolve(id)),
                None => FfiValue::null(),
            }
        });
        let delegate: Delegate = Arc::new("builtin lookup");
        self.closures
            .register_closure(BUILTIN_LOOKUP_SIGNATURE, lookup, delegate)
    }

    fn invoke_backend_init(&self, init: InitSymbol, builtin_lookup: usize) -> BridgeResult<()> {
        let address = match init {
            InitSymbol::Executable(target) => {
                let args = [FfiValue::null(), FfiValue::address(builtin_lookup)];
                match invoke_tolerant(&*target, &args) {
                    Ok(_) => return Ok(()),
                    Err(InvokeError::Unsupported) => target
                        .address()
                        .ok_or_else(|| BridgeError::internal("init symbol is neither executable nor an address"))?,
                    Err(InvokeError::Guest(e)) => return Err(e.into()),
                    Err(e) => return Err(BridgeError::internal(e.to_string())),
                }
            }
            InitSymbol::Address(address) => address,
        };

        // SAFETY: the backend exports its init entrypoint with this prototype.
        let bound = unsafe { BoundFunction::bind_text(address, BACKEND_INIT_SIGNATURE)? };
        let args = [
            FfiValue::address(self.environment),
            FfiValue::address(builtin_lookup),
        ];
        unsafe { bound.call(&args)? };
        Ok(())
    }

    fn install_finalizer(&self, library: &dyn LoadedLibrary) -> Option<InstalledFinalizer> {
        let symbol = &self.config.finalize_symbol;
        let array = match library.lookup(symbol) {
            Some(InitSymbol::Executable(target)) => target.invoke(&[]).map_err(|e| e.to_string()),
            Some(InitSymbol::Address(address)) => {
                // SAFETY: the finalize entrypoint takes nothing and returns the array.
                unsafe { BoundFunction::bind_text(address, FINALIZE_SIGNATURE) }
                    .and_then(|bound| unsafe { bound.call(&[]) })
                    .map_err(|e| e.to_string())
            }
            None => {
                debug!(symbol = %symbol, "backend exports no finalizer");
                return None;
            }
        };

        let array = match array.map(|value| value.as_address().unwrap_or(0)) {
            Ok(0) => return None,
            Ok(array) => array,
            Err(message) => {
                warn!(symbol = %symbol, %message, "could not read the native finalizer array");
                return None;
            }
        };

        // SAFETY: the backend guarantees the array layout and that the
        // slots it names outlive the process.
        let finalizer = Arc::new(unsafe { NativeFinalizer::new(array) });
        match self.hooks.register(Arc::clone(&finalizer)) {
            Ok(hook) => Some(InstalledFinalizer { hook, finalizer }),
            Err(e) => {
                warn!(error = %e, "didn't register a native finalizer");
                None
            }
        }
    }

    /// Load an extension library with the backend's loader and initialize
    /// the module it defines.
    pub fn import_extension(&self, spec: &ModuleSpec) -> BridgeResult<ModuleRef> {
        let backend = self.ensure_backend_loaded()?;
        let path = Path::new(&spec.path);
        let loader = &self.collaborators.loader;
        let library = if backend.is_native() {
            loader.load_native(path)
        } else {
            loader.load_portable(path)
        }
        .map_err(|e| match e {
            BridgeError::ImportFailure { .. } | BridgeError::Guest(_) => e,
            other => BridgeError::import(spec.name.clone(), spec.path.clone(), other.to_string()),
        })?;
        self.load_extension_module(library, spec)
    }

    /// Initialize the extension module `spec` from `library`.
    pub fn load_extension_module(
        &self,
        library: Arc<dyn LoadedLibrary>,
        spec: &ModuleSpec,
    ) -> BridgeResult<ModuleRef> {
        let import_failure =
            |message: String| BridgeError::import(spec.name.clone(), spec.path.clone(), message);

        if self.native_access_denied() {
            return Err(import_failure(NATIVE_ACCESS_NOT_ALLOWED.to_string()));
        }

        let symbol = self.init_symbol_name(&spec.name);
        let init = library
            .lookup(&symbol)
            .ok_or_else(|| import_failure(format!("no function {} found in {}", symbol, spec.path)))?;
        let result = self.call_module_init(init, &symbol, &import_failure)?;

        let host = &self.collaborators.host;
        host.check_result(&symbol, &result)?;
        match host.to_managed(&result)? {
            InitResult::Module { module, definition } => {
                self.install_single_phase(module, definition, library, spec)
            }
            InitResult::Definition {
                pointer,
                type_known,
            } => {
                if !type_known {
                    return Err(BridgeError::initialization(
                        symbol.clone(),
                        format!("init function {} returned an uninitialized object", symbol),
                    ));
                }
                host.create_from_definition(spec, pointer, library)
            }
        }
    }

    fn call_module_init(
        &self,
        init: InitSymbol,
        symbol: &str,
        import_failure: &dyn Fn(String) -> BridgeError,
    ) -> BridgeResult<FfiValue> {
        let address = match init {
            InitSymbol::Executable(target) => match invoke_tolerant(&*target, &[]) {
                Ok(result) => return Ok(result),
                Err(InvokeError::Unsupported) => target.address().ok_or_else(|| {
                    import_failure(format!("init function {} is not executable", symbol))
                })?,
                Err(InvokeError::Guest(e)) => return Err(e.into()),
                Err(e @ InvokeError::Arity { .. }) => return Err(import_failure(e.to_string())),
                Err(InvokeError::Failed(message)) => {
                    return Err(BridgeError::initialization(symbol.to_string(), message))
                }
            },
            InitSymbol::Address(address) => address,
        };

        // SAFETY: extension init entrypoints take nothing and return a pointer.
        let bound = unsafe { BoundFunction::bind_text(address, MODULE_INIT_SIGNATURE) }
            .map_err(|e| import_failure(e.to_string()))?;
        unsafe { bound.call(&[]) }.map_err(|e| import_failure(e.to_string()))
    }

    fn install_single_phase(
        &self,
        module: ModuleRef,
        definition: usize,
        library: Arc<dyn LoadedLibrary>,
        spec: &ModuleSpec,
    ) -> BridgeResult<ModuleRef> {
        let host = &self.collaborators.host;
        let index = host.read_module_index(definition)?;

        module.set_attribute(FILE_ATTRIBUTE, ModuleAttribute::Str(spec.path.clone()));
        module.set_attribute(LIBRARY_ATTRIBUTE, ModuleAttribute::Library(Arc::clone(&library)));
        self.loaded_libraries.lock().push(library);
        host.register_module(&spec.name, Arc::clone(&module));

        let mut modules = self.modules.lock();
        modules.insert(index, Arc::clone(&module));
        modules.record_extension(ExtensionKey::new(spec.path.clone(), spec.name.clone()), definition);
        debug!(name = %spec.name, index, "single-phase extension module loaded");
        Ok(module)
    }

    /// Context exit: unregister the shutdown finalizer and run it now.
    pub fn finalize(&self) {
        let Some(backend) = self.backend() else {
            return;
        };
        let Some(installed) = backend.finalizer.lock().take() else {
            return;
        };
        match self.hooks.remove(installed.hook) {
            Ok(_) => {
                installed.finalizer.run();
            }
            Err(ShutdownError::InProgress) => {
                debug!("process shutdown in progress; native finalizer left to the exit handler");
            }
            Err(e) => {
                warn!(error = %e, "native finalizer was not registered");
                installed.finalizer.run();
            }
        }
    }
}

impl fmt::Debug for ExtensionLoadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionLoadCoordinator")
            .field("backend", &self.backend.lock().as_ref().map(|b| b.library.path().to_string()))
            .field("loaded_libraries", &self.loaded_library_count())
            .finish_non_exhaustive()
    }
}
