//! # Native Extension Bridge
//!
//! Lets a managed runtime load and run native extension modules written
//! against a C-level object ABI.
//!
//! The bridge provides:
//!
//! - **Extension Loading**: one native backend per process, single- and
//!   multi-phase module init
//! - **Call Dispatch**: typed calls into native entry points for every ABI
//!   call shape, in production, debug and trace modes
//! - **Closures**: native function pointers that call back into managed code
//! - **Memory Ledger**: allocation tracing, double-free diagnostics and
//!   native memory pressure with bounded collection retries
//! - **Thread State**: thread-specific storage keys and native locks
//!
//! ## Technical Standards
//!
//! - **Native calls**: [libffi](https://docs.rs/libffi) call interfaces
//!   and closures
//! - **Library loading**: [libloading](https://docs.rs/libloading) with
//!   `RTLD_GLOBAL` on Unix
//! - **Diagnostics**: [tracing](https://docs.rs/tracing)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        BRIDGE CONTEXT                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Loader    │  │   Dispatch   │  │   Closures   │          │
//! │  │ (loader.rs)  │  │(dispatch.rs) │  │ (closure.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Modules    │  │ Thread State │  │    Memory    │          │
//! │  │ (module.rs)  │  │(thread_state)│  │ (memory.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! │                  ffi.rs · shutdown.rs · wrappers.rs              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod closure;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod ffi;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod module;
pub mod shutdown;
pub mod thread_state;
pub mod wrappers;

// Re-exports
pub use closure::{ClosureInfo, Delegate, Executable, HandleClosureRegistry, ManagedCallable};
pub use config::{BridgeConfig, BridgeConfigBuilder, ConfigError, DiagnosticPolicy, LogFormat, LogLevel};
pub use context::BridgeContext;
pub use dispatch::{CallArg, CallMode, CallShape, DebugContext, DebugHandles, DispatchContext, NativeFunction};
pub use error::{BridgeError, BridgeResult, ConsistencyKind, GuestException};
pub use ffi::{BoundFunction, DynamicLibrary, FfiError, FfiSignature, FfiType, FfiValue};
pub use loader::{
    BackendLoader, BuiltinResolver, Collaborators, ExtensionLoadCoordinator, InitResult, InitSymbol,
    Invocable, InvokeError, LoadedLibrary, ModuleHost, ModuleSpec, NativeLibraryLoader, NativeModeClaim,
};
pub use memory::{MemoryPressure, NativeMemoryLedger, NativePointer};
pub use module::{AttributeModule, ExtensionModule, ModuleIndexTable, ModuleRef};
pub use shutdown::{NativeFinalizer, ShutdownHooks};
pub use thread_state::{LockWait, NativeLockTable, ThreadLocalSlotTable};
pub use wrappers::{PrimitiveWrapperCache, ProcWrapperCache};

/// Bridge version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a `tracing` subscriber configured from `CEXT_*` variables.
///
/// Returns `false` when a subscriber is already installed.
pub fn init_logging_from_env() -> bool {
    logging::init(&BridgeConfig::from_env().log)
}
