//! # Bridge Errors
//!
//! Error kinds surfaced by the extension bridge.
//!
//! Import and initialization failures are ordinary recoverable errors.
//! Memory-consistency problems are diagnostics: they are only returned as
//! errors when the ledger runs under [`DiagnosticPolicy::Strict`].
//! Exceptions raised by guest code travel through unchanged as
//! [`BridgeError::Guest`].
//!
//! [`DiagnosticPolicy::Strict`]: crate::config::DiagnosticPolicy::Strict

use std::fmt;

use thiserror::Error;

use crate::ffi::FfiError;
use crate::memory::NativePointer;

/// Result type used throughout the bridge.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors produced by the extension bridge.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// An extension or the backend could not be imported.
    #[error("cannot import '{name}' from '{path}': {message}")]
    ImportFailure {
        /// Extension (or backend) name.
        name: String,
        /// Path of the loadable unit.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// An init entrypoint ran but failed.
    #[error("initialization through '{symbol}' failed: {message}")]
    InitializationFailure {
        /// The entrypoint that was invoked.
        symbol: String,
        /// What went wrong.
        message: String,
    },

    /// Ledger inconsistency reported under the strict diagnostic policy.
    #[error("native memory inconsistency at {pointer}: {kind}")]
    MemoryConsistency {
        /// The address involved.
        pointer: NativePointer,
        /// Which inconsistency was detected.
        kind: ConsistencyKind,
    },

    /// Native memory could not be reserved after all collection retries.
    #[error("native memory exhausted: {requested} bytes requested with {allocated} of {ceiling} bytes in use after {retries} collection rounds")]
    OutOfMemory {
        /// Bytes requested.
        requested: u64,
        /// Bytes accounted when the last retry gave up.
        allocated: u64,
        /// Configured ceiling.
        ceiling: u64,
        /// Collection rounds attempted.
        retries: u32,
    },

    /// A broken internal invariant (unknown shape tag, bad argument kind).
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    /// Native marshaling or symbol resolution failure.
    #[error(transparent)]
    Ffi(#[from] FfiError),

    /// An exception raised by guest code, propagated unwrapped.
    #[error(transparent)]
    Guest(#[from] GuestException),
}

impl BridgeError {
    /// Create an import failure.
    pub fn import(
        name: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        BridgeError::ImportFailure {
            name: name.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an initialization failure.
    pub fn initialization(symbol: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::InitializationFailure {
            symbol: symbol.into(),
            message: message.into(),
        }
    }

    /// Create an internal consistency error.
    pub fn internal(message: impl Into<String>) -> Self {
        BridgeError::InternalConsistency(message.into())
    }

    /// Whether this error is a guest exception passing through.
    pub fn is_guest(&self) -> bool {
        matches!(self, BridgeError::Guest(_))
    }
}

/// Kind of ledger inconsistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsistencyKind {
    /// The address was freed twice.
    DoubleFree,
    /// The address was freed but its allocation was never traced.
    UntrackedFree,
    /// The address was accessed after it was freed.
    InvalidAccess,
}

impl fmt::Display for ConsistencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConsistencyKind::DoubleFree => "double free",
            ConsistencyKind::UntrackedFree => "free of untracked memory",
            ConsistencyKind::InvalidAccess => "access to freed memory",
        };
        f.write_str(text)
    }
}

/// An exception raised by guest code.
///
/// The bridge never inspects or rewraps these; they are produced by host
/// collaborators and handed back to the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{type_name}: {message}")]
pub struct GuestException {
    /// Exception type name as the guest reports it.
    pub type_name: String,
    /// Exception message.
    pub message: String,
}

impl GuestException {
    /// Create a guest exception.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::FfiErrorKind;

    #[test]
    fn test_import_failure_display() {
        let err = BridgeError::import("_sqlite", "/lib/_sqlite.so", "no init function");
        let text = err.to_string();
        assert!(text.contains("_sqlite"));
        assert!(text.contains("/lib/_sqlite.so"));
        assert!(text.contains("no init function"));
    }

    #[test]
    fn test_guest_passthrough_display() {
        let err: BridgeError = GuestException::new("ValueError", "bad value").into();
        assert!(err.is_guest());
        assert_eq!(err.to_string(), "ValueError: bad value");
    }

    #[test]
    fn test_ffi_error_conversion() {
        let err: BridgeError = FfiError::new(FfiErrorKind::SymbolNotFound, "missing").into();
        assert!(matches!(err, BridgeError::Ffi(_)));
        assert!(!err.is_guest());
    }

    #[test]
    fn test_memory_consistency_display() {
        let err = BridgeError::MemoryConsistency {
            pointer: NativePointer::new(0x1000),
            kind: ConsistencyKind::DoubleFree,
        };
        assert_eq!(
            err.to_string(),
            "native memory inconsistency at 0x1000: double free"
        );
    }
}
