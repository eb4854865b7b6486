//! # Handle Closures
//!
//! Native function pointers that call back into managed callables.
//!
//! ## Design
//!
//! Each registration builds a libffi closure: a small executable thunk
//! whose entry point unpacks native arguments according to the parsed
//! signature, invokes the managed callable and writes its result back in
//! native form. The registry owns the thunk, so its code pointer stays
//! valid for as long as the registration exists.
//!
//! Registrations are indexed both by callable identity and by code
//! pointer. Both indices are updated under one lock, so a reader never
//! observes one without the other, and registering the same callable twice
//! hands back the pointer from the first registration.
//!
//! ## Technical References
//!
//! - [libffi closures](https://docs.rs/libffi/latest/libffi/middle/struct.ClosureOwned.html)

use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use libffi::low::ffi_cif;
use libffi::middle::ClosureOwned;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::config::LoadingConfig;
use crate::error::BridgeResult;
use crate::ffi::{FfiSignature, FfiValue};
use crate::memory::NativePointer;

/// Dialect name recorded on signatures when the alternate calling
/// convention is enabled.
pub const ALTERNATE_DIALECT: &str = "alternate";

/// A managed callable that native code can call through a closure.
pub trait ManagedCallable: Send + Sync {
    /// Invoke with arguments unpacked per the closure signature.
    fn call(&self, args: &[FfiValue]) -> FfiValue;
}

impl<F> ManagedCallable for F
where
    F: Fn(&[FfiValue]) -> FfiValue + Send + Sync,
{
    fn call(&self, args: &[FfiValue]) -> FfiValue {
        self(args)
    }
}

/// Shared handle to a managed callable; identity is the `Arc` allocation.
pub type Executable = Arc<dyn ManagedCallable>;

/// Managed object that owns a closure (e.g. a method descriptor).
pub type Delegate = Arc<dyn Any + Send + Sync>;

fn executable_key(executable: &Executable) -> usize {
    Arc::as_ptr(executable) as *const () as usize
}

struct ThunkData {
    signature: FfiSignature,
    executable: Executable,
}

unsafe extern "C" fn thunk_entry(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    data: &ThunkData,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let values: Vec<FfiValue> = data
            .signature
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| unsafe { FfiValue::read_native(*ty, *args.add(i)) })
            .collect();
        data.executable.call(&values)
    }));

    match outcome {
        Ok(value) => value.write_native(data.signature.return_type, result),
        Err(_) => {
            // Unwinding into native frames is not an option.
            error!(signature = %data.signature, "managed callable panicked inside a native callback");
            *result = 0;
        }
    }
}

/// An executable thunk owned by the registry.
struct NativeThunk {
    closure: ClosureOwned<ThunkData>,
}

impl NativeThunk {
    fn new(signature: FfiSignature, executable: Executable) -> Self {
        let cif = signature.cif();
        let closure = ClosureOwned::new(
            cif,
            thunk_entry,
            ThunkData {
                signature,
                executable,
            },
        );
        Self { closure }
    }

    fn code_pointer(&self) -> usize {
        *self.closure.code_ptr() as usize
    }
}

// Safety: the thunk and its user data are never mutated after
// construction; the wrapped callable is itself Send + Sync.
unsafe impl Send for NativeThunk {}
unsafe impl Sync for NativeThunk {}

/// One managed callable exposed as a native function pointer.
pub struct ClosureInfo {
    thunk: NativeThunk,
    signature: FfiSignature,
    delegate: Delegate,
    executable: Executable,
    pointer: usize,
}

impl ClosureInfo {
    /// The native code pointer.
    pub fn pointer(&self) -> usize {
        self.pointer
    }

    /// The parsed signature.
    pub fn signature(&self) -> &FfiSignature {
        &self.signature
    }

    /// The owning managed object.
    pub fn delegate(&self) -> &Delegate {
        &self.delegate
    }

    /// The managed callable.
    pub fn executable(&self) -> &Executable {
        &self.executable
    }
}

impl fmt::Debug for ClosureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureInfo")
            .field("pointer", &format_args!("{:#x}", self.pointer))
            .field("code", &format_args!("{:#x}", self.thunk.code_pointer()))
            .field("signature", &self.signature.to_string())
            .finish()
    }
}

#[derive(Default)]
struct ClosureIndex {
    by_executable: HashMap<usize, Arc<ClosureInfo>>,
    by_pointer: HashMap<usize, Arc<ClosureInfo>>,
}

/// Bijective registry between managed callables and native pointers.
#[derive(Default)]
pub struct HandleClosureRegistry {
    index: Mutex<ClosureIndex>,
    dialect: Option<String>,
}

impl HandleClosureRegistry {
    /// Create an empty registry using the standard calling dialect.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry per loading configuration.
    pub fn from_config(config: &LoadingConfig) -> Self {
        Self {
            index: Mutex::default(),
            dialect: config
                .alternate_calling_convention
                .then(|| ALTERNATE_DIALECT.to_string()),
        }
    }

    /// Expose `executable` as a native function pointer with the given
    /// textual signature.
    ///
    /// Registering an executable that is already registered returns its
    /// existing pointer; the signature and delegate of the first
    /// registration are kept.
    pub fn register_closure(
        &self,
        signature: &str,
        executable: Executable,
        delegate: Delegate,
    ) -> BridgeResult<usize> {
        let key = executable_key(&executable);
        let mut index = self.index.lock();
        if let Some(existing) = index.by_executable.get(&key) {
            return Ok(existing.pointer);
        }

        let mut parsed = FfiSignature::parse(signature)?;
        if parsed.dialect.is_none() {
            parsed.dialect = self.dialect.clone();
        }

        let thunk = NativeThunk::new(parsed.clone(), Arc::clone(&executable));
        let pointer = thunk.code_pointer();
        let info = Arc::new(ClosureInfo {
            thunk,
            signature: parsed,
            delegate,
            executable,
            pointer,
        });

        index.by_executable.insert(key, Arc::clone(&info));
        index.by_pointer.insert(pointer, info);
        debug!(pointer = %NativePointer::from(pointer), signature, "registered closure");
        Ok(pointer)
    }

    /// The pointer registered for `executable`.
    pub fn pointer_for(&self, executable: &Executable) -> Option<usize> {
        let index = self.index.lock();
        index
            .by_executable
            .get(&executable_key(executable))
            .map(|info| info.pointer)
    }

    /// The delegate registered behind `pointer`.
    pub fn delegate_for(&self, pointer: usize) -> Option<Delegate> {
        let index = self.index.lock();
        index
            .by_pointer
            .get(&pointer)
            .map(|info| Arc::clone(&info.delegate))
    }

    /// Full registration details for `pointer`.
    pub fn info_for_pointer(&self, pointer: usize) -> Option<Arc<ClosureInfo>> {
        self.index.lock().by_pointer.get(&pointer).cloned()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        let index = self.index.lock();
        debug_assert_eq!(index.by_executable.len(), index.by_pointer.len());
        index.by_pointer.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HandleClosureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleClosureRegistry")
            .field("closures", &self.len())
            .field("dialect", &self.dialect)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::{BoundFunction, FfiType};

    fn executable<F>(f: F) -> Executable
    where
        F: Fn(&[FfiValue]) -> FfiValue + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn delegate(name: &'static str) -> Delegate {
        Arc::new(name)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = HandleClosureRegistry::new();
        let exec = executable(|_| FfiValue::I32(0));
        let pointer = registry
            .register_closure("(SINT32):SINT32", Arc::clone(&exec), delegate("method"))
            .unwrap();

        assert_ne!(pointer, 0);
        assert_eq!(registry.pointer_for(&exec), Some(pointer));
        let owner = registry.delegate_for(pointer).unwrap();
        assert_eq!(owner.downcast_ref::<&str>(), Some(&"method"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let registry = HandleClosureRegistry::new();
        let exec = executable(|_| FfiValue::Void);
        let first = registry
            .register_closure("():VOID", Arc::clone(&exec), delegate("a"))
            .unwrap();
        let second = registry
            .register_closure("(POINTER):VOID", Arc::clone(&exec), delegate("b"))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        let info = registry.info_for_pointer(first).unwrap();
        assert!(info.signature().params.is_empty());
    }

    #[test]
    fn test_distinct_executables_get_distinct_pointers() {
        let registry = HandleClosureRegistry::new();
        let a = registry
            .register_closure("():VOID", executable(|_| FfiValue::Void), delegate("a"))
            .unwrap();
        let b = registry
            .register_closure("():VOID", executable(|_| FfiValue::Void), delegate("b"))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_lookups() {
        let registry = HandleClosureRegistry::new();
        assert!(registry.pointer_for(&executable(|_| FfiValue::Void)).is_none());
        assert!(registry.delegate_for(0x1234).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_bad_signature_registers_nothing() {
        let registry = HandleClosureRegistry::new();
        let exec = executable(|_| FfiValue::Void);
        assert!(registry
            .register_closure("(NOPE):VOID", Arc::clone(&exec), delegate("x"))
            .is_err());
        assert!(registry.pointer_for(&exec).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_closure_is_callable_from_native_code() {
        let registry = HandleClosureRegistry::new();
        let exec = executable(|args| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            FfiValue::I64(a * b)
        });
        let pointer = registry
            .register_closure("(SINT64,SINT64):SINT64", exec, delegate("mul"))
            .unwrap();

        let native = unsafe { BoundFunction::bind_text(pointer, "(SINT64,SINT64):SINT64") }.unwrap();
        let result = unsafe { native.call(&[FfiValue::I64(6), FfiValue::I64(7)]) }.unwrap();
        assert_eq!(result, FfiValue::I64(42));
    }

    #[test]
    fn test_panicking_callable_returns_zero() {
        let registry = HandleClosureRegistry::new();
        let pointer = registry
            .register_closure(
                "(SINT32):SINT32",
                executable(|_| panic!("boom")),
                delegate("panics"),
            )
            .unwrap();

        let native = unsafe { BoundFunction::bind_text(pointer, "(SINT32):SINT32") }.unwrap();
        let result = unsafe { native.call(&[FfiValue::I32(1)]) }.unwrap();
        assert_eq!(result, FfiValue::I32(0));
    }

    #[test]
    fn test_alternate_dialect_is_recorded() {
        let config = LoadingConfig {
            alternate_calling_convention: true,
            ..LoadingConfig::default()
        };
        let registry = HandleClosureRegistry::from_config(&config);
        let pointer = registry
            .register_closure("(SINT32):POINTER", executable(|_| FfiValue::null()), delegate("x"))
            .unwrap();
        let info = registry.info_for_pointer(pointer).unwrap();
        assert_eq!(info.signature().dialect.as_deref(), Some(ALTERNATE_DIALECT));
        assert_eq!(info.signature().return_type, FfiType::Pointer);
    }
}
