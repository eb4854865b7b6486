//! # Foreign Function Interface (FFI)
//!
//! Native signatures, dynamic libraries and bound native calls.
//!
//! ## Design
//!
//! - Dynamic library loading via libloading, with globally visible symbols
//!   so that extensions can link against the backend
//! - Textual signatures in the `(SINT32,POINTER):VOID` notation, with an
//!   optional `with <dialect>` prefix selecting an alternate calling dialect
//! - Bound calls through a libffi call interface built from the signature
//!
//! ## Technical References
//!
//! - [libloading](https://docs.rs/libloading)
//! - [libffi](https://docs.rs/libffi)
//! - [Rustonomicon FFI](https://doc.rust-lang.org/nomicon/ffi.html)

use std::ffi::{c_void, CStr, CString};
use std::fmt;
use std::os::raw::c_char;
use std::path::Path;

use libffi::middle::{Arg, Cif, CodePtr, Type};
use libloading::{Library, Symbol};

/// FFI error.
#[derive(Debug, Clone)]
pub struct FfiError {
    /// Error kind.
    pub kind: FfiErrorKind,
    /// Error message.
    pub message: String,
}

impl FfiError {
    /// Create a new FFI error.
    pub fn new(kind: FfiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for FfiError {}

/// FFI error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorKind {
    /// Library not found.
    LibraryNotFound,
    /// Symbol not found.
    SymbolNotFound,
    /// Type mismatch during marshaling.
    TypeMismatch,
    /// Null pointer.
    NullPointer,
    /// Invalid UTF-8 string.
    InvalidUtf8,
    /// Malformed textual signature.
    InvalidSignature,
}

/// FFI type for argument/return marshaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfiType {
    /// Void (no value).
    Void,
    /// 8-bit signed integer.
    I8,
    /// 16-bit signed integer.
    I16,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 8-bit unsigned integer.
    U8,
    /// 16-bit unsigned integer.
    U16,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit unsigned integer.
    U64,
    /// 32-bit floating point.
    F32,
    /// 64-bit floating point.
    F64,
    /// Pointer (void*).
    Pointer,
    /// C string (char*).
    CString,
    /// Size type (usize).
    Size,
}

impl FfiType {
    /// Get the size of this type in bytes.
    pub fn size(&self) -> usize {
        match self {
            FfiType::Void => 0,
            FfiType::I8 | FfiType::U8 => 1,
            FfiType::I16 | FfiType::U16 => 2,
            FfiType::I32 | FfiType::U32 | FfiType::F32 => 4,
            FfiType::I64 | FfiType::U64 | FfiType::F64 => 8,
            FfiType::Pointer | FfiType::CString | FfiType::Size => std::mem::size_of::<usize>(),
        }
    }

    /// Get the alignment of this type.
    pub fn alignment(&self) -> usize {
        self.size().max(1)
    }

    /// Whether values of this type travel in integer registers.
    pub fn is_integral(&self) -> bool {
        !matches!(self, FfiType::Void | FfiType::F32 | FfiType::F64)
    }

    /// Look up a type by its signature name.
    pub fn from_signature_name(name: &str) -> Option<Self> {
        match name {
            "VOID" => Some(FfiType::Void),
            "SINT8" => Some(FfiType::I8),
            "SINT16" => Some(FfiType::I16),
            "SINT32" => Some(FfiType::I32),
            "SINT64" => Some(FfiType::I64),
            "UINT8" => Some(FfiType::U8),
            "UINT16" => Some(FfiType::U16),
            "UINT32" => Some(FfiType::U32),
            "UINT64" => Some(FfiType::U64),
            "FLOAT" => Some(FfiType::F32),
            "DOUBLE" => Some(FfiType::F64),
            "POINTER" | "ENV" | "OBJECT" => Some(FfiType::Pointer),
            "STRING" => Some(FfiType::CString),
            "SIZE_T" => Some(FfiType::Size),
            _ => None,
        }
    }

    /// The libffi type descriptor for this type.
    pub fn to_libffi(&self) -> Type {
        match self {
            FfiType::Void => Type::void(),
            FfiType::I8 => Type::i8(),
            FfiType::I16 => Type::i16(),
            FfiType::I32 => Type::i32(),
            FfiType::I64 => Type::i64(),
            FfiType::U8 => Type::u8(),
            FfiType::U16 => Type::u16(),
            FfiType::U32 => Type::u32(),
            FfiType::U64 => Type::u64(),
            FfiType::F32 => Type::f32(),
            FfiType::F64 => Type::f64(),
            FfiType::Pointer | FfiType::CString => Type::pointer(),
            FfiType::Size => Type::usize(),
        }
    }
}

/// FFI value for passing to/from foreign functions.
#[derive(Debug, Clone, PartialEq)]
pub enum FfiValue {
    /// Void (no value).
    Void,
    /// 8-bit signed integer.
    I8(i8),
    /// 16-bit signed integer.
    I16(i16),
    /// 32-bit signed integer.
    I32(i32),
    /// 64-bit signed integer.
    I64(i64),
    /// 8-bit unsigned integer.
    U8(u8),
    /// 16-bit unsigned integer.
    U16(u16),
    /// 32-bit unsigned integer.
    U32(u32),
    /// 64-bit unsigned integer.
    U64(u64),
    /// 32-bit floating point.
    F32(f32),
    /// 64-bit floating point.
    F64(f64),
    /// Raw pointer.
    Pointer(*mut c_void),
    /// String value (owned).
    String(String),
    /// Size.
    Size(usize),
}

impl FfiValue {
    /// A null pointer value.
    pub fn null() -> Self {
        FfiValue::Pointer(std::ptr::null_mut())
    }

    /// A pointer value from a raw address.
    pub fn address(addr: usize) -> Self {
        FfiValue::Pointer(addr as *mut c_void)
    }

    /// Get the type of this value.
    pub fn ffi_type(&self) -> FfiType {
        match self {
            FfiValue::Void => FfiType::Void,
            FfiValue::I8(_) => FfiType::I8,
            FfiValue::I16(_) => FfiType::I16,
            FfiValue::I32(_) => FfiType::I32,
            FfiValue::I64(_) => FfiType::I64,
            FfiValue::U8(_) => FfiType::U8,
            FfiValue::U16(_) => FfiType::U16,
            FfiValue::U32(_) => FfiType::U32,
            FfiValue::U64(_) => FfiType::U64,
            FfiValue::F32(_) => FfiType::F32,
            FfiValue::F64(_) => FfiType::F64,
            FfiValue::Pointer(_) => FfiType::Pointer,
            FfiValue::String(_) => FfiType::CString,
            FfiValue::Size(_) => FfiType::Size,
        }
    }

    /// Try to convert to i32.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            FfiValue::I8(v) => Some(*v as i32),
            FfiValue::I16(v) => Some(*v as i32),
            FfiValue::I32(v) => Some(*v),
            FfiValue::U8(v) => Some(*v as i32),
            FfiValue::U16(v) => Some(*v as i32),
            _ => None,
        }
    }

    /// Try to convert to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FfiValue::I8(v) => Some(*v as i64),
            FfiValue::I16(v) => Some(*v as i64),
            FfiValue::I32(v) => Some(*v as i64),
            FfiValue::I64(v) => Some(*v),
            FfiValue::U8(v) => Some(*v as i64),
            FfiValue::U16(v) => Some(*v as i64),
            FfiValue::U32(v) => Some(*v as i64),
            FfiValue::U64(v) => Some(*v as i64),
            FfiValue::Size(v) => Some(*v as i64),
            FfiValue::Pointer(p) => Some(*p as usize as i64),
            _ => None,
        }
    }

    /// Try to convert to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FfiValue::F32(v) => Some(*v as f64),
            FfiValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to convert to pointer.
    pub fn as_pointer(&self) -> Option<*mut c_void> {
        match self {
            FfiValue::Pointer(p) => Some(*p),
            _ => None,
        }
    }

    /// Try to read this value as a raw address.
    ///
    /// Pointers and unsigned sizes qualify; `Void` reads as null.
    pub fn as_address(&self) -> Option<usize> {
        match self {
            FfiValue::Void => Some(0),
            FfiValue::Pointer(p) => Some(*p as usize),
            FfiValue::Size(v) => Some(*v),
            FfiValue::U64(v) => usize::try_from(*v).ok(),
            FfiValue::I64(v) => usize::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Read a native argument of type `ty` stored at `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must point to a live value of type `ty`, as libffi hands to
    /// closure callbacks. `CString` arguments must be null or point to a
    /// null-terminated string.
    pub unsafe fn read_native(ty: FfiType, slot: *const c_void) -> FfiValue {
        match ty {
            FfiType::Void => FfiValue::Void,
            FfiType::I8 => FfiValue::I8(*(slot as *const i8)),
            FfiType::I16 => FfiValue::I16(*(slot as *const i16)),
            FfiType::I32 => FfiValue::I32(*(slot as *const i32)),
            FfiType::I64 => FfiValue::I64(*(slot as *const i64)),
            FfiType::U8 => FfiValue::U8(*(slot as *const u8)),
            FfiType::U16 => FfiValue::U16(*(slot as *const u16)),
            FfiType::U32 => FfiValue::U32(*(slot as *const u32)),
            FfiType::U64 => FfiValue::U64(*(slot as *const u64)),
            FfiType::F32 => FfiValue::F32(*(slot as *const f32)),
            FfiType::F64 => FfiValue::F64(*(slot as *const f64)),
            FfiType::Pointer => FfiValue::Pointer(*(slot as *const *mut c_void)),
            FfiType::Size => FfiValue::Size(*(slot as *const usize)),
            FfiType::CString => {
                let ptr = *(slot as *const *const c_char);
                match from_cstring(ptr) {
                    Ok(s) => FfiValue::String(s),
                    Err(_) => FfiValue::Pointer(ptr as *mut c_void),
                }
            }
        }
    }

    /// Write this value as a native return of type `ty` into a libffi
    /// return slot.
    ///
    /// Integral results are widened to the full slot. Values that do not
    /// fit the declared type are written as zero.
    ///
    /// # Safety
    ///
    /// `slot` must be a libffi return buffer (at least `u64` sized and
    /// aligned).
    pub unsafe fn write_native(&self, ty: FfiType, slot: *mut u64) {
        match ty {
            FfiType::Void => {}
            FfiType::F32 => *(slot as *mut f32) = self.as_f64().unwrap_or(0.0) as f32,
            FfiType::F64 => *(slot as *mut f64) = self.as_f64().unwrap_or(0.0),
            _ => *slot = widen_integral(ty, self.as_i64().unwrap_or(0)),
        }
    }
}

/// Sign- or zero-extend an integral value of `ty` to a full return slot.
fn widen_integral(ty: FfiType, value: i64) -> u64 {
    match ty {
        FfiType::I8 => value as i8 as i64 as u64,
        FfiType::I16 => value as i16 as i64 as u64,
        FfiType::I32 => value as i32 as i64 as u64,
        FfiType::U8 => value as u8 as u64,
        FfiType::U16 => value as u16 as u64,
        FfiType::U32 => value as u32 as u64,
        _ => value as u64,
    }
}

/// Narrow a raw integral return slot to a value of `ty`.
fn narrow_integral(ty: FfiType, raw: u64) -> FfiValue {
    match ty {
        FfiType::I8 => FfiValue::I8(raw as i8),
        FfiType::I16 => FfiValue::I16(raw as i16),
        FfiType::I32 => FfiValue::I32(raw as i32),
        FfiType::I64 => FfiValue::I64(raw as i64),
        FfiType::U8 => FfiValue::U8(raw as u8),
        FfiType::U16 => FfiValue::U16(raw as u16),
        FfiType::U32 => FfiValue::U32(raw as u32),
        FfiType::U64 => FfiValue::U64(raw),
        FfiType::Size => FfiValue::Size(raw as usize),
        FfiType::Pointer | FfiType::CString => FfiValue::Pointer(raw as usize as *mut c_void),
        FfiType::Void | FfiType::F32 | FfiType::F64 => FfiValue::Void,
    }
}

// Safety: FfiValue contains raw pointers but they are only used within
// the FFI context where the caller is responsible for safety.
unsafe impl Send for FfiValue {}
unsafe impl Sync for FfiValue {}

/// Foreign function signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfiSignature {
    /// Parameter types.
    pub params: Vec<FfiType>,
    /// Return type.
    pub return_type: FfiType,
    /// Calling dialect named by a `with <dialect>` prefix, if any.
    pub dialect: Option<String>,
}

impl FfiSignature {
    /// Create a new signature.
    pub fn new(params: Vec<FfiType>, return_type: FfiType) -> Self {
        Self {
            params,
            return_type,
            dialect: None,
        }
    }

    /// Parse a textual signature such as `(SINT32,POINTER):VOID`.
    ///
    /// Nested function types, e.g. the second parameter of
    /// `(ENV,(SINT32):POINTER):VOID`, are passed as pointers. A leading
    /// `with <dialect>` selects a calling dialect.
    pub fn parse(text: &str) -> FfiResult<Self> {
        let mut rest = text.trim();
        let mut dialect = None;

        if let Some(after) = rest.strip_prefix("with ") {
            let after = after.trim_start();
            let end = after
                .find(|c: char| c.is_whitespace() || c == '(')
                .ok_or_else(|| invalid_signature(text, "dialect without a signature"))?;
            dialect = Some(after[..end].to_string());
            rest = after[end..].trim_start();
        }

        let mut parser = SignatureParser {
            text,
            bytes: rest.as_bytes(),
            pos: 0,
        };
        let (params, return_type) = parser.function()?;
        parser.skip_whitespace();
        if parser.pos != parser.bytes.len() {
            return Err(invalid_signature(text, "trailing characters"));
        }

        Ok(Self {
            params,
            return_type,
            dialect,
        })
    }

    /// The same signature in the given calling dialect.
    pub fn with_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.dialect = Some(dialect.into());
        self
    }

    /// Build the libffi call interface for this signature.
    pub fn cif(&self) -> Cif {
        Cif::new(
            self.params.iter().map(FfiType::to_libffi),
            self.return_type.to_libffi(),
        )
    }
}

impl fmt::Display for FfiSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dialect) = &self.dialect {
            write!(f, "with {} ", dialect)?;
        }
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(signature_name(*param))?;
        }
        write!(f, "):{}", signature_name(self.return_type))
    }
}

fn signature_name(ty: FfiType) -> &'static str {
    match ty {
        FfiType::Void => "VOID",
        FfiType::I8 => "SINT8",
        FfiType::I16 => "SINT16",
        FfiType::I32 => "SINT32",
        FfiType::I64 => "SINT64",
        FfiType::U8 => "UINT8",
        FfiType::U16 => "UINT16",
        FfiType::U32 => "UINT32",
        FfiType::U64 => "UINT64",
        FfiType::F32 => "FLOAT",
        FfiType::F64 => "DOUBLE",
        FfiType::Pointer => "POINTER",
        FfiType::CString => "STRING",
        FfiType::Size => "SIZE_T",
    }
}

fn invalid_signature(text: &str, reason: &str) -> FfiError {
    FfiError::new(
        FfiErrorKind::InvalidSignature,
        format!("invalid signature '{}': {}", text, reason),
    )
}

/// Recursive-descent parser over the signature grammar:
///
/// ```text
/// function := '(' [type (',' type)*] ')' ':' type
/// type     := NAME | function
/// ```
struct SignatureParser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl SignatureParser<'_> {
    fn skip_whitespace(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, byte: u8) -> bool {
        self.skip_whitespace();
        if self.bytes.get(self.pos) == Some(&byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> FfiResult<()> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(invalid_signature(
                self.text,
                &format!("expected '{}' at offset {}", byte as char, self.pos),
            ))
        }
    }

    fn function(&mut self) -> FfiResult<(Vec<FfiType>, FfiType)> {
        self.expect(b'(')?;
        let mut params = Vec::new();
        if !self.eat(b')') {
            loop {
                let param = self.type_ref()?;
                if param == FfiType::Void {
                    return Err(invalid_signature(self.text, "VOID parameter"));
                }
                params.push(param);
                if self.eat(b',') {
                    continue;
                }
                self.expect(b')')?;
                break;
            }
        }
        self.expect(b':')?;
        let return_type = self.type_ref()?;
        Ok((params, return_type))
    }

    fn type_ref(&mut self) -> FfiResult<FfiType> {
        self.skip_whitespace();
        if self.bytes.get(self.pos) == Some(&b'(') {
            self.function()?;
            return Ok(FfiType::Pointer);
        }

        let start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        // The scanned range is ASCII, so it is a valid str boundary.
        let name = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or_default();
        if name.is_empty() {
            return Err(invalid_signature(
                self.text,
                &format!("expected a type at offset {}", start),
            ));
        }
        FfiType::from_signature_name(&name.to_ascii_uppercase())
            .ok_or_else(|| invalid_signature(self.text, &format!("unknown type '{}'", name)))
    }
}

/// Handle to a loaded dynamic library.
pub struct DynamicLibrary {
    /// The library name/path.
    name: String,
    /// The loaded library.
    library: Library,
}

impl DynamicLibrary {
    /// Load a dynamic library with its symbols visible to libraries loaded
    /// later.
    ///
    /// # Safety
    ///
    /// Loading a library can execute initialization code. The caller must
    /// ensure the library is trusted.
    pub unsafe fn load(path: impl AsRef<Path>) -> Result<Self, FfiError> {
        let path = path.as_ref();
        let library = open_global(path).map_err(|e| {
            FfiError::new(
                FfiErrorKind::LibraryNotFound,
                format!("failed to load library '{}': {}", path.display(), e),
            )
        })?;

        Ok(Self {
            name: path.display().to_string(),
            library,
        })
    }

    /// Get the library name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a symbol from the library.
    ///
    /// # Safety
    ///
    /// The caller must ensure the symbol has the correct type signature.
    pub unsafe fn get_symbol<T>(&self, name: &str) -> Result<Symbol<'_, T>, FfiError> {
        let cname = to_cstring(name)?;

        self.library.get(cname.as_bytes_with_nul()).map_err(|e| {
            FfiError::new(
                FfiErrorKind::SymbolNotFound,
                format!("symbol '{}' not found: {}", name, e),
            )
        })
    }

    /// Get the address of a symbol.
    pub fn symbol_address(&self, name: &str) -> Result<usize, FfiError> {
        // Reading the symbol as a data pointer yields its address without
        // calling through it.
        let symbol = unsafe { self.get_symbol::<*const c_void>(name)? };
        let address = *symbol as usize;
        if address == 0 {
            return Err(FfiError::new(
                FfiErrorKind::NullPointer,
                format!("symbol '{}' resolved to null", name),
            ));
        }
        Ok(address)
    }

    /// Check if a symbol exists.
    pub fn has_symbol(&self, name: &str) -> bool {
        self.symbol_address(name).is_ok()
    }
}

impl fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(unix)]
unsafe fn open_global(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
    UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL).map(Library::from)
}

#[cfg(not(unix))]
unsafe fn open_global(path: &Path) -> Result<Library, libloading::Error> {
    Library::new(path)
}

/// A native function pointer bound to a signature.
///
/// Binding is the step that makes a raw address callable from managed
/// code: arguments are marshaled according to the signature and the call
/// goes through a prepared libffi call interface.
pub struct BoundFunction {
    pointer: usize,
    signature: FfiSignature,
    cif: Cif,
}

impl BoundFunction {
    /// Bind a function pointer to a signature.
    ///
    /// # Safety
    ///
    /// `pointer` must be the address of a function whose native prototype
    /// matches `signature` and which stays mapped while this value lives.
    pub unsafe fn bind(pointer: usize, signature: FfiSignature) -> FfiResult<Self> {
        if pointer == 0 {
            return Err(FfiError::new(
                FfiErrorKind::NullPointer,
                format!("cannot bind null function to {}", signature),
            ));
        }
        let cif = signature.cif();
        Ok(Self {
            pointer,
            signature,
            cif,
        })
    }

    /// Parse `signature` and bind `pointer` to it.
    ///
    /// # Safety
    ///
    /// See [`BoundFunction::bind`].
    pub unsafe fn bind_text(pointer: usize, signature: &str) -> FfiResult<Self> {
        Self::bind(pointer, FfiSignature::parse(signature)?)
    }

    /// The bound address.
    pub fn pointer(&self) -> usize {
        self.pointer
    }

    /// The bound signature.
    pub fn signature(&self) -> &FfiSignature {
        &self.signature
    }

    /// Call the function.
    ///
    /// # Safety
    ///
    /// The native function may do anything; pointer arguments must satisfy
    /// whatever contract it has.
    pub unsafe fn call(&self, args: &[FfiValue]) -> FfiResult<FfiValue> {
        if args.len() != self.signature.params.len() {
            return Err(FfiError::new(
                FfiErrorKind::TypeMismatch,
                format!(
                    "{} expects {} arguments, got {}",
                    self.signature,
                    self.signature.params.len(),
                    args.len()
                ),
            ));
        }

        let mut strings = Vec::new();
        let mut slots = Vec::with_capacity(args.len());
        for (value, ty) in args.iter().zip(&self.signature.params) {
            slots.push(ArgSlot::coerce(value, *ty, &mut strings)?);
        }
        let ffi_args: Vec<Arg> = slots.iter().map(ArgSlot::as_arg).collect();

        let code = CodePtr::from_ptr(self.pointer as *const c_void);
        // Integral results come back widened to a full slot.
        let result = match self.signature.return_type {
            FfiType::Void => {
                self.cif.call::<u64>(code, &ffi_args);
                FfiValue::Void
            }
            FfiType::F32 => FfiValue::F32(self.cif.call::<f32>(code, &ffi_args)),
            FfiType::F64 => FfiValue::F64(self.cif.call::<f64>(code, &ffi_args)),
            ty => narrow_integral(ty, self.cif.call::<u64>(code, &ffi_args)),
        };
        Ok(result)
    }
}

impl fmt::Debug for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFunction")
            .field("pointer", &format_args!("{:#x}", self.pointer))
            .field("signature", &self.signature.to_string())
            .finish()
    }
}

/// Argument storage whose addresses are handed to libffi.
enum ArgSlot {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(*const c_void),
    Size(usize),
}

impl ArgSlot {
    fn coerce(value: &FfiValue, ty: FfiType, strings: &mut Vec<CString>) -> FfiResult<Self> {
        let mismatch = || {
            FfiError::new(
                FfiErrorKind::TypeMismatch,
                format!("cannot pass {:?} as {:?}", value, ty),
            )
        };

        let slot = match ty {
            FfiType::Void => return Err(mismatch()),
            FfiType::F32 => ArgSlot::F32(value.as_f64().ok_or_else(mismatch)? as f32),
            FfiType::F64 => ArgSlot::F64(value.as_f64().ok_or_else(mismatch)?),
            FfiType::Pointer => ArgSlot::Pointer(value.as_address().ok_or_else(mismatch)? as *const c_void),
            FfiType::Size => ArgSlot::Size(value.as_address().ok_or_else(mismatch)?),
            FfiType::CString => match value {
                FfiValue::String(s) => {
                    let owned = to_cstring(s)?;
                    let ptr = owned.as_ptr() as *const c_void;
                    // The CString's heap buffer does not move when the
                    // CString itself is moved into the vector.
                    strings.push(owned);
                    ArgSlot::Pointer(ptr)
                }
                other => ArgSlot::Pointer(other.as_address().ok_or_else(mismatch)? as *const c_void),
            },
            integral => {
                let v = value.as_i64().ok_or_else(mismatch)?;
                match integral {
                    FfiType::I8 => ArgSlot::I8(v as i8),
                    FfiType::I16 => ArgSlot::I16(v as i16),
                    FfiType::I32 => ArgSlot::I32(v as i32),
                    FfiType::U8 => ArgSlot::U8(v as u8),
                    FfiType::U16 => ArgSlot::U16(v as u16),
                    FfiType::U32 => ArgSlot::U32(v as u32),
                    FfiType::U64 => ArgSlot::U64(v as u64),
                    _ => ArgSlot::I64(v),
                }
            }
        };
        Ok(slot)
    }

    fn as_arg(&self) -> Arg {
        match self {
            ArgSlot::I8(v) => Arg::new(v),
            ArgSlot::I16(v) => Arg::new(v),
            ArgSlot::I32(v) => Arg::new(v),
            ArgSlot::I64(v) => Arg::new(v),
            ArgSlot::U8(v) => Arg::new(v),
            ArgSlot::U16(v) => Arg::new(v),
            ArgSlot::U32(v) => Arg::new(v),
            ArgSlot::U64(v) => Arg::new(v),
            ArgSlot::F32(v) => Arg::new(v),
            ArgSlot::F64(v) => Arg::new(v),
            ArgSlot::Pointer(v) => Arg::new(v),
            ArgSlot::Size(v) => Arg::new(v),
        }
    }
}

/// Type alias for FFI result.
pub type FfiResult<T> = Result<T, FfiError>;

// ============================================================================
// Helper functions
// ============================================================================

/// Convert a Rust string to a C string.
pub fn to_cstring(s: &str) -> FfiResult<CString> {
    CString::new(s).map_err(|_| {
        FfiError::new(FfiErrorKind::InvalidUtf8, "string contains null byte")
    })
}

/// Convert a C string to a Rust string.
///
/// # Safety
///
/// The pointer must point to a valid null-terminated C string.
pub unsafe fn from_cstring(ptr: *const c_char) -> FfiResult<String> {
    if ptr.is_null() {
        return Err(FfiError::new(FfiErrorKind::NullPointer, "null pointer"));
    }

    CStr::from_ptr(ptr)
        .to_str()
        .map(|s| s.to_string())
        .map_err(|_| FfiError::new(FfiErrorKind::InvalidUtf8, "invalid UTF-8 string"))
}

// ============================================================================
// Tests
// ============================================================================
