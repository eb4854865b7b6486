//! # ABI Call Dispatch
//!
//! Invokes native entry points of extensions through the fixed catalogue
//! of call shapes defined by the extension ABI.
//!
//! ## Design
//!
//! The ABI contract lives in one static table, [`SHAPES`], indexed by the
//! numeric shape tag: parameter kinds, return kind, whether the runtime
//! context is passed first, and the trampoline that performs the typed
//! native call. Instrumentation modes do not get their own tables.
//! A mode only decides two things before the shared trampoline runs:
//!
//! 1. which context pointer is passed (runtime context for production and
//!    trace, debug context for debug);
//! 2. how handle arguments are converted (debug mode wraps each handle for
//!    the duration of the call).
//!
//! Pointer, size and int arguments pass through untouched in every mode,
//! and raw results are returned unmodified (void shapes yield 0).
//!
//! ```text
//!   NativeFunction ──► ShapeDescriptor (cached) ──► trampoline ──► native
//!         ▲                                             ▲
//!         └── CallMode ──► context + handle conversion ─┘
//! ```
//!
//! Shape tags are append-only: new shapes get the next free tag.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::{BridgeError, BridgeResult};
use crate::memory::NativePointer;

/// Most parameters any shape takes, context excluded.
pub const MAX_PARAMS: usize = 4;

/// Number of call shapes.
pub const SHAPE_COUNT: usize = 37;

/// The native call shapes of the extension ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum CallShape {
    ModuleInit = 0,
    ModuleCreate = 1,
    Noargs = 2,
    O = 3,
    Varargs = 4,
    Keywords = 5,
    Unaryfunc = 6,
    Binaryfunc = 7,
    Ternaryfunc = 8,
    Inquiry = 9,
    Lenfunc = 10,
    Ssizeargfunc = 11,
    Ssizessizeargfunc = 12,
    Ssizeobjargproc = 13,
    Ssizessizeobjargproc = 14,
    Objobjargproc = 15,
    Freefunc = 16,
    Getattrfunc = 17,
    Getattrofunc = 18,
    Setattrfunc = 19,
    Setattrofunc = 20,
    Reprfunc = 21,
    Hashfunc = 22,
    Richcmpfunc = 23,
    Getiterfunc = 24,
    Iternextfunc = 25,
    Descrgetfunc = 26,
    Descrsetfunc = 27,
    Initproc = 28,
    Getter = 29,
    Setter = 30,
    Objobjproc = 31,
    Getbufferproc = 32,
    Releasebufferproc = 33,
    Traverseproc = 34,
    Destroyfunc = 35,
    Destructor = 36,
}

impl CallShape {
    /// Every shape, in tag order.
    pub const ALL: [CallShape; SHAPE_COUNT] = [
        CallShape::ModuleInit,
        CallShape::ModuleCreate,
        CallShape::Noargs,
        CallShape::O,
        CallShape::Varargs,
        CallShape::Keywords,
        CallShape::Unaryfunc,
        CallShape::Binaryfunc,
        CallShape::Ternaryfunc,
        CallShape::Inquiry,
        CallShape::Lenfunc,
        CallShape::Ssizeargfunc,
        CallShape::Ssizessizeargfunc,
        CallShape::Ssizeobjargproc,
        CallShape::Ssizessizeobjargproc,
        CallShape::Objobjargproc,
        CallShape::Freefunc,
        CallShape::Getattrfunc,
        CallShape::Getattrofunc,
        CallShape::Setattrfunc,
        CallShape::Setattrofunc,
        CallShape::Reprfunc,
        CallShape::Hashfunc,
        CallShape::Richcmpfunc,
        CallShape::Getiterfunc,
        CallShape::Iternextfunc,
        CallShape::Descrgetfunc,
        CallShape::Descrsetfunc,
        CallShape::Initproc,
        CallShape::Getter,
        CallShape::Setter,
        CallShape::Objobjproc,
        CallShape::Getbufferproc,
        CallShape::Releasebufferproc,
        CallShape::Traverseproc,
        CallShape::Destroyfunc,
        CallShape::Destructor,
    ];

    /// Look up a shape by its numeric tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// The numeric tag.
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// The ABI description of this shape.
    pub fn descriptor(self) -> &'static ShapeDescriptor {
        &SHAPES[self as usize]
    }

    /// The ABI name of this shape.
    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of a native parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// An object handle (`intptr_t`-sized).
    Handle,
    /// An untyped pointer.
    Pointer,
    /// A signed size.
    Size,
    /// A C `int`.
    Int,
}

/// Kind of a native return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// An object handle.
    Handle,
    /// An untyped pointer.
    Pointer,
    /// A signed size.
    Size,
    /// A C `int`, sign-extended.
    Int,
    /// Nothing; dispatch yields 0.
    Void,
}

/// Arguments after context selection and conversion.
#[derive(Debug, Clone, Copy)]
pub struct NativeArgs {
    ctx: usize,
    values: [i64; MAX_PARAMS],
}

type Trampoline = unsafe fn(usize, &NativeArgs) -> i64;

/// ABI description of one call shape.
pub struct ShapeDescriptor {
    /// The shape.
    pub shape: CallShape,
    /// ABI name.
    pub name: &'static str,
    /// Whether the context pointer is passed as the first native argument.
    pub takes_context: bool,
    /// Parameter kinds, context excluded.
    pub params: &'static [ArgKind],
    /// Return kind.
    pub returns: ReturnKind,
    trampoline: Trampoline,
}

impl fmt::Debug for ShapeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeDescriptor")
            .field("shape", &self.shape)
            .field("takes_context", &self.takes_context)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish()
    }
}

const H: ArgKind = ArgKind::Handle;
const P: ArgKind = ArgKind::Pointer;
const S: ArgKind = ArgKind::Size;
const I: ArgKind = ArgKind::Int;

const fn shape(
    shape: CallShape,
    name: &'static str,
    takes_context: bool,
    params: &'static [ArgKind],
    returns: ReturnKind,
    trampoline: Trampoline,
) -> ShapeDescriptor {
    ShapeDescriptor {
        shape,
        name,
        takes_context,
        params,
        returns,
        trampoline,
    }
}

/// The shape table, indexed by tag.
pub static SHAPES: [ShapeDescriptor; SHAPE_COUNT] = {
    use trampolines::*;
    use CallShape as C;
    use ReturnKind as R;
    [
        shape(C::ModuleInit, "module_init", false, &[], R::Pointer, none_to_p),
        shape(C::ModuleCreate, "module_create", true, &[H], R::Handle, ctx_h_to_h),
        shape(C::Noargs, "noargs", true, &[H], R::Handle, ctx_h_to_h),
        shape(C::O, "o", true, &[H, H], R::Handle, ctx_hh_to_h),
        shape(C::Varargs, "varargs", true, &[H, P, S], R::Handle, ctx_hps_to_h),
        shape(C::Keywords, "keywords", true, &[H, P, S, H], R::Handle, ctx_hpsh_to_h),
        shape(C::Unaryfunc, "unaryfunc", true, &[H], R::Handle, ctx_h_to_h),
        shape(C::Binaryfunc, "binaryfunc", true, &[H, H], R::Handle, ctx_hh_to_h),
        shape(C::Ternaryfunc, "ternaryfunc", true, &[H, H, H], R::Handle, ctx_hhh_to_h),
        shape(C::Inquiry, "inquiry", true, &[H], R::Int, ctx_h_to_i),
        shape(C::Lenfunc, "lenfunc", true, &[H], R::Size, ctx_h_to_s),
        shape(C::Ssizeargfunc, "ssizeargfunc", true, &[H, S], R::Handle, ctx_hs_to_h),
        shape(C::Ssizessizeargfunc, "ssizessizeargfunc", true, &[H, S, S], R::Handle, ctx_hss_to_h),
        shape(C::Ssizeobjargproc, "ssizeobjargproc", true, &[H, S, H], R::Int, ctx_hsh_to_i),
        shape(C::Ssizessizeobjargproc, "ssizessizeobjargproc", true, &[H, S, S, H], R::Int, ctx_hssh_to_i),
        shape(C::Objobjargproc, "objobjargproc", true, &[H, H, H], R::Int, ctx_hhh_to_i),
        shape(C::Freefunc, "freefunc", true, &[P], R::Void, ctx_p_to_void),
        shape(C::Getattrfunc, "getattrfunc", true, &[H, P], R::Handle, ctx_hp_to_h),
        shape(C::Getattrofunc, "getattrofunc", true, &[H, H], R::Handle, ctx_hh_to_h),
        shape(C::Setattrfunc, "setattrfunc", true, &[H, P, H], R::Int, ctx_hph_to_i),
        shape(C::Setattrofunc, "setattrofunc", true, &[H, H, H], R::Int, ctx_hhh_to_i),
        shape(C::Reprfunc, "reprfunc", true, &[H], R::Handle, ctx_h_to_h),
        shape(C::Hashfunc, "hashfunc", true, &[H], R::Size, ctx_h_to_s),
        shape(C::Richcmpfunc, "richcmpfunc", true, &[H, H, I], R::Handle, ctx_hhi_to_h),
        shape(C::Getiterfunc, "getiterfunc", true, &[H], R::Handle, ctx_h_to_h),
        shape(C::Iternextfunc, "iternextfunc", true, &[H], R::Handle, ctx_h_to_h),
        shape(C::Descrgetfunc, "descrgetfunc", true, &[H, H, H], R::Handle, ctx_hhh_to_h),
        shape(C::Descrsetfunc, "descrsetfunc", true, &[H, H, H], R::Int, ctx_hhh_to_i),
        shape(C::Initproc, "initproc", true, &[H, P, S, H], R::Int, ctx_hpsh_to_i),
        shape(C::Getter, "getter", true, &[H, P], R::Handle, ctx_hp_to_h),
        shape(C::Setter, "setter", true, &[H, H, P], R::Int, ctx_hhp_to_i),
        shape(C::Objobjproc, "objobjproc", true, &[H, H], R::Int, ctx_hh_to_i),
        shape(C::Getbufferproc, "getbufferproc", true, &[H, P, I], R::Int, ctx_hpi_to_i),
        shape(C::Releasebufferproc, "releasebufferproc", true, &[H, P], R::Void, ctx_hp_to_void),
        shape(C::Traverseproc, "traverseproc", true, &[P, P], R::Int, ctx_pp_to_i),
        shape(C::Destroyfunc, "destroyfunc", false, &[P], R::Void, p_to_void),
        shape(C::Destructor, "destructor", true, &[H], R::Void, ctx_h_to_void),
    ]
};

/// One trampoline per distinct native prototype.
///
/// Names spell the prototype: `ctx` for the leading context pointer, then
/// one letter per parameter (`h` handle, `p` pointer, `s` size, `i` int),
/// then the return kind.
mod trampolines {
    use std::os::raw::c_int;

    use super::NativeArgs;

    type Ctx = usize;
    type H = isize;
    type P = usize;
    type S = isize;
    type I = c_int;

    macro_rules! native {
        ($f:expr, fn($($ty:ty),*) -> $ret:ty) => {
            std::mem::transmute::<usize, unsafe extern "C" fn($($ty),*) -> $ret>($f)
        };
    }

    impl NativeArgs {
        fn h(&self, i: usize) -> H {
            self.values[i] as H
        }
        fn p(&self, i: usize) -> P {
            self.values[i] as P
        }
        fn s(&self, i: usize) -> S {
            self.values[i] as S
        }
        fn i(&self, i: usize) -> I {
            self.values[i] as I
        }
    }

    pub(super) unsafe fn none_to_p(f: usize, _: &NativeArgs) -> i64 {
        native!(f, fn() -> P)() as i64
    }

    pub(super) unsafe fn ctx_h_to_h(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H) -> H)(a.ctx, a.h(0)) as i64
    }

    pub(super) unsafe fn ctx_hh_to_h(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, H) -> H)(a.ctx, a.h(0), a.h(1)) as i64
    }

    pub(super) unsafe fn ctx_hhh_to_h(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, H, H) -> H)(a.ctx, a.h(0), a.h(1), a.h(2)) as i64
    }

    pub(super) unsafe fn ctx_hps_to_h(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, P, S) -> H)(a.ctx, a.h(0), a.p(1), a.s(2)) as i64
    }

    pub(super) unsafe fn ctx_hpsh_to_h(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, P, S, H) -> H)(a.ctx, a.h(0), a.p(1), a.s(2), a.h(3)) as i64
    }

    pub(super) unsafe fn ctx_h_to_i(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H) -> I)(a.ctx, a.h(0)) as i64
    }

    pub(super) unsafe fn ctx_h_to_s(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H) -> S)(a.ctx, a.h(0)) as i64
    }

    pub(super) unsafe fn ctx_hs_to_h(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, S) -> H)(a.ctx, a.h(0), a.s(1)) as i64
    }

    pub(super) unsafe fn ctx_hss_to_h(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, S, S) -> H)(a.ctx, a.h(0), a.s(1), a.s(2)) as i64
    }

    pub(super) unsafe fn ctx_hsh_to_i(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, S, H) -> I)(a.ctx, a.h(0), a.s(1), a.h(2)) as i64
    }

    pub(super) unsafe fn ctx_hssh_to_i(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, S, S, H) -> I)(a.ctx, a.h(0), a.s(1), a.s(2), a.h(3)) as i64
    }

    pub(super) unsafe fn ctx_hhh_to_i(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, H, H) -> I)(a.ctx, a.h(0), a.h(1), a.h(2)) as i64
    }

    pub(super) unsafe fn ctx_p_to_void(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, P) -> ())(a.ctx, a.p(0));
        0
    }

    pub(super) unsafe fn ctx_hp_to_h(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, P) -> H)(a.ctx, a.h(0), a.p(1)) as i64
    }

    pub(super) unsafe fn ctx_hph_to_i(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, P, H) -> I)(a.ctx, a.h(0), a.p(1), a.h(2)) as i64
    }

    pub(super) unsafe fn ctx_hhi_to_h(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, H, I) -> H)(a.ctx, a.h(0), a.h(1), a.i(2)) as i64
    }

    pub(super) unsafe fn ctx_hpsh_to_i(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, P, S, H) -> I)(a.ctx, a.h(0), a.p(1), a.s(2), a.h(3)) as i64
    }

    pub(super) unsafe fn ctx_hhp_to_i(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, H, P) -> I)(a.ctx, a.h(0), a.h(1), a.p(2)) as i64
    }

    pub(super) unsafe fn ctx_hh_to_i(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, H) -> I)(a.ctx, a.h(0), a.h(1)) as i64
    }

    pub(super) unsafe fn ctx_hpi_to_i(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, P, I) -> I)(a.ctx, a.h(0), a.p(1), a.i(2)) as i64
    }

    pub(super) unsafe fn ctx_hp_to_void(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H, P) -> ())(a.ctx, a.h(0), a.p(1));
        0
    }

    pub(super) unsafe fn ctx_pp_to_i(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, P, P) -> I)(a.ctx, a.p(0), a.p(1)) as i64
    }

    pub(super) unsafe fn p_to_void(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(P) -> ())(a.p(0));
        0
    }

    pub(super) unsafe fn ctx_h_to_void(f: usize, a: &NativeArgs) -> i64 {
        native!(f, fn(Ctx, H) -> ())(a.ctx, a.h(0));
        0
    }
}

// ============================================================================
// Modes
// ============================================================================

/// Instrumentation mode of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallMode {
    /// Plain calls with the runtime context.
    #[default]
    Production,
    /// Calls with the debug context; handle arguments are wrapped.
    Debug,
    /// Production calls that also emit a trace event per call.
    Trace,
}

/// Bookkeeping for handles passed to native code in debug mode.
pub trait DebugHandles: Send + Sync {
    /// Wrap `handle` for one call; returns the handle native code sees.
    fn open(&self, handle: i64) -> i64;

    /// Release a handle returned by [`open`](Self::open).
    fn close(&self, debug_handle: i64);
}

/// The debug context of a dispatching thread.
#[derive(Clone)]
pub struct DebugContext {
    pointer: usize,
    handles: Arc<dyn DebugHandles>,
}

impl DebugContext {
    /// Create a debug context.
    pub fn new(pointer: usize, handles: Arc<dyn DebugHandles>) -> Self {
        Self { pointer, handles }
    }

    /// The native debug context pointer.
    pub fn pointer(&self) -> usize {
        self.pointer
    }
}

impl fmt::Debug for DebugContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DebugContext({:#x})", self.pointer)
    }
}

/// Context pointers available to a dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    runtime: usize,
    debug: Option<DebugContext>,
}

impl DispatchContext {
    /// A context with only the runtime context pointer.
    pub fn new(runtime: usize) -> Self {
        Self {
            runtime,
            debug: None,
        }
    }

    /// Attach a debug context.
    pub fn with_debug(mut self, debug: DebugContext) -> Self {
        self.debug = Some(debug);
        self
    }

    /// The runtime context pointer.
    pub fn runtime(&self) -> usize {
        self.runtime
    }

    /// The debug context, if any.
    pub fn debug(&self) -> Option<&DebugContext> {
        self.debug.as_ref()
    }
}

/// A managed-side argument to a native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg {
    /// An object handle.
    Handle(i64),
    /// An untyped pointer.
    Pointer(usize),
    /// A signed size.
    Size(isize),
    /// A C `int`.
    Int(i32),
}

impl CallArg {
    fn kind(&self) -> ArgKind {
        match self {
            CallArg::Handle(_) => ArgKind::Handle,
            CallArg::Pointer(_) => ArgKind::Pointer,
            CallArg::Size(_) => ArgKind::Size,
            CallArg::Int(_) => ArgKind::Int,
        }
    }
}

/// Context selection and handle conversion for one call.
struct ModeAdapter<'a> {
    mode: CallMode,
    context: usize,
    debug_handles: Option<&'a dyn DebugHandles>,
    opened: [i64; MAX_PARAMS],
    open_count: usize,
}

impl<'a> ModeAdapter<'a> {
    /// # Panics
    ///
    /// Panics in debug mode when no non-null debug context is available.
    fn new(mode: CallMode, context: &'a DispatchContext) -> Self {
        let (pointer, debug_handles) = match mode {
            CallMode::Production | CallMode::Trace => (context.runtime, None),
            CallMode::Debug => match context.debug.as_ref().filter(|d| d.pointer != 0) {
                Some(debug) => (debug.pointer, Some(&*debug.handles)),
                None => panic!("debug-mode dispatch without a debug context"),
            },
        };
        Self {
            mode,
            context: pointer,
            debug_handles,
            opened: [0; MAX_PARAMS],
            open_count: 0,
        }
    }

    fn convert(&mut self, arg: CallArg) -> i64 {
        match arg {
            CallArg::Handle(h) => match self.debug_handles {
                Some(handles) => {
                    let wrapped = handles.open(h);
                    self.opened[self.open_count] = wrapped;
                    self.open_count += 1;
                    wrapped
                }
                None => h,
            },
            CallArg::Pointer(p) => p as i64,
            CallArg::Size(s) => s as i64,
            CallArg::Int(i) => i as i64,
        }
    }
}

impl Drop for ModeAdapter<'_> {
    fn drop(&mut self) {
        if let Some(handles) = self.debug_handles {
            for &wrapped in &self.opened[..self.open_count] {
                handles.close(wrapped);
            }
        }
    }
}

// ============================================================================
// Native functions
// ============================================================================

/// A native entry point with a resolved call shape.
#[derive(Clone, Copy)]
pub struct NativeFunction {
    pointer: usize,
    descriptor: &'static ShapeDescriptor,
}

impl NativeFunction {
    /// Pair a function pointer with its shape.
    pub fn new(pointer: usize, shape: CallShape) -> Self {
        Self {
            pointer,
            descriptor: shape.descriptor(),
        }
    }

    /// Pair a function pointer with a shape given by numeric tag.
    pub fn from_tag(pointer: usize, tag: u32) -> BridgeResult<Self> {
        let shape = CallShape::from_tag(tag)
            .ok_or_else(|| BridgeError::internal(format!("unknown call shape tag {}", tag)))?;
        Ok(Self::new(pointer, shape))
    }

    /// The function pointer.
    pub fn pointer(&self) -> usize {
        self.pointer
    }

    /// The call shape.
    pub fn shape(&self) -> CallShape {
        self.descriptor.shape
    }

    /// Call the native function.
    ///
    /// `args` excludes the context; it must match the shape's parameter
    /// kinds exactly.
    ///
    /// # Safety
    ///
    /// The pointer must be a live native function whose prototype is the
    /// one described by the shape.
    ///
    /// # Panics
    ///
    /// Panics in [`CallMode::Debug`] when `context` carries no debug
    /// context or a null one.
    pub unsafe fn call(
        &self,
        mode: CallMode,
        context: &DispatchContext,
        args: &[CallArg],
    ) -> BridgeResult<i64> {
        let descriptor = self.descriptor;
        if args.len() != descriptor.params.len() {
            return Err(BridgeError::internal(format!(
                "{} takes {} arguments, got {}",
                descriptor.name,
                descriptor.params.len(),
                args.len()
            )));
        }

        let mut adapter = ModeAdapter::new(mode, context);
        let mut values = [0i64; MAX_PARAMS];
        for (position, (arg, kind)) in args.iter().zip(descriptor.params).enumerate() {
            if arg.kind() != *kind {
                return Err(BridgeError::internal(format!(
                    "{} argument {} must be {:?}, got {:?}",
                    descriptor.name, position, kind, arg
                )));
            }
            values[position] = adapter.convert(*arg);
        }

        if adapter.mode == CallMode::Trace {
            trace!(
                shape = descriptor.name,
                pointer = %NativePointer::from(self.pointer),
                "native call"
            );
        }

        let native_args = NativeArgs {
            ctx: adapter.context,
            values,
        };
        let raw = (descriptor.trampoline)(self.pointer, &native_args);
        drop(adapter);
        Ok(raw)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("pointer", &format_args!("{:#x}", self.pointer))
            .field("shape", &self.descriptor.shape)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
