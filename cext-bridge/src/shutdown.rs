//! Process Shutdown Finalizers
//!
//! Native libraries may keep global objects whose destructors call back
//! into the bridge after the managed runtime has gone. The backend exports
//! an array of `(address, replacement)` pairs, terminated by a null
//! address, that rebinds those callbacks to harmless native functions:
//!
//! ```text
//! [ var_addr, reset_val, var_addr1, reset_val1, ..., NULL ]
//! ```
//!
//! A [`NativeFinalizer`] performs that walk at most once. It normally runs
//! on context exit; a process-wide [`ShutdownHooks`] list covers the case
//! where the process ends without a context exit.
//!
//! # Usage
//!
//! ```rust,ignore
//! let finalizer = Arc::new(unsafe { NativeFinalizer::new(array) });
//! let id = shutdown_hooks().register(Arc::clone(&finalizer))?;
//! // ... context exit:
//! let _ = shutdown_hooks().remove(id);
//! finalizer.run();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::memory::NativePointer;

/// Errors from the shutdown hook list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShutdownError {
    /// Process shutdown has started; the hook list is frozen.
    #[error("shutdown already in progress")]
    InProgress,
    /// The hook id is not registered.
    #[error("shutdown hook {0} is not registered")]
    NotRegistered(u64),
}

/// Identifies a registered shutdown hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

impl HookId {
    /// The raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Rewrites native function-pointer slots from a reset array, once.
pub struct NativeFinalizer {
    array: usize,
    ran: AtomicBool,
}

impl NativeFinalizer {
    /// Create a finalizer over a reset array.
    ///
    /// # Safety
    ///
    /// `array` must point to pointer-sized `(address, replacement)` pairs
    /// terminated by a null address, and every address must stay writable
    /// until the finalizer has run.
    pub unsafe fn new(array: usize) -> Self {
        Self {
            array,
            ran: AtomicBool::new(false),
        }
    }

    /// Address of the reset array.
    pub fn array(&self) -> usize {
        self.array
    }

    /// Whether the walk has already happened.
    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::Acquire)
    }

    /// Perform the walk; returns `false` if it already ran.
    pub fn run(&self) -> bool {
        if self.ran.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut rewritten = 0usize;
        // SAFETY: the constructor's contract covers the array and targets.
        unsafe {
            let mut cursor = self.array as *const usize;
            loop {
                let location = cursor.read();
                if location == 0 {
                    break;
                }
                let replacement = cursor.add(1).read();
                (location as *mut usize).write(replacement);
                rewritten += 1;
                cursor = cursor.add(2);
            }
        }
        debug!(array = %NativePointer::from(self.array), rewritten, "native finalizer ran");
        true
    }
}

impl fmt::Debug for NativeFinalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFinalizer")
            .field("array", &NativePointer::from(self.array))
            .field("ran", &self.has_run())
            .finish()
    }
}

/// Finalizers to run when the process exits.
#[derive(Debug, Default)]
pub struct ShutdownHooks {
    hooks: Mutex<Vec<(HookId, Arc<NativeFinalizer>)>>,
    running: AtomicBool,
    next_id: AtomicU64,
}

impl ShutdownHooks {
    /// Create an empty hook list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a finalizer.
    pub fn register(&self, finalizer: Arc<NativeFinalizer>) -> Result<HookId, ShutdownError> {
        let mut hooks = self.hooks.lock();
        if self.is_running() {
            return Err(ShutdownError::InProgress);
        }
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        hooks.push((id, finalizer));
        Ok(id)
    }

    /// Unregister a finalizer without running it.
    pub fn remove(&self, id: HookId) -> Result<Arc<NativeFinalizer>, ShutdownError> {
        let mut hooks = self.hooks.lock();
        if self.is_running() {
            return Err(ShutdownError::InProgress);
        }
        let position = hooks
            .iter()
            .position(|(hook, _)| *hook == id)
            .ok_or(ShutdownError::NotRegistered(id.0))?;
        Ok(hooks.remove(position).1)
    }

    /// Freeze the list and run every registered finalizer.
    ///
    /// Returns how many finalizers performed their walk here.
    pub fn run_all(&self) -> usize {
        let drained = {
            let mut hooks = self.hooks.lock();
            if self.running.swap(true, Ordering::AcqRel) {
                return 0;
            }
            std::mem::take(&mut *hooks)
        };
        drained
            .into_iter()
            .filter(|(_, finalizer)| finalizer.run())
            .count()
    }

    /// Whether shutdown has started.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of registered finalizers.
    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Whether no finalizers are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }
}

/// Process-wide hook list.
static SHUTDOWN_HOOKS: OnceLock<ShutdownHooks> = OnceLock::new();

extern "C" fn run_at_exit() {
    if let Some(hooks) = SHUTDOWN_HOOKS.get() {
        hooks.run_all();
    }
}

/// Get the process-wide hook list, installing the exit handler on first use.
pub fn shutdown_hooks() -> &'static ShutdownHooks {
    SHUTDOWN_HOOKS.get_or_init(|| {
        // SAFETY: run_at_exit only touches the static hook list.
        let status = unsafe { libc::atexit(run_at_exit) };
        if status != 0 {
            warn!(status, "could not install the process exit handler");
        }
        ShutdownHooks::new()
    })
}
