//! Protected-call boundary
//!
//! Lua reports errors with `longjmp`. A native error raised with no
//! protection frame reaches the panic handler and, left alone, aborts the
//! process. Every native operation that can fault is therefore run through
//! [`protect_lua_call`] or [`pcall`], which install a protection frame and
//! turn the status code into a [`LuaError`].
//!
//! In the other direction, host code called by the interpreter (functions,
//! metamethods, hooks) runs inside [`callback_boundary`]. Host errors and
//! panics are stored in a side channel and a light userdata token is raised
//! in their place. When the token reaches a checkpoint on the host side the
//! original error is restored as the cause.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::Arc;
use std::time::Instant;

use mlua_sys as ffi;

use crate::error::{LuaError, Result};
use crate::state::{ExtraData, Lua};
use crate::value::ValueType;

/// State of the protected-call boundary for one interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryState {
    /// No native call is in progress
    Idle,

    /// At least one protection frame is active
    InProtectedCall,

    /// An unprotected error reached the panic handler; the state can only be closed
    Panicking,
}

/// A host failure waiting to be restored on the host side
pub(crate) enum Smuggled {
    /// Error returned by a host callback
    Error(LuaError),

    /// Panic payload caught in a host callback
    Panic(Box<dyn Any + Send + 'static>),
}

/// Payload of the Rust panic raised by the native panic handler
#[derive(Debug)]
pub struct LuaPanic {
    /// Native error message
    pub message: String,

    /// Smuggled host error, if the error object carried one
    pub cause: Option<Arc<LuaError>>,
}

/// Tracks protection depth and holds the side channel for smuggled errors
pub(crate) struct ProtectedCallBoundary {
    state: Cell<BoundaryState>,
    depth: Cell<usize>,
    pending: RefCell<HashMap<usize, Smuggled>>,
    next_token: Cell<usize>,
    entries: Cell<u64>,
    entered_at: Cell<Instant>,
}

impl ProtectedCallBoundary {
    pub(crate) fn new() -> Self {
        ProtectedCallBoundary {
            state: Cell::new(BoundaryState::Idle),
            depth: Cell::new(0),
            pending: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            entries: Cell::new(0),
            entered_at: Cell::new(Instant::now()),
        }
    }

    pub(crate) fn state(&self) -> BoundaryState {
        self.state.get()
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Outermost entries so far; each one starts a new execution
    pub(crate) fn entries(&self) -> u64 {
        self.entries.get()
    }

    /// When the latest outermost entry happened
    pub(crate) fn entered_at(&self) -> Instant {
        self.entered_at.get()
    }

    /// Enter a protection frame (Idle -> InProtectedCall)
    pub(crate) fn enter(&self) -> BoundaryGuard<'_> {
        if self.depth.get() == 0 {
            self.entries.set(self.entries.get() + 1);
            self.entered_at.set(Instant::now());
            // Tokens caught and discarded by script code are never claimed
            if let Ok(mut pending) = self.pending.try_borrow_mut() {
                pending.clear();
            }
        }
        self.push_frame()
    }

    fn push_frame(&self) -> BoundaryGuard<'_> {
        self.depth.set(self.depth.get() + 1);
        if self.state.get() == BoundaryState::Idle {
            self.state.set(BoundaryState::InProtectedCall);
        }
        BoundaryGuard { boundary: self }
    }

    /// Treat the current code as protected while it runs, without a native frame.
    ///
    /// Used for GC callbacks, which the collector runs under its own protection.
    /// Does not start a new execution.
    pub(crate) fn suspend(&self) -> BoundaryGuard<'_> {
        self.push_frame()
    }

    pub(crate) fn mark_panicking(&self) {
        self.state.set(BoundaryState::Panicking);
    }

    /// Store a host failure and return the token raised in its place
    pub(crate) fn smuggle(&self, value: Smuggled) -> *mut c_void {
        let token = self.next_token.get();
        self.next_token.set(token.wrapping_add(1).max(1));
        self.pending.borrow_mut().insert(token, value);
        token as *mut c_void
    }

    /// Reclaim a smuggled failure by its token
    pub(crate) fn take(&self, token: *mut c_void) -> Option<Smuggled> {
        self.pending.borrow_mut().remove(&(token as usize))
    }
}

/// Leaves a protection frame when dropped
pub(crate) struct BoundaryGuard<'a> {
    boundary: &'a ProtectedCallBoundary,
}

impl Drop for BoundaryGuard<'_> {
    fn drop(&mut self) {
        let depth = self.boundary.depth.get().saturating_sub(1);
        self.boundary.depth.set(depth);
        if depth == 0 && self.boundary.state.get() == BoundaryState::InProtectedCall {
            self.boundary.state.set(BoundaryState::Idle);
        }
    }
}

/// Make sure the stack can hold `n` more values
pub(crate) unsafe fn check_stack(state: *mut ffi::lua_State, n: c_int) -> Result<()> {
    if n < 0 || ffi::lua_checkstack(state, n) == 0 {
        Err(LuaError::StackOverflow(n.max(0) as usize))
    } else {
        Ok(())
    }
}

/// Run `f` inside a protection frame.
///
/// The top `nargs` values are passed to `f` as the arguments of a C function
/// call (stack indices `1..=nargs`), and `nresults` values left on top by `f`
/// are returned on the caller's stack. `f` may call any native function that
/// can raise an error; it must not hold values with destructors while doing
/// so, since a raised error skips its frame.
pub(crate) unsafe fn protect_lua_call<F, R>(
    extra: &ExtraData,
    state: *mut ffi::lua_State,
    nargs: c_int,
    nresults: c_int,
    f: F,
) -> Result<R>
where
    F: Fn(*mut ffi::lua_State) -> R,
    R: Copy,
{
    struct Params<F, R> {
        function: F,
        result: MaybeUninit<R>,
        nresults: c_int,
    }

    unsafe extern "C-unwind" fn do_call<F, R>(state: *mut ffi::lua_State) -> c_int
    where
        F: Fn(*mut ffi::lua_State) -> R,
        R: Copy,
    {
        let params = ffi::lua_touserdata(state, -1) as *mut Params<F, R>;
        ffi::lua_pop(state, 1);

        (*params).result.write(((*params).function)(state));

        if (*params).nresults == ffi::LUA_MULTRET {
            ffi::lua_gettop(state)
        } else {
            (*params).nresults
        }
    }

    check_stack(state, 2)?;

    let stack_start = ffi::lua_gettop(state) - nargs;
    ffi::lua_pushcfunction(state, do_call::<F, R>);
    if nargs > 0 {
        ffi::lua_rotate(state, stack_start + 1, 1);
    }

    let mut params = Params {
        function: f,
        result: MaybeUninit::uninit(),
        nresults,
    };
    ffi::lua_pushlightuserdata(state, &mut params as *mut Params<F, R> as *mut c_void);

    let status = {
        let _enter = extra.boundary.enter();
        ffi::lua_pcall(state, nargs + 1, nresults, 0)
    };

    if status == ffi::LUA_OK {
        Ok(params.result.assume_init())
    } else {
        Err(pop_error(extra, state, status))
    }
}

/// Call the function below `nargs` arguments inside a protection frame
pub(crate) unsafe fn pcall(
    extra: &ExtraData,
    state: *mut ffi::lua_State,
    nargs: c_int,
    nresults: c_int,
) -> Result<()> {
    let status = {
        let _enter = extra.boundary.enter();
        ffi::lua_pcall(state, nargs, nresults, 0)
    };

    if status == ffi::LUA_OK {
        Ok(())
    } else {
        Err(pop_error(extra, state, status))
    }
}

/// Convert the error object on top of the stack into a structured error and pop it.
///
/// A smuggled host panic is resumed here, once the native frames are gone.
pub(crate) unsafe fn pop_error(extra: &ExtraData, state: *mut ffi::lua_State, status: c_int) -> LuaError {
    let smuggled = if ffi::lua_type(state, -1) == ffi::LUA_TLIGHTUSERDATA {
        extra.boundary.take(ffi::lua_touserdata(state, -1))
    } else {
        None
    };

    match smuggled {
        Some(Smuggled::Panic(payload)) => {
            ffi::lua_pop(state, 1);
            panic::resume_unwind(payload)
        }
        Some(Smuggled::Error(error)) => {
            ffi::lua_pop(state, 1);
            let message = error
                .message()
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string());
            LuaError::from_status(status, message, Some(Arc::new(error)))
        }
        None => {
            let message = error_message(state, -1);
            ffi::lua_pop(state, 1);
            LuaError::from_status(status, message, None)
        }
    }
}

/// Describe an error object without allocating inside the interpreter
pub(crate) unsafe fn error_message(state: *mut ffi::lua_State, index: c_int) -> String {
    match ffi::lua_type(state, index) {
        ffi::LUA_TSTRING => {
            let mut len = 0usize;
            let ptr = ffi::lua_tolstring(state, index, &mut len);
            if ptr.is_null() {
                return String::new();
            }
            let bytes = slice::from_raw_parts(ptr as *const u8, len);
            String::from_utf8_lossy(bytes).into_owned()
        }
        ffi::LUA_TNUMBER => {
            if ffi::lua_isinteger(state, index) != 0 {
                ffi::lua_tointegerx(state, index, std::ptr::null_mut()).to_string()
            } else {
                ffi::lua_tonumberx(state, index, std::ptr::null_mut()).to_string()
            }
        }
        ffi::LUA_TNIL => "nil".to_string(),
        other => format!(
            "(error object is a {} value)",
            ValueType::from_native(other).name()
        ),
    }
}

/// Outcome of a host callback, free of destructors
#[derive(Clone, Copy, PartialEq, Eq)]
enum CallbackOutcome {
    Returned(c_int),
    Raise,
}

/// Run host code called from a C function and translate its failure into a native error.
///
/// On success returns the number of results `f` pushed. On failure the
/// error object is pushed and raised; nothing with a destructor is alive in
/// this frame at that point.
pub(crate) unsafe fn callback_boundary<F>(state: *mut ffi::lua_State, f: F) -> c_int
where
    F: FnOnce(&Lua, *mut ffi::lua_State) -> Result<c_int>,
{
    match run_callback(state, true, f) {
        CallbackOutcome::Returned(n) => n,
        CallbackOutcome::Raise => ffi::lua_error(state),
    }
}

/// Same as [`callback_boundary`] for hook functions, which share the running function's frame
pub(crate) unsafe fn hook_boundary<F>(state: *mut ffi::lua_State, f: F)
where
    F: FnOnce(&Lua, *mut ffi::lua_State) -> Result<c_int>,
{
    if run_callback(state, false, f) == CallbackOutcome::Raise {
        ffi::lua_error(state);
    }
}

unsafe fn run_callback<F>(state: *mut ffi::lua_State, owns_frame: bool, f: F) -> CallbackOutcome
where
    F: FnOnce(&Lua, *mut ffi::lua_State) -> Result<c_int>,
{
    let extra = ExtraData::from_state(state);

    let lua = match extra.owner() {
        Some(lua) => lua,
        None => {
            prepare_raise(extra, state, owns_frame, Smuggled::Error(LuaError::ObjectDisposed("Lua state")));
            return CallbackOutcome::Raise;
        }
    };

    let result = {
        let _thread = lua.inner.enter_thread(state);
        panic::catch_unwind(AssertUnwindSafe(|| f(&lua, state)))
    };

    match result {
        Ok(Ok(count)) => CallbackOutcome::Returned(count),
        Ok(Err(error)) => {
            prepare_raise(extra, state, owns_frame, Smuggled::Error(error));
            CallbackOutcome::Raise
        }
        Err(payload) => {
            prepare_raise(extra, state, owns_frame, Smuggled::Panic(payload));
            CallbackOutcome::Raise
        }
    }
}

/// Push the error object for a failed callback.
///
/// Plain script errors become native strings; everything else is smuggled.
unsafe fn prepare_raise(extra: &ExtraData, state: *mut ffi::lua_State, owns_frame: bool, failure: Smuggled) {
    if owns_frame {
        ffi::lua_settop(state, 0);
    }

    if let Smuggled::Error(LuaError::Runtime { message, cause: None }) = &failure {
        let bytes = message.as_bytes();
        let pushed = protect_lua_call(extra, state, 0, 1, |state| {
            ffi::lua_pushlstring(state, bytes.as_ptr() as *const c_char, bytes.len());
        });
        if pushed.is_ok() {
            return;
        }
    }

    let token = extra.boundary.smuggle(failure);
    ffi::lua_checkstack(state, 1);
    ffi::lua_pushlightuserdata(state, token);
}

/// Native panic handler, called for errors raised with no protection frame.
///
/// Converts the error into a Rust panic carrying [`LuaPanic`], which
/// [`catch_lua_panic`] turns into [`LuaError::Panic`].
pub(crate) unsafe extern "C-unwind" fn panic_handler(state: *mut ffi::lua_State) -> c_int {
    let extra = ExtraData::from_state(state);

    let smuggled = if ffi::lua_type(state, -1) == ffi::LUA_TLIGHTUSERDATA {
        extra.boundary.take(ffi::lua_touserdata(state, -1))
    } else {
        None
    };

    let (message, cause) = match smuggled {
        Some(Smuggled::Panic(payload)) => {
            extra.boundary.mark_panicking();
            panic::resume_unwind(payload)
        }
        Some(Smuggled::Error(error)) => {
            let message = error
                .message()
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string());
            (message, Some(Arc::new(error)))
        }
        None => (error_message(state, -1), None),
    };

    extra.boundary.mark_panicking();
    tracing::error!(%message, "unprotected Lua error reached the panic handler");
    panic::resume_unwind(Box::new(LuaPanic { message, cause }))
}

/// Run `f`, converting a panic raised by [`panic_handler`] into [`LuaError::Panic`]
pub(crate) fn catch_lua_panic<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => match payload.downcast::<LuaPanic>() {
            Ok(lua_panic) => {
                let LuaPanic { message, cause } = *lua_panic;
                Err(LuaError::Panic { message, cause })
            }
            Err(other) => panic::resume_unwind(other),
        },
    }
}

/// Best-effort message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
