//! Interpreter state ownership
//!
//! [`Lua`] is a cheap, clonable handle to one native interpreter. The native
//! state is closed when the last handle and the last reference created from
//! it are gone, or earlier through [`Lua::close`]; after that every reference
//! reports [`LuaError::ObjectDisposed`].

mod extra;

pub(crate) use extra::{ExtraData, GcWatch};

use std::cell::Cell;
use std::fmt;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::rc::Rc;
use std::time::Instant;

use mlua_sys as ffi;

use crate::alloc::AllocatorStats;
use crate::config::LuaConfig;
use crate::convert::{FromLua, FromLuaMulti, IntoLua};
use crate::error::{LuaError, Result};
use crate::hook::InstructionLimitHook;
use crate::protect::{self, check_stack, protect_lua_call, BoundaryState};
use crate::reference::{LuaFunction, LuaReference, LuaTable, LuaThread, ReferenceKind};
use crate::registry;
use crate::stack::StackGuard;
use crate::value::ValueType;

/// Handle to a native Lua state
#[derive(Clone)]
pub struct Lua {
    pub(crate) inner: Rc<LuaInner>,
}

pub(crate) struct LuaInner {
    main: Cell<*mut ffi::lua_State>,
    current: Cell<*mut ffi::lua_State>,
    pub(crate) extra: Box<ExtraData>,
}

impl LuaInner {
    /// Make `state` the current thread until the guard is dropped
    pub(crate) fn enter_thread(&self, state: *mut ffi::lua_State) -> ThreadGuard<'_> {
        let previous = self.current.replace(state);
        ThreadGuard { inner: self, previous }
    }

    fn close_native(&self) {
        let main = self.main.replace(ptr::null_mut());
        self.current.set(ptr::null_mut());
        if !main.is_null() {
            // Runs pending finalizers, which may still reach `extra`
            self.extra.closing.set(true);
            unsafe { ffi::lua_close(main) };
            tracing::debug!(
                leaked_bytes = self.extra.allocator.stats().current_bytes,
                "closed Lua state"
            );
        }
    }
}

impl Drop for LuaInner {
    fn drop(&mut self) {
        self.close_native();
    }
}

/// Restores the previous current thread
pub(crate) struct ThreadGuard<'a> {
    inner: &'a LuaInner,
    previous: *mut ffi::lua_State,
}

impl Drop for ThreadGuard<'_> {
    fn drop(&mut self) {
        if !self.inner.main.get().is_null() {
            self.inner.current.set(self.previous);
        }
    }
}

impl Lua {
    /// Create a state with the default configuration
    pub fn new() -> Result<Lua> {
        Lua::with_config(LuaConfig::default())
    }

    /// Create a state and apply `config`
    pub fn with_config(config: LuaConfig) -> Result<Lua> {
        let inner = Rc::new_cyclic(|owner| LuaInner {
            main: Cell::new(ptr::null_mut()),
            current: Cell::new(ptr::null_mut()),
            extra: Box::new(ExtraData::new(owner.clone(), &config)),
        });

        let ud = &*inner.extra as *const ExtraData as *mut c_void;
        let state = unsafe { ffi::lua_newstate(extra::allocate, ud) };
        if state.is_null() {
            return Err(LuaError::Memory {
                message: "not enough memory to create a Lua state".to_string(),
                cause: None,
            });
        }

        inner.main.set(state);
        inner.current.set(state);
        unsafe {
            ffi::lua_atpanic(state, protect::panic_handler);
        }

        let lua = Lua { inner };
        unsafe {
            registry::initialize(lua.extra(), state)?;
            crate::gc::initialize(lua.extra(), state)?;
        }

        for library in &config.libraries {
            lua.open_library(*library)?;
        }
        lua.gc().set_mode(config.gc_mode)?;
        if let Some(limit) = config.instruction_limit {
            lua.set_hook(Rc::new(InstructionLimitHook::new(limit, config.hook_interval)))?;
        }

        tracing::debug!(
            memory_limit = ?config.memory_limit,
            libraries = config.libraries.len(),
            "created Lua state"
        );
        Ok(lua)
    }

    /// The native state of the current thread
    pub(crate) fn state(&self) -> Result<*mut ffi::lua_State> {
        let state = self.inner.current.get();
        if state.is_null() {
            return Err(LuaError::ObjectDisposed("Lua state"));
        }
        if self.extra().boundary.state() == BoundaryState::Panicking {
            return Err(LuaError::InvalidOperation(
                "the Lua state panicked and can only be closed".to_string(),
            ));
        }
        Ok(state)
    }

    /// The native state of the main thread
    pub(crate) fn main_state(&self) -> Result<*mut ffi::lua_State> {
        self.state()?;
        Ok(self.inner.main.get())
    }

    pub(crate) fn extra(&self) -> &ExtraData {
        &self.inner.extra
    }

    /// Close the native state now.
    ///
    /// Pending finalizers run; references created from this state become
    /// disposed. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.extra().boundary.depth() > 0 {
            return Err(LuaError::InvalidOperation(
                "cannot close a Lua state while it is executing".to_string(),
            ));
        }
        self.inner.close_native();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.main.get().is_null()
    }

    /// Current state of the protected-call boundary
    pub fn boundary_state(&self) -> BoundaryState {
        self.extra().boundary.state()
    }

    /// Identifies the current execution.
    ///
    /// A new execution starts each time the host enters the interpreter from
    /// outside any protected call. Nested entries from host callbacks belong
    /// to the execution that called them.
    pub fn execution_id(&self) -> u64 {
        self.extra().boundary.entries()
    }

    /// When the current (or latest) execution started
    pub fn execution_started(&self) -> Instant {
        self.extra().boundary.entered_at()
    }

    /// Whether both handles refer to the same native state
    pub fn ptr_eq(&self, other: &Lua) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The globals table (persistent reference)
    pub fn globals(&self) -> Result<LuaTable> {
        self.state()?;
        Ok(LuaTable::from_reference(LuaReference::persistent(
            self,
            ffi::LUA_RIDX_GLOBALS as c_int,
        )))
    }

    /// The main thread (persistent reference)
    pub fn main_thread(&self) -> Result<LuaThread> {
        self.state()?;
        Ok(LuaThread::from_reference(LuaReference::persistent(
            self,
            ffi::LUA_RIDX_MAINTHREAD as c_int,
        )))
    }

    pub fn get_global<V: FromLua>(&self, name: &str) -> Result<V> {
        self.globals()?.get(name)
    }

    pub fn set_global<V: IntoLua>(&self, name: &str, value: V) -> Result<()> {
        self.globals()?.set(name, value)
    }

    pub fn create_table(&self) -> Result<LuaTable> {
        self.create_table_with_capacity(0, 0)
    }

    /// Create a table with preallocated array and hash parts
    pub fn create_table_with_capacity(&self, narr: usize, nrec: usize) -> Result<LuaTable> {
        let state = self.state()?;
        let narr = narr.min(c_int::MAX as usize) as c_int;
        let nrec = nrec.min(c_int::MAX as usize) as c_int;
        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 3)?;
            protect_lua_call(self.extra(), state, 0, 1, |state| {
                ffi::lua_createtable(state, narr, nrec);
            })?;
            Ok(LuaTable::from_reference(LuaReference::capture(self, state, -1)?))
        }
    }

    /// Create a coroutine running `function`
    pub fn create_thread(&self, function: &LuaFunction) -> Result<LuaThread> {
        let state = self.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 3)?;
            let thread = protect_lua_call(self.extra(), state, 0, 1, |state| ffi::lua_newthread(state))?;
            function.reference().push_onto(state)?;
            ffi::lua_xmove(state, thread, 1);
            Ok(LuaThread::from_reference(LuaReference::capture(self, state, -1)?))
        }
    }

    /// Type of the value stored in a registry slot
    pub fn registry_slot_type(&self, slot: c_int) -> Result<ValueType> {
        let state = self.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 1)?;
            let kind = ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, slot as ffi::lua_Integer);
            Ok(ValueType::from_native(kind))
        }
    }

    /// Compile source text with the configured chunk mode
    pub fn load(&self, source: impl AsRef<[u8]>, name: &str) -> Result<LuaFunction> {
        self.load_chunk(source.as_ref(), name, self.extra().chunk_mode.get())
    }

    /// Compile and run a chunk, discarding its results
    pub fn execute(&self, source: impl AsRef<[u8]>) -> Result<()> {
        self.load(source, "chunk")?.call(())
    }

    /// Evaluate an expression or run a chunk, returning its results.
    ///
    /// The source is first tried as `return <source>`, so plain expressions
    /// work without an explicit `return`.
    pub fn evaluate<R: FromLuaMulti>(&self, source: impl AsRef<[u8]>) -> Result<R> {
        let source = source.as_ref();
        let mut expression = b"return ".to_vec();
        expression.extend_from_slice(source);

        let function = match self.load(&expression, "chunk") {
            Ok(function) => function,
            Err(LuaError::Syntax { .. }) => self.load(source, "chunk")?,
            Err(err) => return Err(err),
        };
        function.call(())
    }

    /// Install a handler for non-fatal diagnostics (GC callback failures)
    pub fn set_warning_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + 'static,
    {
        *self.extra().warning_handler.borrow_mut() = Some(Rc::new(handler));
    }

    pub fn remove_warning_handler(&self) {
        *self.extra().warning_handler.borrow_mut() = None;
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.extra().allocator.stats()
    }

    /// Change the memory cap. Memory already in use is not reclaimed.
    pub fn set_memory_limit(&self, limit: Option<usize>) {
        self.extra().allocator.set_max_bytes(limit);
    }

    /// Stack traceback of the current thread, starting at `level`
    pub fn traceback(&self, message: Option<&str>, level: c_int) -> Result<String> {
        let state = self.state()?;
        let message = match message {
            Some(message) => Some(
                std::ffi::CString::new(message)
                    .map_err(|_| LuaError::InvalidValue("traceback message contains a NUL byte".to_string()))?,
            ),
            None => None,
        };
        let message_ptr = message.as_ref().map_or(ptr::null(), |m| m.as_ptr() as *const c_char);

        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 4)?;
            protect_lua_call(self.extra(), state, 0, 1, |state| {
                ffi::luaL_traceback(state, state, message_ptr, level);
            })?;
            Ok(protect::error_message(state, -1))
        }
    }
}

impl fmt::Debug for Lua {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lua")
            .field("state", &self.inner.main.get())
            .field("boundary", &self.boundary_state())
            .finish()
    }
}
