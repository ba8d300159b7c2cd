//! Garbage collector bridge
//!
//! Collector control maps onto `lua_gc`. Collection callbacks piggyback on the
//! collector's own finalizers: each watched value gets a sentinel userdata
//! with a `__gc` metamethod, stored in an ephemeron table keyed by the value.
//! The sentinel becomes unreachable in the same cycle as its key, so its
//! finalizer runs exactly when the watched value is collected.

use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr;

use mlua_sys as ffi;

use crate::error::{LuaError, Result};
use crate::protect::{check_stack, protect_lua_call};
use crate::reference::LuaReference;
use crate::registry::{self, WeakTable};
use crate::stack::StackGuard;
use crate::state::{ExtraData, GcWatch, Lua};

static SENTINEL_METATABLE_KEY: u8 = 4;

/// Collector mode and tuning. Zero parameters keep the interpreter's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    Incremental {
        pause: c_int,
        step_multiplier: c_int,
        step_size: c_int,
    },
    Generational {
        minor_multiplier: c_int,
        major_multiplier: c_int,
    },
}

impl Default for GcMode {
    fn default() -> Self {
        GcMode::Incremental {
            pause: 0,
            step_multiplier: 0,
            step_size: 0,
        }
    }
}

/// Collector control for one state
pub struct LuaGc<'lua> {
    lua: &'lua Lua,
}

impl Lua {
    pub fn gc(&self) -> LuaGc<'_> {
        LuaGc { lua: self }
    }
}

impl LuaGc<'_> {
    fn state(&self) -> Result<*mut ffi::lua_State> {
        self.lua
            .state()
            .map_err(|_| LuaError::InvalidOperation("the Lua state has been closed".to_string()))
    }

    /// Run a full collection cycle, including finalizers
    pub fn collect(&self) -> Result<()> {
        let state = self.state()?;
        unsafe {
            protect_lua_call(self.lua.extra(), state, 0, 0, |state| {
                ffi::lua_gc(state, ffi::LUA_GCCOLLECT, 0);
            })
        }
    }

    pub fn stop(&self) -> Result<()> {
        let state = self.state()?;
        unsafe { ffi::lua_gc(state, ffi::LUA_GCSTOP, 0) };
        Ok(())
    }

    pub fn restart(&self) -> Result<()> {
        let state = self.state()?;
        unsafe { ffi::lua_gc(state, ffi::LUA_GCRESTART, 0) };
        Ok(())
    }

    /// Perform an incremental step of `kbytes`. Returns true when a cycle finished.
    pub fn step(&self, kbytes: c_int) -> Result<bool> {
        let state = self.state()?;
        unsafe {
            protect_lua_call(self.lua.extra(), state, 0, 0, |state| {
                ffi::lua_gc(state, ffi::LUA_GCSTEP, kbytes)
            })
            .map(|finished| finished != 0)
        }
    }

    pub fn is_running(&self) -> Result<bool> {
        let state = self.state()?;
        Ok(unsafe { ffi::lua_gc(state, ffi::LUA_GCISRUNNING, 0) } != 0)
    }

    /// Bytes in use as reported by the collector
    pub fn count_bytes(&self) -> Result<usize> {
        let state = self.state()?;
        unsafe {
            let kbytes = ffi::lua_gc(state, ffi::LUA_GCCOUNT, 0) as usize;
            let remainder = ffi::lua_gc(state, ffi::LUA_GCCOUNTB, 0) as usize;
            Ok(kbytes * 1024 + remainder)
        }
    }

    pub fn set_incremental_mode(&self, pause: c_int, step_multiplier: c_int, step_size: c_int) -> Result<()> {
        let state = self.state()?;
        unsafe { ffi::lua_gc(state, ffi::LUA_GCINC, pause, step_multiplier, step_size) };
        Ok(())
    }

    pub fn set_generational_mode(&self, minor_multiplier: c_int, major_multiplier: c_int) -> Result<()> {
        let state = self.state()?;
        unsafe { ffi::lua_gc(state, ffi::LUA_GCGEN, minor_multiplier, major_multiplier) };
        Ok(())
    }

    pub fn set_mode(&self, mode: GcMode) -> Result<()> {
        match mode {
            GcMode::Incremental {
                pause,
                step_multiplier,
                step_size,
            } => self.set_incremental_mode(pause, step_multiplier, step_size),
            GcMode::Generational {
                minor_multiplier,
                major_multiplier,
            } => self.set_generational_mode(minor_multiplier, major_multiplier),
        }
    }

    /// Run `callback` when the collector reclaims the value behind `reference`.
    ///
    /// Registration does not keep the value alive. Callbacks registered for
    /// the same value run in registration order; errors and panics are
    /// reported as warnings.
    pub fn register_callback<F>(&self, reference: &LuaReference, callback: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let state = self.state()?;
        if !reference.lua().ptr_eq(self.lua) {
            return Err(LuaError::InvalidValue(
                "reference belongs to a different Lua state".to_string(),
            ));
        }

        let extra = self.lua.extra();
        let candidate = extra.next_sentinel.get();
        let (sentinel, address) = unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 3)?;
            reference.push_onto(state)?;
            protect_lua_call(extra, state, 1, 0, |state| sentinel_for(state, candidate))?
        };
        if sentinel == candidate {
            extra.next_sentinel.set(candidate + 1);
        }

        extra
            .gc_callbacks
            .borrow_mut()
            .entry(sentinel)
            .or_insert_with(|| GcWatch::new(address))
            .callbacks
            .push(Box::new(callback));
        Ok(())
    }
}

/// Create the sentinel metatable. Called once per state.
pub(crate) unsafe fn initialize(extra: &ExtraData, state: *mut ffi::lua_State) -> Result<()> {
    let key = sentinel_metatable_key();
    protect_lua_call(extra, state, 0, 0, |state| {
        ffi::lua_createtable(state, 0, 1);
        ffi::lua_pushcfunction(state, finalize_sentinel);
        ffi::lua_setfield(state, -2, c"__gc".as_ptr());
        ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, key);
    })
}

/// Find or create the sentinel for the value at index 1; returns its id and
/// block address.
///
/// Runs inside a protection frame and holds nothing with a destructor.
unsafe fn sentinel_for(state: *mut ffi::lua_State, candidate: u64) -> (u64, usize) {
    registry::push_weak_table(state, WeakTable::GcSentinels);
    ffi::lua_pushvalue(state, 1);
    if ffi::lua_rawget(state, -2) == ffi::LUA_TUSERDATA {
        let cell = ffi::lua_touserdata(state, -1);
        return (ptr::read(cell as *const u64), cell as usize);
    }
    ffi::lua_pop(state, 1);

    let cell = ffi::lua_newuserdatauv(state, mem::size_of::<u64>(), 0) as *mut u64;
    ptr::write(cell, candidate);
    ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, sentinel_metatable_key());
    ffi::lua_setmetatable(state, -2);

    // targets[sentinel] = target
    registry::push_weak_table(state, WeakTable::SentinelTargets);
    ffi::lua_pushvalue(state, -2);
    ffi::lua_pushvalue(state, 1);
    ffi::lua_rawset(state, -3);
    ffi::lua_pop(state, 1);

    // sentinels[target] = sentinel
    ffi::lua_pushvalue(state, 1);
    ffi::lua_insert(state, -2);
    ffi::lua_rawset(state, -3);
    (candidate, cell as usize)
}

fn sentinel_metatable_key() -> *const c_void {
    &SENTINEL_METATABLE_KEY as *const u8 as *const c_void
}

/// Id of the sentinel at index 1, if it is one whose target has been collected.
///
/// `__gc` can be reached from scripts and called on any value at any time, so
/// the argument must carry the sentinel metatable and its target must be gone,
/// unless the state is closing. Never allocates.
unsafe fn collected_sentinel(state: *mut ffi::lua_State) -> Option<(u64, usize)> {
    if ffi::lua_type(state, 1) != ffi::LUA_TUSERDATA
        || ffi::lua_rawlen(state, 1) as usize != mem::size_of::<u64>()
        || ffi::lua_checkstack(state, 3) == 0
    {
        return None;
    }

    if ffi::lua_getmetatable(state, 1) == 0 {
        return None;
    }
    ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, sentinel_metatable_key());
    let is_sentinel = ffi::lua_rawequal(state, -1, -2) != 0;
    ffi::lua_pop(state, 2);
    if !is_sentinel {
        return None;
    }

    registry::push_weak_table(state, WeakTable::SentinelTargets);
    ffi::lua_pushvalue(state, 1);
    let target_alive = ffi::lua_rawget(state, -2) != ffi::LUA_TNIL;
    ffi::lua_pop(state, 2);
    if target_alive && !ExtraData::from_state(state).closing.get() {
        return None;
    }

    let cell = ffi::lua_touserdata(state, 1);
    Some((ptr::read(cell as *const u64), cell as usize))
}

unsafe extern "C-unwind" fn finalize_sentinel(state: *mut ffi::lua_State) -> c_int {
    if let Some((sentinel, address)) = collected_sentinel(state) {
        ExtraData::from_state(state).run_gc_callbacks(sentinel, address);
    }
    0
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_callback_runs_after_collection() {
        let lua = Lua::new().unwrap();
        let fired = Rc::new(Cell::new(0));

        let table = lua.create_table().unwrap();
        let counter = fired.clone();
        lua.gc()
            .register_callback(table.reference(), move || {
                counter.set(counter.get() + 1);
                Ok(())
            })
            .unwrap();

        lua.gc().collect().unwrap();
        assert_eq!(fired.get(), 0);

        drop(table);
        lua.gc().collect().unwrap();
        lua.gc().collect().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_sentinel_finalizer_ignores_premature_calls() {
        let lua = Lua::new().unwrap();
        let fired = Rc::new(Cell::new(0));

        let table = lua.create_table().unwrap();
        let counter = fired.clone();
        lua.gc()
            .register_callback(table.reference(), move || {
                counter.set(counter.get() + 1);
                Ok(())
            })
            .unwrap();

        // The sentinel and its metatable are reachable through the registry
        let calls: i64 = lua
            .evaluate(
                r#"(function()
                    local calls = 0
                    for _, container in pairs(debug.getregistry()) do
                        local mt = type(container) == "table" and debug.getmetatable(container)
                        if mt and mt.__mode == "k" then
                            for _, sentinel in pairs(container) do
                                local finalize = debug.getmetatable(sentinel).__gc
                                finalize(sentinel)
                                finalize(io.tmpfile())
                                finalize({})
                                calls = calls + 1
                            end
                        end
                    end
                    return calls
                end)()"#,
            )
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(fired.get(), 0);

        drop(table);
        lua.gc().collect().unwrap();
        lua.gc().collect().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_callback_runs_when_state_closes() {
        let lua = Lua::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let table = lua.create_table().unwrap();
        let flag = fired.clone();
        lua.gc()
            .register_callback(table.reference(), move || {
                flag.set(true);
                Ok(())
            })
            .unwrap();

        lua.close().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn test_callback_failure_becomes_warning() {
        let lua = Lua::new().unwrap();
        let warnings = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = warnings.clone();
        lua.set_warning_handler(move |message| sink.borrow_mut().push(message.to_string()));

        let table = lua.create_table().unwrap();
        lua.gc()
            .register_callback(table.reference(), || Err(LuaError::runtime("callback broke")))
            .unwrap();
        drop(table);
        lua.gc().collect().unwrap();
        lua.gc().collect().unwrap();

        let warnings = warnings.borrow();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("callback broke"));
    }

    #[test]
    fn test_control_after_close_is_invalid() {
        let lua = Lua::new().unwrap();
        lua.close().unwrap();
        assert!(matches!(lua.gc().collect(), Err(LuaError::InvalidOperation(_))));
        assert!(matches!(lua.gc().stop(), Err(LuaError::InvalidOperation(_))));
    }

    #[test]
    fn test_stop_and_restart() {
        let lua = Lua::new().unwrap();
        lua.gc().stop().unwrap();
        assert!(!lua.gc().is_running().unwrap());
        lua.gc().restart().unwrap();
        assert!(lua.gc().is_running().unwrap());
        assert!(lua.gc().count_bytes().unwrap() > 0);
    }

    #[test]
    fn test_generational_mode_switch() {
        let lua = Lua::new().unwrap();
        lua.gc().set_generational_mode(0, 0).unwrap();
        lua.gc().collect().unwrap();
        lua.gc().set_mode(GcMode::default()).unwrap();
        assert!(lua.gc().is_running().unwrap());
    }
}
