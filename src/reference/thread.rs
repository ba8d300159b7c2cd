//! Coroutine references
//!
//! Coroutines share the registry of their state but each has its own stack.
//! A yield is reported as [`CoroutineState::Yielded`], never as an error.

use std::os::raw::c_int;

use mlua_sys as ffi;

use crate::convert::{FromLuaMulti, IntoLuaMulti};
use crate::error::{LuaError, Result};
use crate::marshal;
use crate::protect::{self, check_stack};
use crate::stack::StackGuard;
use crate::value::ValueType;

use super::typed_reference;

typed_reference!(
    /// Reference to a coroutine
    LuaThread,
    ValueType::Thread
);

/// Outcome of a successful resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// The coroutine yielded and can be resumed again
    Yielded,

    /// The body returned
    Finished,
}

/// Observable status of a coroutine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Not started, or suspended in a yield
    Resumable,

    /// Currently running, or resuming another coroutine
    Running,

    /// The body returned
    Finished,

    /// The body raised an error
    Error,
}

impl LuaThread {
    unsafe fn native(&self, state: *mut ffi::lua_State) -> Result<*mut ffi::lua_State> {
        let _guard = StackGuard::new(state);
        self.0.push_onto(state)?;
        Ok(ffi::lua_tothread(state, -1))
    }

    pub fn status(&self) -> Result<ThreadStatus> {
        let state = self.0.lua().state()?;
        unsafe {
            let thread = self.native(state)?;
            if thread == state {
                return Ok(ThreadStatus::Running);
            }
            match ffi::lua_status(thread) {
                ffi::LUA_YIELD => Ok(ThreadStatus::Resumable),
                ffi::LUA_OK => {
                    let mut ar: ffi::lua_Debug = std::mem::zeroed();
                    if ffi::lua_getstack(thread, 0, &mut ar) > 0 {
                        Ok(ThreadStatus::Running)
                    } else if ffi::lua_gettop(thread) == 0 {
                        Ok(ThreadStatus::Finished)
                    } else {
                        Ok(ThreadStatus::Resumable)
                    }
                }
                _ => Ok(ThreadStatus::Error),
            }
        }
    }

    /// Start or continue the coroutine.
    ///
    /// Returns the values passed to `coroutine.yield` or returned by the body.
    pub fn resume<A: IntoLuaMulti, R: FromLuaMulti>(&self, args: A) -> Result<(CoroutineState, R)> {
        let lua = self.0.lua();
        let state = lua.state()?;

        if self.status()? != ThreadStatus::Resumable {
            return Err(LuaError::InvalidOperation(
                "cannot resume a coroutine that is not suspended".to_string(),
            ));
        }

        let args = args.into_lua_multi(lua)?;
        let nargs = c_int::try_from(args.len()).map_err(|_| LuaError::StackOverflow(args.len()))?;

        let (coroutine_state, results) = unsafe {
            let _guard = StackGuard::new(state);
            let thread = self.native(state)?;
            check_stack(state, nargs + 3)?;
            check_stack(thread, nargs + 1)?;

            // Arguments are built on the caller's stack, then moved
            for arg in args.iter() {
                marshal::push_value(lua, state, arg)?;
            }
            ffi::lua_xmove(state, thread, nargs);

            let mut nresults: c_int = 0;
            let status = {
                let _enter = lua.extra().boundary.enter();
                ffi::lua_resume(thread, state, nargs, &mut nresults)
            };

            match status {
                ffi::LUA_OK | ffi::LUA_YIELD => {
                    check_stack(state, nresults + 3)?;
                    let base = ffi::lua_gettop(state);
                    ffi::lua_xmove(thread, state, nresults);
                    let results = marshal::read_range(lua, state, base + 1, nresults)?;
                    let coroutine_state = if status == ffi::LUA_YIELD {
                        CoroutineState::Yielded
                    } else {
                        CoroutineState::Finished
                    };
                    (coroutine_state, results)
                }
                _ => {
                    check_stack(state, 3)?;
                    ffi::lua_xmove(thread, state, 1);
                    return Err(protect::pop_error(lua.extra(), state, status));
                }
            }
        };

        Ok((coroutine_state, R::from_lua_multi(results, lua)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Lua;
    use crate::LuaFunction;

    #[test]
    fn test_resume_until_finished() {
        let lua = Lua::new().unwrap();
        let body: LuaFunction = lua
            .evaluate("function(a) local b = coroutine.yield(a + 1); return b * 2 end")
            .unwrap();
        let thread = lua.create_thread(&body).unwrap();
        assert_eq!(thread.status().unwrap(), ThreadStatus::Resumable);

        let (state, value): (CoroutineState, i64) = thread.resume(1).unwrap();
        assert_eq!(state, CoroutineState::Yielded);
        assert_eq!(value, 2);

        let (state, value): (CoroutineState, i64) = thread.resume(10).unwrap();
        assert_eq!(state, CoroutineState::Finished);
        assert_eq!(value, 20);
        assert_eq!(thread.status().unwrap(), ThreadStatus::Finished);

        assert!(matches!(
            thread.resume::<_, ()>(()),
            Err(LuaError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_resume_error_marks_thread() {
        let lua = Lua::new().unwrap();
        let body: LuaFunction = lua.evaluate("function() error('inside coroutine') end").unwrap();
        let thread = lua.create_thread(&body).unwrap();

        let err = thread.resume::<_, ()>(()).unwrap_err();
        assert!(err.to_string().contains("inside coroutine"));
        assert_eq!(thread.status().unwrap(), ThreadStatus::Error);
    }

    #[test]
    fn test_main_thread_is_running() {
        let lua = Lua::new().unwrap();
        let main = lua.main_thread().unwrap();
        assert!(main.reference().is_persistent());
        assert_eq!(main.status().unwrap(), ThreadStatus::Running);
    }
}
