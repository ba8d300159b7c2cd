//! Activation records
//!
//! Host-side copies of `lua_Debug`, used by hooks and by function
//! introspection.

use std::ffi::CStr;
use std::marker::PhantomData;
use std::os::raw::{c_char, c_int};

use mlua_sys as ffi;

use crate::error::Result;
use crate::protect::check_stack;
use crate::state::Lua;

/// Information about a function or a running call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRecord {
    /// Name the function was called by, when one can be found
    pub name: Option<String>,
    /// `global`, `local`, `method`, `field`, `upvalue` or empty
    pub name_what: String,
    /// `Lua`, `C` or `main`
    pub what: String,
    pub source: String,
    pub short_source: String,
    pub current_line: Option<i32>,
    pub line_defined: Option<i32>,
    pub last_line_defined: Option<i32>,
    pub upvalue_count: u8,
    pub parameter_count: u8,
    pub is_vararg: bool,
    pub is_tail_call: bool,
}

unsafe fn owned(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

fn line(value: c_int) -> Option<i32> {
    (value >= 0).then_some(value)
}

impl ActivationRecord {
    /// Copy the fields filled in by `lua_getinfo`
    pub(crate) unsafe fn from_debug(ar: &ffi::lua_Debug) -> Self {
        ActivationRecord {
            name: owned(ar.name),
            name_what: owned(ar.namewhat).unwrap_or_default(),
            what: owned(ar.what).unwrap_or_default(),
            source: owned(ar.source).unwrap_or_default(),
            short_source: owned(ar.short_src.as_ptr()).unwrap_or_default(),
            current_line: line(ar.currentline),
            line_defined: line(ar.linedefined),
            last_line_defined: line(ar.lastlinedefined),
            upvalue_count: ar.nups,
            parameter_count: ar.nparams,
            is_vararg: ar.isvararg != 0,
            is_tail_call: ar.istailcall != 0,
        }
    }
}

/// Access to the activation record of the call a hook fired in.
///
/// The record is only read when asked for.
pub struct DebugInfo<'a> {
    state: *mut ffi::lua_State,
    ar: *mut ffi::lua_Debug,
    _marker: PhantomData<&'a ffi::lua_Debug>,
}

impl DebugInfo<'_> {
    pub(crate) unsafe fn new(state: *mut ffi::lua_State, ar: *mut ffi::lua_Debug) -> Self {
        DebugInfo {
            state,
            ar,
            _marker: PhantomData,
        }
    }

    /// Line about to run, for line events
    pub fn current_line(&self) -> Option<i32> {
        unsafe {
            ffi::lua_getinfo(self.state, c"l".as_ptr(), self.ar);
            line((*self.ar).currentline)
        }
    }

    pub fn record(&self) -> ActivationRecord {
        unsafe {
            ffi::lua_getinfo(self.state, c"nSltu".as_ptr(), self.ar);
            ActivationRecord::from_debug(&*self.ar)
        }
    }
}

impl Lua {
    /// Activation record of the call at `level` of the current thread.
    ///
    /// Level 0 is the running function, level 1 its caller. Returns `None`
    /// past the deepest call.
    pub fn activation(&self, level: c_int) -> Result<Option<ActivationRecord>> {
        let state = self.state()?;
        unsafe {
            check_stack(state, 2)?;
            let mut ar: ffi::lua_Debug = std::mem::zeroed();
            if ffi::lua_getstack(state, level, &mut ar) == 0 {
                return Ok(None);
            }
            ffi::lua_getinfo(state, c"nSltu".as_ptr(), &mut ar);
            Ok(Some(ActivationRecord::from_debug(&ar)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::state::Lua;

    #[test]
    fn test_activation_inside_callback() {
        let lua = Lua::new().unwrap();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let inspect = lua
            .create_function(move |lua, ()| {
                *sink.borrow_mut() = lua.activation(1)?;
                Ok(())
            })
            .unwrap();
        lua.set_global("inspect", inspect).unwrap();

        lua.load("local function caller()\n  inspect()\nend\ncaller()", "=activation_test")
            .unwrap()
            .call::<_, ()>(())
            .unwrap();

        let record = seen.borrow_mut().take().unwrap();
        assert_eq!(record.what, "Lua");
        assert_eq!(record.short_source, "activation_test");
        assert_eq!(record.current_line, Some(2));
        assert_eq!(record.name.as_deref(), Some("caller"));
    }

    #[test]
    fn test_activation_past_stack_is_none() {
        let lua = Lua::new().unwrap();
        assert!(lua.activation(5).unwrap().is_none());
    }
}
