//! Function references

use std::os::raw::c_int;

use mlua_sys as ffi;

use crate::convert::{FromLuaMulti, IntoLuaMulti};
use crate::debug::ActivationRecord;
use crate::error::{LuaError, Result};
use crate::marshal;
use crate::protect::{self, check_stack};
use crate::stack::StackGuard;
use crate::value::ValueType;

use super::typed_reference;

typed_reference!(
    /// Reference to a Lua or native function
    LuaFunction,
    ValueType::Function
);

impl LuaFunction {
    /// Call inside a protection frame.
    ///
    /// Script errors come back as [`LuaError::Runtime`]; an error raised by a
    /// host callback is preserved as the cause.
    pub fn call<A: IntoLuaMulti, R: FromLuaMulti>(&self, args: A) -> Result<R> {
        let lua = self.0.lua();
        let state = lua.state()?;
        let args = args.into_lua_multi(lua)?;
        let nargs = c_int::try_from(args.len()).map_err(|_| LuaError::StackOverflow(args.len()))?;

        let results = unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, nargs + 3)?;
            let base = ffi::lua_gettop(state);

            self.0.push_onto(state)?;
            for arg in args.iter() {
                marshal::push_value(lua, state, arg)?;
            }
            protect::pcall(lua.extra(), state, nargs, ffi::LUA_MULTRET)?;

            let nresults = ffi::lua_gettop(state) - base;
            marshal::read_range(lua, state, base + 1, nresults)?
        };
        R::from_lua_multi(results, lua)
    }

    /// Call with no protection frame.
    ///
    /// An error raised by the callee reaches the panic handler and is
    /// returned as [`LuaError::Panic`]; the state can only be closed
    /// afterwards. Only allowed when no protected call is active.
    pub fn call_unprotected<A: IntoLuaMulti, R: FromLuaMulti>(&self, args: A) -> Result<R> {
        let lua = self.0.lua();
        let state = lua.state()?;
        if lua.extra().boundary.depth() > 0 {
            return Err(LuaError::InvalidOperation(
                "unprotected calls are not allowed inside a protected call".to_string(),
            ));
        }

        let args = args.into_lua_multi(lua)?;
        let nargs = c_int::try_from(args.len()).map_err(|_| LuaError::StackOverflow(args.len()))?;

        let results = protect::catch_lua_panic(|| unsafe {
            check_stack(state, nargs + 3)?;
            let base = ffi::lua_gettop(state);

            self.0.push_onto(state)?;
            for arg in args.iter() {
                marshal::push_value(lua, state, arg)?;
            }
            ffi::lua_call(state, nargs, ffi::LUA_MULTRET);

            let nresults = ffi::lua_gettop(state) - base;
            let results = marshal::read_range(lua, state, base + 1, nresults);
            ffi::lua_settop(state, base);
            results
        })?;
        R::from_lua_multi(results, lua)
    }

    /// Whether this is a C function rather than a Lua closure
    pub fn is_native(&self) -> Result<bool> {
        let state = self.0.lua().state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.0.push_onto(state)?;
            Ok(ffi::lua_iscfunction(state, -1) != 0)
        }
    }

    /// Definition site of the function
    pub fn info(&self) -> Result<ActivationRecord> {
        let state = self.0.lua().state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 2)?;
            self.0.push_onto(state)?;
            let mut ar: ffi::lua_Debug = std::mem::zeroed();
            // '>' pops the function; 'n', 'l' and 't' are meaningless outside a call
            ffi::lua_getinfo(state, c">Su".as_ptr(), &mut ar);
            Ok(ActivationRecord::from_debug(&ar))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::LuaError;
    use crate::state::Lua;
    use crate::LuaFunction;

    #[test]
    fn test_call_returns_multiple_values() {
        let lua = Lua::new().unwrap();
        let function: LuaFunction = lua.evaluate("function(a, b) return a + b, a * b end").unwrap();

        let (sum, product): (i64, i64) = function.call((3, 4)).unwrap();
        assert_eq!(sum, 7);
        assert_eq!(product, 12);
        assert!(!function.is_native().unwrap());
    }

    #[test]
    fn test_script_error_is_runtime() {
        let lua = Lua::new().unwrap();
        let function: LuaFunction = lua.evaluate("function() error('bad thing') end").unwrap();

        let err = function.call::<_, ()>(()).unwrap_err();
        match err {
            LuaError::Runtime { message, cause } => {
                assert!(message.contains("bad thing"));
                assert!(cause.is_none());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_stack_balanced_after_error() {
        let lua = Lua::new().unwrap();
        let function: LuaFunction = lua.evaluate("function() local t = nil; return t.x end").unwrap();
        let before = lua.stack().unwrap().count().unwrap();

        assert!(function.call::<_, ()>(()).is_err());
        assert_eq!(lua.stack().unwrap().count().unwrap(), before);
    }

    #[test]
    fn test_unprotected_call_success() {
        let lua = Lua::new().unwrap();
        let function: LuaFunction = lua.evaluate("function(x) return x * 2 end").unwrap();
        let doubled: i64 = function.call_unprotected(21).unwrap();
        assert_eq!(doubled, 42);
    }

    #[test]
    fn test_info_reports_definition() {
        let lua = Lua::new().unwrap();
        let function: LuaFunction = lua.evaluate("function(a, b, ...) end").unwrap();
        let info = function.info().unwrap();
        assert_eq!(info.what, "Lua");
        assert_eq!(info.parameter_count, 2);
        assert!(info.is_vararg);
    }
}
