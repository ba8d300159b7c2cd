//! Marshaler: native stack slots to and from [`Value`]
//!
//! Every value crossing the boundary goes through [`push_value`] or
//! [`read_value`]. Reference types are captured into registry slots; host
//! objects are handled by the userdata layer.

use std::os::raw::{c_char, c_int};
use std::slice;

use mlua_sys as ffi;

use crate::error::{LuaError, Result};
use crate::protect::{check_stack, protect_lua_call};
use crate::reference::{LuaFunction, LuaReference, LuaTable, LuaThread, LuaUserData, ReferenceKind};
use crate::state::Lua;
use crate::value::{LightUserData, LuaString, MultiValue, Value};

/// Push `value` onto the stack of `state`
pub(crate) unsafe fn push_value(lua: &Lua, state: *mut ffi::lua_State, value: &Value) -> Result<()> {
    check_stack(state, 3)?;

    match value {
        Value::Nil => ffi::lua_pushnil(state),
        Value::Boolean(b) => ffi::lua_pushboolean(state, *b as c_int),
        Value::LightUserData(p) => ffi::lua_pushlightuserdata(state, p.0),
        Value::Integer(i) => ffi::lua_pushinteger(state, *i as ffi::lua_Integer),
        Value::Number(n) => ffi::lua_pushnumber(state, *n as ffi::lua_Number),
        Value::String(s) => push_bytes(lua, state, s.as_bytes())?,
        Value::Table(t) => push_reference(lua, state, t.as_reference())?,
        Value::Function(f) => push_reference(lua, state, f.as_reference())?,
        Value::Thread(t) => push_reference(lua, state, t.as_reference())?,
        Value::UserData(u) => push_reference(lua, state, u.as_reference())?,
    }
    Ok(())
}

/// Push a byte string; interning can allocate, so this is protected
pub(crate) unsafe fn push_bytes(lua: &Lua, state: *mut ffi::lua_State, bytes: &[u8]) -> Result<()> {
    protect_lua_call(lua.extra(), state, 0, 1, |state| {
        ffi::lua_pushlstring(state, bytes.as_ptr() as *const c_char, bytes.len());
    })
}

unsafe fn push_reference(lua: &Lua, state: *mut ffi::lua_State, reference: &LuaReference) -> Result<()> {
    if !reference.lua().ptr_eq(lua) {
        return Err(LuaError::InvalidValue(
            "reference belongs to a different Lua state".to_string(),
        ));
    }
    reference.push_onto(state)
}

/// Read the value at `index` without popping it
pub(crate) unsafe fn read_value(lua: &Lua, state: *mut ffi::lua_State, index: c_int) -> Result<Value> {
    match ffi::lua_type(state, index) {
        ffi::LUA_TNONE => Err(LuaError::InvalidValue(format!("stack index {} is not valid", index))),
        ffi::LUA_TNIL => Ok(Value::Nil),
        ffi::LUA_TBOOLEAN => Ok(Value::Boolean(ffi::lua_toboolean(state, index) != 0)),
        ffi::LUA_TLIGHTUSERDATA => Ok(Value::LightUserData(LightUserData(ffi::lua_touserdata(state, index)))),
        ffi::LUA_TNUMBER => {
            if ffi::lua_isinteger(state, index) != 0 {
                Ok(Value::Integer(ffi::lua_tointegerx(state, index, std::ptr::null_mut()) as i64))
            } else {
                Ok(Value::Number(ffi::lua_tonumberx(state, index, std::ptr::null_mut()) as f64))
            }
        }
        ffi::LUA_TSTRING => {
            let mut len = 0usize;
            let ptr = ffi::lua_tolstring(state, index, &mut len);
            let bytes = if ptr.is_null() {
                Vec::new()
            } else {
                slice::from_raw_parts(ptr as *const u8, len).to_vec()
            };
            Ok(Value::String(LuaString::from(bytes)))
        }
        ffi::LUA_TTABLE => Ok(Value::Table(LuaTable::from_reference(LuaReference::capture(lua, state, index)?))),
        ffi::LUA_TFUNCTION => Ok(Value::Function(LuaFunction::from_reference(LuaReference::capture(
            lua, state, index,
        )?))),
        ffi::LUA_TTHREAD => Ok(Value::Thread(LuaThread::from_reference(LuaReference::capture(lua, state, index)?))),
        ffi::LUA_TUSERDATA => Ok(Value::UserData(LuaUserData::from_reference(LuaReference::capture(
            lua, state, index,
        )?))),
        other => Err(LuaError::InvalidValue(format!("unknown native type tag {}", other))),
    }
}

/// Read `count` values starting at absolute index `start`
pub(crate) unsafe fn read_range(lua: &Lua, state: *mut ffi::lua_State, start: c_int, count: c_int) -> Result<MultiValue> {
    let mut values = MultiValue::with_capacity(count.max(0) as usize);
    for index in start..start + count {
        values.push(read_value(lua, state, index)?);
    }
    Ok(values)
}

/// Read every value from `start` to the top, as call arguments
pub(crate) unsafe fn read_arguments(lua: &Lua, state: *mut ffi::lua_State, start: c_int) -> Result<MultiValue> {
    let top = ffi::lua_gettop(state);
    read_range(lua, state, start, (top - start + 1).max(0))
}

/// Push call results and return how many were pushed
pub(crate) unsafe fn push_results(lua: &Lua, state: *mut ffi::lua_State, results: MultiValue) -> Result<c_int> {
    let count = c_int::try_from(results.len()).map_err(|_| LuaError::StackOverflow(results.len()))?;
    check_stack(state, count)?;
    for value in results.iter() {
        push_value(lua, state, value)?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackGuard;

    #[test]
    fn test_scalar_round_trip_through_stack() {
        let lua = Lua::new().unwrap();
        let state = lua.state().unwrap();

        let values = vec![
            Value::Nil,
            Value::Boolean(true),
            Value::Integer(-7),
            Value::Number(2.5),
            Value::String(LuaString::from("caf\u{e9}")),
        ];

        unsafe {
            let _guard = StackGuard::new(state);
            for value in &values {
                push_value(&lua, state, value).unwrap();
                let read = read_value(&lua, state, -1).unwrap();
                assert_eq!(&read, value);
            }
        }
    }

    #[test]
    fn test_table_value_keeps_identity() {
        let lua = Lua::new().unwrap();
        let table = lua.create_table().unwrap();
        let state = lua.state().unwrap();

        unsafe {
            let _guard = StackGuard::new(state);
            push_value(&lua, state, &Value::Table(table.try_clone().unwrap())).unwrap();
            match read_value(&lua, state, -1).unwrap() {
                Value::Table(read) => assert_eq!(read, table),
                other => panic!("expected a table, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_foreign_reference_rejected() {
        let first = Lua::new().unwrap();
        let second = Lua::new().unwrap();
        let table = first.create_table().unwrap();
        let state = second.state().unwrap();

        unsafe {
            let _guard = StackGuard::new(state);
            let err = push_value(&second, state, &Value::Table(table)).unwrap_err();
            assert!(matches!(err, LuaError::InvalidValue(_)));
        }
    }
}
