//! Shared userdata metatables
//!
//! One metatable exists per descriptor name and state, created on first use
//! and kept in the registry under `ferrolua.userdata:<name>`. Every
//! metamethod forwards to the descriptor of the userdata it was called on.
//! Userdata without a descriptor get a metatable with `__gc` only. The
//! metatables are hidden from `getmetatable`.

use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use mlua_sys as ffi;

use crate::error::{LuaError, Result};
use crate::marshal;
use crate::protect::{callback_boundary, check_stack, panic_message, protect_lua_call};
use crate::state::{ExtraData, Lua};
use crate::value::Value;

use super::descriptor::{ArithmeticOp, ComparisonOp, UserDataDescriptor};
use super::{host_cell, try_read_handle, UserDataHandle};

const PLAIN_METATABLE: &CStr = c"ferrolua.userdata";

const ARITHMETIC: [(ArithmeticOp, &CStr); 14] = [
    (ArithmeticOp::Add, c"__add"),
    (ArithmeticOp::Sub, c"__sub"),
    (ArithmeticOp::Mul, c"__mul"),
    (ArithmeticOp::Div, c"__div"),
    (ArithmeticOp::Mod, c"__mod"),
    (ArithmeticOp::Pow, c"__pow"),
    (ArithmeticOp::IntDiv, c"__idiv"),
    (ArithmeticOp::Unm, c"__unm"),
    (ArithmeticOp::BitAnd, c"__band"),
    (ArithmeticOp::BitOr, c"__bor"),
    (ArithmeticOp::BitXor, c"__bxor"),
    (ArithmeticOp::Shl, c"__shl"),
    (ArithmeticOp::Shr, c"__shr"),
    (ArithmeticOp::BitNot, c"__bnot"),
];

const COMPARISON: [(ComparisonOp, &CStr); 3] = [
    (ComparisonOp::Eq, c"__eq"),
    (ComparisonOp::Lt, c"__lt"),
    (ComparisonOp::Le, c"__le"),
];

/// Push the metatable for userdata with `descriptor`, creating it if needed
pub(crate) unsafe fn push_metatable(
    lua: &Lua,
    state: *mut ffi::lua_State,
    descriptor: Option<&dyn UserDataDescriptor>,
) -> Result<()> {
    check_stack(state, 4)?;

    let name = match descriptor {
        Some(descriptor) => CString::new(format!("ferrolua.userdata:{}", descriptor.metatable_name()))
            .map_err(|_| LuaError::InvalidValue("metatable name contains a NUL byte".to_string()))?,
        None => PLAIN_METATABLE.to_owned(),
    };
    let with_behavior = descriptor.is_some();
    let name_ptr = name.as_ptr();

    // Registered under its name only once complete, so a failure part way
    // never leaves a metatable without `__gc` behind.
    let created = protect_lua_call(lua.extra(), state, 0, 1, |state| {
        if ffi::lua_getfield(state, ffi::LUA_REGISTRYINDEX, name_ptr) != ffi::LUA_TNIL {
            return false;
        }
        ffi::lua_pop(state, 1);

        ffi::lua_createtable(state, 0, 32);
        ffi::lua_pushstring(state, name_ptr);
        ffi::lua_setfield(state, -2, c"__name".as_ptr());
        ffi::lua_pushcfunction(state, meta_gc);
        ffi::lua_setfield(state, -2, c"__gc".as_ptr());
        ffi::lua_pushboolean(state, 0);
        ffi::lua_setfield(state, -2, c"__metatable".as_ptr());

        if with_behavior {
            ffi::lua_pushcfunction(state, meta_index);
            ffi::lua_setfield(state, -2, c"__index".as_ptr());
            ffi::lua_pushcfunction(state, meta_newindex);
            ffi::lua_setfield(state, -2, c"__newindex".as_ptr());
            ffi::lua_pushcfunction(state, meta_call);
            ffi::lua_setfield(state, -2, c"__call".as_ptr());
            ffi::lua_pushcfunction(state, meta_len);
            ffi::lua_setfield(state, -2, c"__len".as_ptr());
            ffi::lua_pushcfunction(state, meta_concat);
            ffi::lua_setfield(state, -2, c"__concat".as_ptr());
            ffi::lua_pushcfunction(state, meta_tostring);
            ffi::lua_setfield(state, -2, c"__tostring".as_ptr());
            ffi::lua_pushcfunction(state, meta_close);
            ffi::lua_setfield(state, -2, c"__close".as_ptr());

            for (position, (_, event)) in ARITHMETIC.iter().enumerate() {
                ffi::lua_pushinteger(state, position as ffi::lua_Integer);
                ffi::lua_pushcclosure(state, meta_arithmetic, 1);
                ffi::lua_setfield(state, -2, event.as_ptr());
            }
            for (position, (_, event)) in COMPARISON.iter().enumerate() {
                ffi::lua_pushinteger(state, position as ffi::lua_Integer);
                ffi::lua_pushcclosure(state, meta_compare, 1);
                ffi::lua_setfield(state, -2, event.as_ptr());
            }
        }

        ffi::lua_pushvalue(state, -1);
        ffi::lua_setfield(state, ffi::LUA_REGISTRYINDEX, name_ptr);
        true
    })?;

    if created {
        tracing::debug!(name = %name.to_string_lossy(), "created userdata metatable");
    }
    Ok(())
}

unsafe fn upvalue_position(state: *mut ffi::lua_State) -> usize {
    ffi::lua_tointegerx(state, ffi::lua_upvalueindex(1), ptr::null_mut()) as usize
}

unsafe fn this_handle(state: *mut ffi::lua_State) -> Result<(UserDataHandle, Rc<dyn UserDataDescriptor>)> {
    let handle = try_read_handle(state, 1).ok_or_else(|| LuaError::runtime("host userdata expected"))?;
    with_descriptor(handle)
}

/// Handle of whichever operand of a binary metamethod is a host userdata
unsafe fn operand_handle(state: *mut ffi::lua_State) -> Result<(UserDataHandle, Rc<dyn UserDataDescriptor>)> {
    let handle = try_read_handle(state, 1)
        .filter(|handle| handle.descriptor().is_some())
        .or_else(|| try_read_handle(state, 2))
        .ok_or_else(|| LuaError::runtime("host userdata expected"))?;
    with_descriptor(handle)
}

fn with_descriptor(handle: UserDataHandle) -> Result<(UserDataHandle, Rc<dyn UserDataDescriptor>)> {
    let descriptor = handle
        .descriptor()
        .cloned()
        .ok_or_else(|| LuaError::runtime(format!("{} has no descriptor", handle.type_name())))?;
    Ok((handle, descriptor))
}

unsafe fn push_single(lua: &Lua, state: *mut ffi::lua_State, value: &Value) -> Result<c_int> {
    marshal::push_value(lua, state, value)?;
    Ok(1)
}

unsafe extern "C-unwind" fn meta_index(state: *mut ffi::lua_State) -> c_int {
    callback_boundary(state, |lua, state| {
        let (handle, descriptor) = this_handle(state)?;
        let key = marshal::read_value(lua, state, 2)?;
        let described = key.describe_key();
        match descriptor.index(lua, &handle, key)? {
            Some(value) => push_single(lua, state, &value),
            None => Err(LuaError::runtime(format!(
                "attempt to index a userdata value ({})",
                described
            ))),
        }
    })
}

unsafe extern "C-unwind" fn meta_newindex(state: *mut ffi::lua_State) -> c_int {
    callback_boundary(state, |lua, state| {
        let (handle, descriptor) = this_handle(state)?;
        let key = marshal::read_value(lua, state, 2)?;
        let value = marshal::read_value(lua, state, 3)?;
        let described = key.describe_key();
        if descriptor.new_index(lua, &handle, key, value)? {
            Ok(0)
        } else {
            Err(LuaError::runtime(format!(
                "attempt to index a userdata value ({})",
                described
            )))
        }
    })
}

unsafe extern "C-unwind" fn meta_call(state: *mut ffi::lua_State) -> c_int {
    callback_boundary(state, |lua, state| {
        let (handle, descriptor) = this_handle(state)?;
        let args = marshal::read_arguments(lua, state, 2)?;
        match descriptor.call(lua, &handle, args)? {
            Some(results) => marshal::push_results(lua, state, results),
            None => Err(LuaError::runtime("attempt to call a userdata value")),
        }
    })
}

unsafe extern "C-unwind" fn meta_arithmetic(state: *mut ffi::lua_State) -> c_int {
    callback_boundary(state, |lua, state| {
        let op = ARITHMETIC
            .get(upvalue_position(state))
            .map(|(op, _)| *op)
            .ok_or_else(|| LuaError::runtime("unknown arithmetic metamethod"))?;
        let (_, descriptor) = operand_handle(state)?;
        let left = marshal::read_value(lua, state, 1)?;
        let right = marshal::read_value(lua, state, 2)?;
        match descriptor.arithmetic(lua, op, left, right)? {
            Some(value) => push_single(lua, state, &value),
            None => Err(LuaError::runtime(op.unsupported_message())),
        }
    })
}

unsafe extern "C-unwind" fn meta_compare(state: *mut ffi::lua_State) -> c_int {
    callback_boundary(state, |lua, state| {
        let op = COMPARISON
            .get(upvalue_position(state))
            .map(|(op, _)| *op)
            .ok_or_else(|| LuaError::runtime("unknown comparison metamethod"))?;
        let (_, descriptor) = operand_handle(state)?;
        let left = marshal::read_value(lua, state, 1)?;
        let right = marshal::read_value(lua, state, 2)?;
        let outcome = match descriptor.compare(lua, op, left, right)? {
            Some(outcome) => outcome,
            None if op == ComparisonOp::Eq => ffi::lua_rawequal(state, 1, 2) != 0,
            None => return Err(LuaError::runtime("attempt to compare two userdata values")),
        };
        ffi::lua_pushboolean(state, outcome as c_int);
        Ok(1)
    })
}

unsafe extern "C-unwind" fn meta_len(state: *mut ffi::lua_State) -> c_int {
    callback_boundary(state, |lua, state| {
        let (handle, descriptor) = this_handle(state)?;
        match descriptor.length(lua, &handle)? {
            Some(value) => push_single(lua, state, &value),
            None => Err(LuaError::runtime("attempt to get length of a userdata value")),
        }
    })
}

unsafe extern "C-unwind" fn meta_concat(state: *mut ffi::lua_State) -> c_int {
    callback_boundary(state, |lua, state| {
        let (_, descriptor) = operand_handle(state)?;
        let left = marshal::read_value(lua, state, 1)?;
        let right = marshal::read_value(lua, state, 2)?;
        match descriptor.concat(lua, left, right)? {
            Some(value) => push_single(lua, state, &value),
            None => Err(LuaError::runtime("attempt to concatenate a userdata value")),
        }
    })
}

unsafe extern "C-unwind" fn meta_tostring(state: *mut ffi::lua_State) -> c_int {
    callback_boundary(state, |lua, state| {
        let (handle, descriptor) = this_handle(state)?;
        let text = match descriptor.to_string(lua, &handle)? {
            Some(text) => text,
            None => format!("{:?}", handle),
        };
        marshal::push_bytes(lua, state, text.as_bytes())?;
        Ok(1)
    })
}

unsafe extern "C-unwind" fn meta_close(state: *mut ffi::lua_State) -> c_int {
    callback_boundary(state, |lua, state| {
        let (handle, descriptor) = this_handle(state)?;
        let error = if ffi::lua_gettop(state) >= 2 {
            marshal::read_value(lua, state, 2)?
        } else {
            Value::Nil
        };
        descriptor.close(lua, &handle, error)?;
        Ok(0)
    })
}

/// Release the anchor. Runs during collection and while the state closes,
/// so it never raises and does not need the owning [`Lua`]. Scripts can reach
/// `__gc` and call it on any value, so anything but a host userdata is ignored.
unsafe extern "C-unwind" fn meta_gc(state: *mut ffi::lua_State) -> c_int {
    let Some(cell) = host_cell(state, 1) else {
        return 0;
    };
    let Some(anchor) = (*cell).anchor.take() else {
        return 0;
    };

    let type_name = anchor.type_name;
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(anchor))) {
        let message = panic_message(payload.as_ref());
        tracing::warn!(type_name, %message, "host object destructor panicked");
        ExtraData::from_state(state).emit_warning(&format!(
            "finalizer of {} panicked: {}",
            type_name, message
        ));
    }
    0
}

