//! Host functions
//!
//! A host function is a closure carried by a userdata. [`Lua::create_function`]
//! wraps that userdata in a C closure so scripts see a plain function; the
//! userdata alone is also callable through the built-in descriptor.

use std::any::TypeId;
use std::fmt;
use std::os::raw::c_int;
use std::rc::Rc;

use mlua_sys as ffi;

use crate::convert::{FromLuaMulti, IntoLuaMulti};
use crate::error::{LuaError, Result};
use crate::marshal;
use crate::protect::{callback_boundary, protect_lua_call};
use crate::reference::{LuaFunction, LuaReference, ReferenceKind};
use crate::stack::StackGuard;
use crate::state::Lua;
use crate::value::MultiValue;

use super::descriptor::UserDataDescriptor;
use super::{push_anchored, try_read_handle, HostType, UserDataHandle};

pub type HostCallback = dyn Fn(&Lua, MultiValue) -> Result<MultiValue>;

/// Host closure callable from scripts
#[derive(Clone)]
pub struct HostFunction {
    callback: Rc<HostCallback>,
}

impl HostFunction {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Lua, MultiValue) -> Result<MultiValue> + 'static,
    {
        HostFunction {
            callback: Rc::new(callback),
        }
    }

    /// Wrap a closure with typed arguments and results
    pub fn wrap<A, R, F>(callback: F) -> Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&Lua, A) -> Result<R> + 'static,
    {
        HostFunction::new(move |lua, args| {
            let args = A::from_lua_multi(args, lua)?;
            callback(lua, args)?.into_lua_multi(lua)
        })
    }

    pub fn invoke(&self, lua: &Lua, args: MultiValue) -> Result<MultiValue> {
        (self.callback)(lua, args)
    }
}

impl HostType for HostFunction {
    fn type_name() -> &'static str {
        "function"
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({:p})", Rc::as_ptr(&self.callback) as *const u8)
    }
}

/// Forwards `__call` to the carried [`HostFunction`]
pub(crate) struct FunctionDescriptor;

impl UserDataDescriptor for FunctionDescriptor {
    fn metatable_name(&self) -> &str {
        "function"
    }

    fn call(&self, lua: &Lua, this: &UserDataHandle, args: MultiValue) -> Result<Option<MultiValue>> {
        match this.downcast::<HostFunction>() {
            Some(function) => function.invoke(lua, args).map(Some),
            None => Ok(None),
        }
    }
}

impl Lua {
    /// Create a script function backed by a host closure
    pub fn create_function<A, R, F>(&self, callback: F) -> Result<LuaFunction>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&Lua, A) -> Result<R> + 'static,
    {
        self.create_host_function(HostFunction::wrap(callback))
    }

    pub fn create_host_function(&self, function: HostFunction) -> Result<LuaFunction> {
        let state = self.state()?;
        let descriptor = self
            .extra()
            .descriptors
            .borrow()
            .resolve_type(TypeId::of::<HostFunction>(), &[]);

        unsafe {
            let _guard = StackGuard::new(state);
            push_anchored(
                self,
                state,
                Rc::new(function),
                TypeId::of::<HostFunction>(),
                HostFunction::type_name(),
                descriptor,
            )?;
            protect_lua_call(self.extra(), state, 1, 1, |state| {
                ffi::lua_pushcclosure(state, call_host_function, 1);
            })?;
            Ok(LuaFunction::from_reference(LuaReference::capture(self, state, -1)?))
        }
    }

    /// Wrap a raw C function. It is pushed as is, with no descriptor.
    pub fn create_native_function(&self, function: ffi::lua_CFunction) -> Result<LuaFunction> {
        let state = self.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            protect_lua_call(self.extra(), state, 0, 1, |state| {
                ffi::lua_pushcfunction(state, function);
            })?;
            Ok(LuaFunction::from_reference(LuaReference::capture(self, state, -1)?))
        }
    }
}

unsafe extern "C-unwind" fn call_host_function(state: *mut ffi::lua_State) -> c_int {
    callback_boundary(state, |lua, state| {
        let function = try_read_handle(state, ffi::lua_upvalueindex(1))
            .and_then(|handle| handle.downcast::<HostFunction>())
            .ok_or_else(|| LuaError::runtime("host function upvalue is missing"))?;
        let args = marshal::read_arguments(lua, state, 1)?;
        let results = function.invoke(lua, args)?;
        marshal::push_results(lua, state, results)
    })
}
