//! Stack accessor and snapshots
//!
//! Most of the crate talks to the native stack directly inside `unsafe`
//! blocks and relies on [`StackGuard`] to leave it balanced. [`LuaStack`]
//! exposes the same operations to embedders with bounds and type checks.

use std::os::raw::c_int;

use mlua_sys as ffi;

use crate::convert::IntoLua;
use crate::error::{LuaError, Result};
use crate::marshal;
use crate::protect::check_stack;
use crate::reference::LuaReference;
use crate::state::Lua;
use crate::value::{Value, ValueType};

/// Restores the stack to its recorded height when dropped
pub(crate) struct StackGuard {
    state: *mut ffi::lua_State,
    top: c_int,
}

impl StackGuard {
    /// # Safety
    ///
    /// `state` must stay open for the lifetime of the guard.
    pub(crate) unsafe fn new(state: *mut ffi::lua_State) -> Self {
        StackGuard {
            state,
            top: ffi::lua_gettop(state),
        }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        unsafe {
            if ffi::lua_gettop(self.state) > self.top {
                ffi::lua_settop(self.state, self.top);
            }
        }
    }
}

/// Checked access to the stack of the current thread
pub struct LuaStack<'lua> {
    lua: &'lua Lua,
    state: *mut ffi::lua_State,
}

impl Lua {
    /// Stack of the current thread
    pub fn stack(&self) -> Result<LuaStack<'_>> {
        Ok(LuaStack {
            lua: self,
            state: self.state()?,
        })
    }
}

impl<'lua> LuaStack<'lua> {
    fn state(&self) -> Result<*mut ffi::lua_State> {
        // Fails once the state is closed
        self.lua.state()?;
        Ok(self.state)
    }

    /// Number of values on the stack
    pub fn count(&self) -> Result<usize> {
        let state = self.state()?;
        Ok(unsafe { ffi::lua_gettop(state) } as usize)
    }

    /// Make room for `additional` values
    pub fn ensure_free_capacity(&self, additional: usize) -> Result<()> {
        let state = self.state()?;
        let additional = c_int::try_from(additional).map_err(|_| LuaError::StackOverflow(additional))?;
        unsafe { check_stack(state, additional) }
    }

    pub fn push<V: IntoLua>(&self, value: V) -> Result<()> {
        let state = self.state()?;
        let value = value.into_lua(self.lua)?;
        unsafe { marshal::push_value(self.lua, state, &value) }
    }

    /// Pop the top value
    pub fn pop(&self) -> Result<Value> {
        let state = self.state()?;
        unsafe {
            if ffi::lua_gettop(state) == 0 {
                return Err(LuaError::InvalidOperation("the stack is empty".to_string()));
            }
            let value = marshal::read_value(self.lua, state, -1)?;
            ffi::lua_pop(state, 1);
            Ok(value)
        }
    }

    /// Pop `count` values without reading them
    pub fn discard(&self, count: usize) -> Result<()> {
        let state = self.state()?;
        unsafe {
            let top = ffi::lua_gettop(state) as usize;
            if count > top {
                return Err(LuaError::InvalidOperation(format!(
                    "cannot pop {} values from a stack of {}",
                    count, top
                )));
            }
            ffi::lua_settop(state, (top - count) as c_int);
        }
        Ok(())
    }

    /// Read the value at `index` without removing it
    pub fn peek(&self, index: c_int) -> Result<Value> {
        let state = self.state()?;
        let index = self.checked_index(index)?;
        unsafe { marshal::read_value(self.lua, state, index) }
    }

    /// Move the top value to `index`, shifting the values above it up
    pub fn insert(&self, index: c_int) -> Result<()> {
        let state = self.state()?;
        let index = self.checked_index(index)?;
        unsafe { ffi::lua_rotate(state, index, 1) };
        Ok(())
    }

    /// Remove the value at `index`, shifting the values above it down
    pub fn remove(&self, index: c_int) -> Result<Value> {
        let state = self.state()?;
        let index = self.checked_index(index)?;
        unsafe {
            let value = marshal::read_value(self.lua, state, index)?;
            ffi::lua_rotate(state, index, -1);
            ffi::lua_pop(state, 1);
            Ok(value)
        }
    }

    /// Read `count` consecutive values starting at `index`
    pub fn range(&self, index: c_int, count: usize) -> Result<Vec<Value>> {
        let state = self.state()?;
        let start = self.checked_index(index)?;
        let top = unsafe { ffi::lua_gettop(state) };
        if start as usize + count > top as usize + 1 {
            return Err(LuaError::InvalidValue(format!(
                "range of {} values at index {} exceeds stack of {}",
                count, index, top
            )));
        }
        unsafe { marshal::read_range(self.lua, state, start, count as c_int) }.map(|values| values.into_vec())
    }

    pub fn type_of(&self, index: c_int) -> Result<ValueType> {
        let state = self.state()?;
        Ok(ValueType::from_native(unsafe { ffi::lua_type(state, index) }))
    }

    /// Capture the value at `index` into a registry reference
    pub fn capture(&self, index: c_int) -> Result<LuaReference> {
        let state = self.state()?;
        let index = self.checked_index(index)?;
        unsafe { LuaReference::capture(self.lua, state, index) }
    }

    /// Record the current height; the stack is restored to it when the snapshot drops
    pub fn snapshot(&self) -> Result<StackSnapshot<'lua>> {
        let state = self.state()?;
        Ok(StackSnapshot {
            lua: self.lua,
            state,
            top: unsafe { ffi::lua_gettop(state) },
        })
    }

    /// Convert a relative index into an absolute one, checking it is in range
    fn checked_index(&self, index: c_int) -> Result<c_int> {
        let top = unsafe { ffi::lua_gettop(self.state) };
        let absolute = if index < 0 { top + index + 1 } else { index };
        if absolute < 1 || absolute > top {
            return Err(LuaError::InvalidValue(format!(
                "stack index {} is out of range (stack has {} values)",
                index, top
            )));
        }
        Ok(absolute)
    }
}

/// Scoped record of the stack height.
///
/// Surplus values are popped when the snapshot is dropped, on every exit
/// path. Values popped below the recorded height are not restored.
pub struct StackSnapshot<'lua> {
    lua: &'lua Lua,
    state: *mut ffi::lua_State,
    top: c_int,
}

impl StackSnapshot<'_> {
    /// Height recorded when the snapshot was taken
    pub fn recorded_count(&self) -> usize {
        self.top as usize
    }
}

impl Drop for StackSnapshot<'_> {
    fn drop(&mut self) {
        if self.lua.is_closed() {
            return;
        }
        unsafe {
            if ffi::lua_gettop(self.state) > self.top {
                ffi::lua_settop(self.state, self.top);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_and_count() {
        let lua = Lua::new().unwrap();
        let stack = lua.stack().unwrap();

        stack.push(1i64).unwrap();
        stack.push("two").unwrap();
        stack.push(true).unwrap();
        assert_eq!(stack.count().unwrap(), 3);

        assert_eq!(stack.type_of(2).unwrap(), ValueType::String);
        assert_eq!(stack.pop().unwrap(), Value::Boolean(true));
        assert_eq!(stack.peek(-1).unwrap().as_str(), Some("two"));

        stack.discard(2).unwrap();
        assert_eq!(stack.count().unwrap(), 0);
        assert!(stack.pop().is_err());
    }

    #[test]
    fn test_insert_and_range() {
        let lua = Lua::new().unwrap();
        let stack = lua.stack().unwrap();

        stack.push(1i64).unwrap();
        stack.push(2i64).unwrap();
        stack.push(0i64).unwrap();
        stack.insert(1).unwrap();

        let values = stack.range(1, 3).unwrap();
        let values: Vec<i64> = values.iter().filter_map(Value::as_integer).collect();
        assert_eq!(values, vec![0, 1, 2]);

        assert!(stack.range(2, 5).is_err());
        stack.discard(3).unwrap();
    }

    #[test]
    fn test_snapshot_pops_surplus() {
        let lua = Lua::new().unwrap();
        let stack = lua.stack().unwrap();
        stack.push(1i64).unwrap();

        {
            let snapshot = stack.snapshot().unwrap();
            assert_eq!(snapshot.recorded_count(), 1);
            for i in 0..5i64 {
                stack.push(i).unwrap();
            }
        }

        assert_eq!(stack.count().unwrap(), 1);
        stack.discard(1).unwrap();
    }

    #[test]
    fn test_out_of_range_index() {
        let lua = Lua::new().unwrap();
        let stack = lua.stack().unwrap();
        assert!(matches!(stack.peek(1), Err(LuaError::InvalidValue(_))));
        assert!(matches!(stack.capture(-1), Err(LuaError::InvalidValue(_))));
    }

    #[test]
    fn test_ensure_free_capacity() {
        let lua = Lua::new().unwrap();
        let stack = lua.stack().unwrap();
        stack.ensure_free_capacity(100).unwrap();
        assert!(matches!(
            stack.ensure_free_capacity(usize::MAX),
            Err(LuaError::StackOverflow(_))
        ));
    }
}
