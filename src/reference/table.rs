//! Table references

use mlua_sys as ffi;

use crate::convert::{FromLua, IntoLua};
use crate::error::Result;
use crate::marshal;
use crate::protect::{check_stack, protect_lua_call};
use crate::stack::StackGuard;
use crate::value::{Value, ValueType};

use super::{typed_reference, ReferenceKind};

typed_reference!(
    /// Reference to a table
    LuaTable,
    ValueType::Table
);

impl LuaTable {
    /// `table[key]`, honoring `__index`
    pub fn get<K: IntoLua, V: FromLua>(&self, key: K) -> Result<V> {
        let lua = self.0.lua();
        let state = lua.state()?;
        let key = key.into_lua(lua)?;

        let value = unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 4)?;
            self.0.push_onto(state)?;
            marshal::push_value(lua, state, &key)?;
            protect_lua_call(lua.extra(), state, 2, 1, |state| {
                ffi::lua_gettable(state, 1);
            })?;
            marshal::read_value(lua, state, -1)?
        };
        V::from_lua(value, lua)
    }

    /// `table[key] = value`, honoring `__newindex`
    pub fn set<K: IntoLua, V: IntoLua>(&self, key: K, value: V) -> Result<()> {
        let lua = self.0.lua();
        let state = lua.state()?;
        let key = key.into_lua(lua)?;
        let value = value.into_lua(lua)?;

        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 5)?;
            self.0.push_onto(state)?;
            marshal::push_value(lua, state, &key)?;
            marshal::push_value(lua, state, &value)?;
            protect_lua_call(lua.extra(), state, 3, 0, |state| {
                ffi::lua_settable(state, 1);
            })
        }
    }

    /// Read without invoking metamethods
    pub fn raw_get<K: IntoLua, V: FromLua>(&self, key: K) -> Result<V> {
        let lua = self.0.lua();
        let state = lua.state()?;
        let key = key.into_lua(lua)?;

        let value = unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 3)?;
            self.0.push_onto(state)?;
            marshal::push_value(lua, state, &key)?;
            ffi::lua_rawget(state, -2);
            marshal::read_value(lua, state, -1)?
        };
        V::from_lua(value, lua)
    }

    /// Write without invoking metamethods
    pub fn raw_set<K: IntoLua, V: IntoLua>(&self, key: K, value: V) -> Result<()> {
        let lua = self.0.lua();
        let state = lua.state()?;
        let key = key.into_lua(lua)?;
        let value = value.into_lua(lua)?;

        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 5)?;
            self.0.push_onto(state)?;
            marshal::push_value(lua, state, &key)?;
            marshal::push_value(lua, state, &value)?;
            // Raises on nil or NaN keys and may grow the table
            protect_lua_call(lua.extra(), state, 3, 0, |state| {
                ffi::lua_rawset(state, 1);
            })
        }
    }

    pub fn contains_key<K: IntoLua>(&self, key: K) -> Result<bool> {
        let value: Value = self.raw_get(key)?;
        Ok(!value.is_nil())
    }

    /// Append to the array part
    pub fn push<V: IntoLua>(&self, value: V) -> Result<()> {
        let next = self.raw_len()? as i64 + 1;
        self.raw_set(next, value)
    }

    /// Border of the array part, without `__len`
    pub fn raw_len(&self) -> Result<usize> {
        let state = self.0.lua().state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.0.push_onto(state)?;
            Ok(ffi::lua_rawlen(state, -1) as usize)
        }
    }

    /// `#table`, honoring `__len`
    pub fn len(&self) -> Result<i64> {
        let lua = self.0.lua();
        let state = lua.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 3)?;
            self.0.push_onto(state)?;
            protect_lua_call(lua.extra(), state, 1, 0, |state| ffi::luaL_len(state, 1))
                .map(|len| len as i64)
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.pairs()?.is_empty())
    }

    /// All key/value pairs, in native traversal order, without metamethods
    pub fn pairs(&self) -> Result<Vec<(Value, Value)>> {
        let lua = self.0.lua();
        let state = lua.state()?;
        let mut pairs = Vec::new();

        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 4)?;
            self.0.push_onto(state)?;
            ffi::lua_pushnil(state);
            while ffi::lua_next(state, -2) != 0 {
                let key = marshal::read_value(lua, state, -2)?;
                let value = marshal::read_value(lua, state, -1)?;
                pairs.push((key, value));
                ffi::lua_pop(state, 1);
            }
        }
        Ok(pairs)
    }

    /// Values `1..=raw_len` converted to `V`
    pub fn sequence_values<V: FromLua>(&self) -> Result<Vec<V>> {
        let len = self.raw_len()?;
        let mut values = Vec::with_capacity(len);
        for index in 1..=len {
            values.push(self.raw_get(index as i64)?);
        }
        Ok(values)
    }

    pub fn metatable(&self) -> Result<Option<LuaTable>> {
        let lua = self.0.lua();
        let state = lua.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 2)?;
            self.0.push_onto(state)?;
            if ffi::lua_getmetatable(state, -1) == 0 {
                return Ok(None);
            }
            Ok(Some(LuaTable::from_reference(super::LuaReference::capture(lua, state, -1)?)))
        }
    }

    pub fn set_metatable(&self, metatable: Option<&LuaTable>) -> Result<()> {
        let lua = self.0.lua();
        let state = lua.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 4)?;
            self.0.push_onto(state)?;
            match metatable {
                Some(metatable) => metatable.0.push_onto(state)?,
                None => ffi::lua_pushnil(state),
            }
            protect_lua_call(lua.extra(), state, 2, 0, |state| {
                ffi::lua_setmetatable(state, 1);
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::state::Lua;
    use crate::value::Value;

    #[test]
    fn test_get_set_round_trip() {
        let lua = Lua::new().unwrap();
        let table = lua.create_table().unwrap();

        table.set("name", "ferrolua").unwrap();
        table.set(1, 10i64).unwrap();

        let name: String = table.get("name").unwrap();
        assert_eq!(name, "ferrolua");
        assert_eq!(table.get::<_, i64>(1).unwrap(), 10);
        assert!(table.contains_key("name").unwrap());
        assert!(!table.contains_key("missing").unwrap());
    }

    #[test]
    fn test_get_honors_index_metamethod() {
        let lua = Lua::new().unwrap();
        let table: crate::LuaTable = lua
            .evaluate("setmetatable({}, { __index = function(_, k) return k .. '!' end })")
            .unwrap();

        let value: String = table.get("hi").unwrap();
        assert_eq!(value, "hi!");

        let raw: Value = table.raw_get("hi").unwrap();
        assert!(raw.is_nil());
    }

    #[test]
    fn test_nil_key_is_a_runtime_error() {
        let lua = Lua::new().unwrap();
        let table = lua.create_table().unwrap();
        let err = table.raw_set(Value::Nil, 1i64).unwrap_err();
        assert!(err.is_structured());
    }

    #[test]
    fn test_sequence_and_len() {
        let lua = Lua::new().unwrap();
        let table = lua.create_table().unwrap();
        for value in [3i64, 4, 5] {
            table.push(value).unwrap();
        }

        assert_eq!(table.raw_len().unwrap(), 3);
        assert_eq!(table.len().unwrap(), 3);
        assert_eq!(table.sequence_values::<i64>().unwrap(), vec![3, 4, 5]);
        assert_eq!(table.pairs().unwrap().len(), 3);
    }

    #[test]
    fn test_metatable_round_trip() {
        let lua = Lua::new().unwrap();
        let table = lua.create_table().unwrap();
        let metatable = lua.create_table().unwrap();

        assert!(table.metatable().unwrap().is_none());
        table.set_metatable(Some(&metatable)).unwrap();
        assert_eq!(table.metatable().unwrap().unwrap(), metatable);
        table.set_metatable(None).unwrap();
        assert!(table.metatable().unwrap().is_none());
    }
}
