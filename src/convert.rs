//! Conversions between host types and [`Value`]

use std::rc::Rc;

use crate::error::{LuaError, Result};
use crate::reference::{LuaFunction, LuaTable, LuaThread, LuaUserData};
use crate::state::Lua;
use crate::userdata::{HostFunction, HostType};
use crate::value::{LightUserData, LuaString, MultiValue, Value};

/// Convert a host value into an interpreter value
pub trait IntoLua {
    fn into_lua(self, lua: &Lua) -> Result<Value>;
}

/// Convert an interpreter value into a host value
pub trait FromLua: Sized {
    fn from_lua(value: Value, lua: &Lua) -> Result<Self>;
}

/// Convert a host value into a list of arguments or results
pub trait IntoLuaMulti {
    fn into_lua_multi(self, lua: &Lua) -> Result<MultiValue>;
}

/// Convert a list of arguments or results into a host value
pub trait FromLuaMulti: Sized {
    fn from_lua_multi(values: MultiValue, lua: &Lua) -> Result<Self>;
}

fn conversion_error(from: &Value, to: &str) -> LuaError {
    LuaError::InvalidValue(format!("cannot convert a {} value to {}", from.type_name(), to))
}

impl IntoLua for Value {
    fn into_lua(self, _lua: &Lua) -> Result<Value> {
        Ok(self)
    }
}

impl FromLua for Value {
    fn from_lua(value: Value, _lua: &Lua) -> Result<Self> {
        Ok(value)
    }
}

impl IntoLua for bool {
    fn into_lua(self, _lua: &Lua) -> Result<Value> {
        Ok(Value::Boolean(self))
    }
}

impl FromLua for bool {
    fn from_lua(value: Value, _lua: &Lua) -> Result<Self> {
        Ok(value.is_truthy())
    }
}

macro_rules! lua_integer {
    ($($ty:ty),*) => {$(
        impl IntoLua for $ty {
            fn into_lua(self, _lua: &Lua) -> Result<Value> {
                match i64::try_from(self) {
                    Ok(i) => Ok(Value::Integer(i)),
                    Err(_) => Ok(Value::Number(self as f64)),
                }
            }
        }

        impl FromLua for $ty {
            fn from_lua(value: Value, _lua: &Lua) -> Result<Self> {
                let integer = match &value {
                    Value::String(s) => s.to_str().ok().and_then(|s| s.trim().parse::<i64>().ok()),
                    other => other.as_integer(),
                };
                integer
                    .and_then(|i| <$ty>::try_from(i).ok())
                    .ok_or_else(|| conversion_error(&value, stringify!($ty)))
            }
        }
    )*};
}

lua_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! lua_float {
    ($($ty:ty),*) => {$(
        impl IntoLua for $ty {
            fn into_lua(self, _lua: &Lua) -> Result<Value> {
                Ok(Value::Number(self as f64))
            }
        }

        impl FromLua for $ty {
            fn from_lua(value: Value, _lua: &Lua) -> Result<Self> {
                let number = match &value {
                    Value::String(s) => s.to_str().ok().and_then(|s| s.trim().parse::<f64>().ok()),
                    other => other.as_number(),
                };
                number
                    .map(|n| n as $ty)
                    .ok_or_else(|| conversion_error(&value, stringify!($ty)))
            }
        }
    )*};
}

lua_float!(f32, f64);

impl IntoLua for &str {
    fn into_lua(self, _lua: &Lua) -> Result<Value> {
        Ok(Value::String(LuaString::from(self)))
    }
}

impl IntoLua for String {
    fn into_lua(self, _lua: &Lua) -> Result<Value> {
        Ok(Value::String(LuaString::from(self)))
    }
}

impl IntoLua for &[u8] {
    fn into_lua(self, _lua: &Lua) -> Result<Value> {
        Ok(Value::String(LuaString::from(self)))
    }
}

impl IntoLua for LuaString {
    fn into_lua(self, _lua: &Lua) -> Result<Value> {
        Ok(Value::String(self))
    }
}

impl FromLua for LuaString {
    fn from_lua(value: Value, _lua: &Lua) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            Value::Integer(i) => Ok(LuaString::from(i.to_string())),
            Value::Number(n) => Ok(LuaString::from(n.to_string())),
            other => Err(conversion_error(&other, "string")),
        }
    }
}

impl FromLua for String {
    fn from_lua(value: Value, lua: &Lua) -> Result<Self> {
        let string = LuaString::from_lua(value, lua)?;
        Ok(string.to_str()?.to_owned())
    }
}

impl IntoLua for LightUserData {
    fn into_lua(self, _lua: &Lua) -> Result<Value> {
        Ok(Value::LightUserData(self))
    }
}

impl FromLua for LightUserData {
    fn from_lua(value: Value, _lua: &Lua) -> Result<Self> {
        match value {
            Value::LightUserData(p) => Ok(p),
            other => Err(conversion_error(&other, "light userdata")),
        }
    }
}

impl<T: IntoLua> IntoLua for Option<T> {
    fn into_lua(self, lua: &Lua) -> Result<Value> {
        match self {
            Some(value) => value.into_lua(lua),
            None => Ok(Value::Nil),
        }
    }
}

impl<T: FromLua> FromLua for Option<T> {
    fn from_lua(value: Value, lua: &Lua) -> Result<Self> {
        match value {
            Value::Nil => Ok(None),
            value => T::from_lua(value, lua).map(Some),
        }
    }
}

macro_rules! lua_reference {
    ($ty:ident, $variant:ident, $name:literal) => {
        impl IntoLua for $ty {
            fn into_lua(self, _lua: &Lua) -> Result<Value> {
                Ok(Value::$variant(self))
            }
        }

        impl IntoLua for &$ty {
            fn into_lua(self, _lua: &Lua) -> Result<Value> {
                Ok(Value::$variant(self.try_clone()?))
            }
        }

        impl FromLua for $ty {
            fn from_lua(value: Value, _lua: &Lua) -> Result<Self> {
                match value {
                    Value::$variant(inner) => Ok(inner),
                    other => Err(conversion_error(&other, $name)),
                }
            }
        }
    };
}

lua_reference!(LuaTable, Table, "table");
lua_reference!(LuaFunction, Function, "function");
lua_reference!(LuaThread, Thread, "thread");
lua_reference!(LuaUserData, UserData, "userdata");

impl<T: HostType> IntoLua for Rc<T> {
    fn into_lua(self, lua: &Lua) -> Result<Value> {
        lua.create_userdata(self).map(Value::UserData)
    }
}

impl IntoLua for HostFunction {
    fn into_lua(self, lua: &Lua) -> Result<Value> {
        lua.create_userdata(Rc::new(self)).map(Value::UserData)
    }
}

impl<T: IntoLua> IntoLuaMulti for T {
    fn into_lua_multi(self, lua: &Lua) -> Result<MultiValue> {
        Ok(MultiValue::from(vec![self.into_lua(lua)?]))
    }
}

impl<T: FromLua> FromLuaMulti for T {
    fn from_lua_multi(mut values: MultiValue, lua: &Lua) -> Result<Self> {
        T::from_lua(values.pop_front(), lua)
    }
}

impl IntoLuaMulti for MultiValue {
    fn into_lua_multi(self, _lua: &Lua) -> Result<MultiValue> {
        Ok(self)
    }
}

impl FromLuaMulti for MultiValue {
    fn from_lua_multi(values: MultiValue, _lua: &Lua) -> Result<Self> {
        Ok(values)
    }
}

impl IntoLuaMulti for () {
    fn into_lua_multi(self, _lua: &Lua) -> Result<MultiValue> {
        Ok(MultiValue::new())
    }
}

impl FromLuaMulti for () {
    fn from_lua_multi(_values: MultiValue, _lua: &Lua) -> Result<Self> {
        Ok(())
    }
}

impl<T: IntoLua> IntoLuaMulti for Vec<T> {
    fn into_lua_multi(self, lua: &Lua) -> Result<MultiValue> {
        self.into_iter().map(|value| value.into_lua(lua)).collect::<Result<Vec<_>>>().map(MultiValue::from)
    }
}

impl<T: FromLua> FromLuaMulti for Vec<T> {
    fn from_lua_multi(values: MultiValue, lua: &Lua) -> Result<Self> {
        values.into_iter().map(|value| T::from_lua(value, lua)).collect()
    }
}

macro_rules! lua_tuple {
    ($($name:ident),+) => {
        impl<$($name: IntoLua),+> IntoLuaMulti for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_lua_multi(self, lua: &Lua) -> Result<MultiValue> {
                let ($($name,)+) = self;
                Ok(MultiValue::from(vec![$($name.into_lua(lua)?),+]))
            }
        }

        impl<$($name: FromLua),+> FromLuaMulti for ($($name,)+) {
            #[allow(non_snake_case)]
            fn from_lua_multi(mut values: MultiValue, lua: &Lua) -> Result<Self> {
                $(let $name = $name::from_lua(values.pop_front(), lua)?;)+
                Ok(($($name,)+))
            }
        }
    };
}

lua_tuple!(A);
lua_tuple!(A, B);
lua_tuple!(A, B, C);
lua_tuple!(A, B, C, D);
lua_tuple!(A, B, C, D, E);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_coercions() {
        let lua = Lua::new().unwrap();
        assert_eq!(i32::from_lua(Value::Number(3.0), &lua).unwrap(), 3);
        assert_eq!(i64::from_lua(Value::String(LuaString::from(" 12 ")), &lua).unwrap(), 12);
        assert!(u8::from_lua(Value::Integer(300), &lua).is_err());
        assert!(i64::from_lua(Value::Number(1.5), &lua).is_err());
        assert_eq!(f64::from_lua(Value::Integer(2), &lua).unwrap(), 2.0);
    }

    #[test]
    fn test_strings_accept_numbers() {
        let lua = Lua::new().unwrap();
        assert_eq!(String::from_lua(Value::Integer(7), &lua).unwrap(), "7");
        assert!(String::from_lua(Value::Boolean(true), &lua).is_err());
        assert!(String::from_lua(Value::String(LuaString::new(vec![0xff, 0xfe])), &lua).is_err());
    }

    #[test]
    fn test_option_and_truthiness() {
        let lua = Lua::new().unwrap();
        assert_eq!(Option::<i64>::from_lua(Value::Nil, &lua).unwrap(), None);
        assert_eq!(Option::<i64>::from_lua(Value::Integer(4), &lua).unwrap(), Some(4));
        assert!(!bool::from_lua(Value::Nil, &lua).unwrap());
        assert!(bool::from_lua(Value::Integer(0), &lua).unwrap());
    }

    #[test]
    fn test_multi_values() {
        let lua = Lua::new().unwrap();
        let values = (1, "two", true).into_lua_multi(&lua).unwrap();
        assert_eq!(values.len(), 3);

        let (a, b, missing): (i64, String, Option<i64>) = FromLuaMulti::from_lua_multi(values, &lua).unwrap();
        assert_eq!((a, b.as_str(), missing), (1, "two", None));

        let collected: Vec<i64> = lua.evaluate("1, 2, 3").unwrap();
        assert_eq!(collected, vec![1, 2, 3]);
    }
}
