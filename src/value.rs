//! Value model
//!
//! A [`Value`] is a host-side copy of one interpreter value. Scalars and
//! strings are copied out; tables, functions, threads and userdata are held
//! through registry references, so a `Value` keeps them alive.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::os::raw::{c_int, c_void};
use std::string::String as StdString;

use mlua_sys as ffi;

use crate::error::Result;
use crate::reference::{LuaFunction, LuaTable, LuaThread, LuaUserData};

/// Native type tag of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Invalid (absent) stack index
    None,
    Nil,
    Boolean,
    LightUserData,
    Number,
    String,
    Table,
    Function,
    UserData,
    Thread,
}

impl ValueType {
    pub(crate) fn from_native(kind: c_int) -> Self {
        match kind {
            ffi::LUA_TNIL => ValueType::Nil,
            ffi::LUA_TBOOLEAN => ValueType::Boolean,
            ffi::LUA_TLIGHTUSERDATA => ValueType::LightUserData,
            ffi::LUA_TNUMBER => ValueType::Number,
            ffi::LUA_TSTRING => ValueType::String,
            ffi::LUA_TTABLE => ValueType::Table,
            ffi::LUA_TFUNCTION => ValueType::Function,
            ffi::LUA_TUSERDATA => ValueType::UserData,
            ffi::LUA_TTHREAD => ValueType::Thread,
            _ => ValueType::None,
        }
    }

    /// Name as reported by the `type` builtin
    pub fn name(self) -> &'static str {
        match self {
            ValueType::None => "no value",
            ValueType::Nil => "nil",
            ValueType::Boolean => "boolean",
            ValueType::LightUserData | ValueType::UserData => "userdata",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Table => "table",
            ValueType::Function => "function",
            ValueType::Thread => "thread",
        }
    }

    /// Whether values of this type can be held by a registry reference
    pub fn is_referenceable(self) -> bool {
        matches!(
            self,
            ValueType::Table | ValueType::Function | ValueType::UserData | ValueType::Thread
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw pointer carried as a light userdata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightUserData(pub *mut c_void);

/// Byte string copied out of the interpreter
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct LuaString(Vec<u8>);

impl LuaString {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        LuaString(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_str(&self) -> Result<&str> {
        Ok(std::str::from_utf8(&self.0)?)
    }

    pub fn to_string_lossy(&self) -> StdString {
        StdString::from_utf8_lossy(&self.0).into_owned()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", StdString::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for LuaString {
    fn from(value: &str) -> Self {
        LuaString(value.as_bytes().to_vec())
    }
}

impl From<StdString> for LuaString {
    fn from(value: StdString) -> Self {
        LuaString(value.into_bytes())
    }
}

impl From<Vec<u8>> for LuaString {
    fn from(value: Vec<u8>) -> Self {
        LuaString(value)
    }
}

impl From<&[u8]> for LuaString {
    fn from(value: &[u8]) -> Self {
        LuaString(value.to_vec())
    }
}

impl PartialEq<str> for LuaString {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<&str> for LuaString {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

/// One interpreter value
pub enum Value {
    Nil,
    Boolean(bool),
    LightUserData(LightUserData),
    Integer(i64),
    Number(f64),
    String(LuaString),
    Table(LuaTable),
    Function(LuaFunction),
    Thread(LuaThread),
    UserData(LuaUserData),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Nil => ValueType::Nil,
            Value::Boolean(_) => ValueType::Boolean,
            Value::LightUserData(_) => ValueType::LightUserData,
            Value::Integer(_) | Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Table(_) => ValueType::Table,
            Value::Function(_) => ValueType::Function,
            Value::Thread(_) => ValueType::Thread,
            Value::UserData(_) => ValueType::UserData,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Truthiness: everything but `nil` and `false` is true
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value, also for floats with an exact integer representation
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 => {
                Some(*n as i64)
            }
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => s.to_str().ok(),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&LuaTable> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&LuaFunction> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_userdata(&self) -> Option<&LuaUserData> {
        match self {
            Value::UserData(u) => Some(u),
            _ => None,
        }
    }

    /// Copy this value. References get a fresh registry slot.
    pub fn try_clone(&self) -> Result<Value> {
        Ok(match self {
            Value::Nil => Value::Nil,
            Value::Boolean(b) => Value::Boolean(*b),
            Value::LightUserData(p) => Value::LightUserData(*p),
            Value::Integer(i) => Value::Integer(*i),
            Value::Number(n) => Value::Number(*n),
            Value::String(s) => Value::String(s.clone()),
            Value::Table(t) => Value::Table(t.try_clone()?),
            Value::Function(f) => Value::Function(f.try_clone()?),
            Value::Thread(t) => Value::Thread(t.try_clone()?),
            Value::UserData(u) => Value::UserData(u.try_clone()?),
        })
    }

    /// Short description used in error messages, e.g. `key 'name'`
    pub(crate) fn describe_key(&self) -> StdString {
        match self {
            Value::String(s) => format!("key '{}'", s.to_string_lossy()),
            Value::Integer(i) => format!("key {}", i),
            Value::Number(n) => format!("key {}", n),
            other => format!("a {} key", other.type_name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => *a as f64 == *b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            (Value::UserData(a), Value::UserData(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::LightUserData(p) => write!(f, "lightuserdata: {:p}", p.0),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{:?}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Table(t) => write!(f, "{:?}", t),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::Thread(t) => write!(f, "{:?}", t),
            Value::UserData(u) => write!(f, "{:?}", u),
        }
    }
}

/// Ordered list of values passed to or returned from a call
#[derive(Debug, Default, PartialEq)]
pub struct MultiValue(Vec<Value>);

impl MultiValue {
    pub fn new() -> Self {
        MultiValue(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MultiValue(Vec::with_capacity(capacity))
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }

    /// Remove and return the first value, or nil when empty
    pub fn pop_front(&mut self) -> Value {
        if self.0.is_empty() {
            Value::Nil
        } else {
            self.0.remove(0)
        }
    }
}

impl Deref for MultiValue {
    type Target = Vec<Value>;

    fn deref(&self) -> &Vec<Value> {
        &self.0
    }
}

impl DerefMut for MultiValue {
    fn deref_mut(&mut self) -> &mut Vec<Value> {
        &mut self.0
    }
}

impl From<Vec<Value>> for MultiValue {
    fn from(values: Vec<Value>) -> Self {
        MultiValue(values)
    }
}

impl FromIterator<Value> for MultiValue {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        MultiValue(iter.into_iter().collect())
    }
}

impl IntoIterator for MultiValue {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
