//! Userdata descriptors
//!
//! A descriptor gives a host object its behavior inside the interpreter.
//! Every operation is optional: returning `Ok(None)` means "not handled",
//! and the metamethod raises the same error the interpreter would raise for
//! a userdata without that metamethod.

use crate::error::Result;
use crate::state::Lua;
use crate::value::{MultiValue, Value};

use super::UserDataHandle;

/// Arithmetic and bitwise metamethods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    IntDiv,
    Unm,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    BitNot,
}

impl ArithmeticOp {
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithmeticOp::BitAnd
                | ArithmeticOp::BitOr
                | ArithmeticOp::BitXor
                | ArithmeticOp::Shl
                | ArithmeticOp::Shr
                | ArithmeticOp::BitNot
        )
    }

    /// Whether the operator takes a single operand
    pub fn is_unary(self) -> bool {
        matches!(self, ArithmeticOp::Unm | ArithmeticOp::BitNot)
    }

    /// Name of the metamethod, e.g. `__add`
    pub fn metamethod(self) -> &'static str {
        match self {
            ArithmeticOp::Add => "__add",
            ArithmeticOp::Sub => "__sub",
            ArithmeticOp::Mul => "__mul",
            ArithmeticOp::Div => "__div",
            ArithmeticOp::Mod => "__mod",
            ArithmeticOp::Pow => "__pow",
            ArithmeticOp::IntDiv => "__idiv",
            ArithmeticOp::Unm => "__unm",
            ArithmeticOp::BitAnd => "__band",
            ArithmeticOp::BitOr => "__bor",
            ArithmeticOp::BitXor => "__bxor",
            ArithmeticOp::Shl => "__shl",
            ArithmeticOp::Shr => "__shr",
            ArithmeticOp::BitNot => "__bnot",
        }
    }

    pub(crate) fn unsupported_message(self) -> &'static str {
        if self.is_bitwise() {
            "attempt to perform bitwise operation on a userdata value"
        } else {
            "attempt to perform arithmetic on a userdata value"
        }
    }
}

/// Comparison metamethods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    Lt,
    Le,
}

/// Behavior of host objects of one category.
///
/// Binary operators receive both operands as they appear in the expression;
/// the userdata may be either one.
pub trait UserDataDescriptor {
    /// Name of the shared metatable, also reported as `__name`
    fn metatable_name(&self) -> &str;

    fn index(&self, _lua: &Lua, _this: &UserDataHandle, _key: Value) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Returns false when the key cannot be assigned
    fn new_index(&self, _lua: &Lua, _this: &UserDataHandle, _key: Value, _value: Value) -> Result<bool> {
        Ok(false)
    }

    fn call(&self, _lua: &Lua, _this: &UserDataHandle, _args: MultiValue) -> Result<Option<MultiValue>> {
        Ok(None)
    }

    fn arithmetic(&self, _lua: &Lua, _op: ArithmeticOp, _left: Value, _right: Value) -> Result<Option<Value>> {
        Ok(None)
    }

    /// `Eq` falls back to identity when not handled
    fn compare(&self, _lua: &Lua, _op: ComparisonOp, _left: Value, _right: Value) -> Result<Option<bool>> {
        Ok(None)
    }

    fn length(&self, _lua: &Lua, _this: &UserDataHandle) -> Result<Option<Value>> {
        Ok(None)
    }

    fn concat(&self, _lua: &Lua, _left: Value, _right: Value) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Falls back to `name: address` when not handled
    fn to_string(&self, _lua: &Lua, _this: &UserDataHandle) -> Result<Option<String>> {
        Ok(None)
    }

    /// Called when a to-be-closed variable holding the object goes out of scope
    fn close(&self, _lua: &Lua, _this: &UserDataHandle, _error: Value) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_messages() {
        assert_eq!(
            ArithmeticOp::Add.unsupported_message(),
            "attempt to perform arithmetic on a userdata value"
        );
        assert_eq!(
            ArithmeticOp::Shl.unsupported_message(),
            "attempt to perform bitwise operation on a userdata value"
        );
        assert!(ArithmeticOp::BitNot.is_unary());
        assert_eq!(ArithmeticOp::IntDiv.metamethod(), "__idiv");
    }
}
