//! Registry references
//!
//! A [`LuaReference`] owns one strong registry slot. Capturing the same value
//! twice yields two slots that are released independently; the value itself
//! can be collected once no slot and no other path in the interpreter keeps
//! it alive. The typed wrappers ([`LuaTable`], [`LuaFunction`], [`LuaThread`],
//! [`LuaUserData`]) add operations for their kind on top of the same core.

mod function;
mod table;
mod thread;
mod userdata;
mod weak;

pub use function::LuaFunction;
pub use table::LuaTable;
pub use thread::{CoroutineState, LuaThread, ThreadStatus};
pub use userdata::LuaUserData;
pub use weak::WeakReference;

use std::cell::Cell;
use std::fmt;
use std::os::raw::{c_int, c_void};

use mlua_sys as ffi;

use crate::error::{LuaError, Result};
use crate::protect::check_stack;
use crate::registry;
use crate::stack::StackGuard;
use crate::state::Lua;
use crate::value::ValueType;

const DISPOSED: c_int = ffi::LUA_NOREF;

/// Owning handle to a value held in a strong registry slot
pub struct LuaReference {
    lua: Lua,
    slot: Cell<c_int>,
}

impl LuaReference {
    /// Capture the value at `index` into a fresh slot. The stack is unchanged.
    ///
    /// # Safety
    ///
    /// `state` must be a thread of `lua` with a valid `index`.
    pub(crate) unsafe fn capture(lua: &Lua, state: *mut ffi::lua_State, index: c_int) -> Result<Self> {
        let kind = ValueType::from_native(ffi::lua_type(state, index));
        if !kind.is_referenceable() {
            return Err(LuaError::InvalidValue(format!(
                "cannot reference a {} value",
                kind.name()
            )));
        }

        check_stack(state, 3)?;
        ffi::lua_pushvalue(state, index);
        let slot = registry::store(lua.extra(), state)?;
        tracing::trace!(slot, kind = kind.name(), "captured registry reference");

        Ok(LuaReference {
            lua: lua.clone(),
            slot: Cell::new(slot),
        })
    }

    /// Wrap one of the reserved slots
    pub(crate) fn persistent(lua: &Lua, slot: c_int) -> Self {
        LuaReference {
            lua: lua.clone(),
            slot: Cell::new(slot),
        }
    }

    /// State this reference belongs to
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    fn check(&self) -> Result<c_int> {
        let slot = self.slot.get();
        if slot == DISPOSED {
            return Err(LuaError::ObjectDisposed("Lua reference"));
        }
        if self.lua.is_closed() {
            return Err(LuaError::ObjectDisposed("Lua state"));
        }
        Ok(slot)
    }

    pub fn is_disposed(&self) -> bool {
        self.slot.get() == DISPOSED || self.lua.is_closed()
    }

    /// Whether this is the main thread or globals reference
    pub fn is_persistent(&self) -> bool {
        registry::is_persistent(self.slot.get())
    }

    /// Raw registry slot, for diagnostics
    pub fn slot(&self) -> Result<c_int> {
        self.check()
    }

    /// Push the referenced value onto `state`
    ///
    /// # Safety
    ///
    /// `state` must be a thread of this reference's state.
    pub(crate) unsafe fn push_onto(&self, state: *mut ffi::lua_State) -> Result<()> {
        let slot = self.check()?;
        check_stack(state, 1)?;
        ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, slot as ffi::lua_Integer);
        Ok(())
    }

    /// Push the referenced value onto the current thread's stack
    pub fn push(&self) -> Result<()> {
        let state = self.lua.state()?;
        unsafe { self.push_onto(state) }
    }

    /// New reference to the same value, in its own slot
    pub fn try_clone(&self) -> Result<LuaReference> {
        let state = self.lua.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.push_onto(state)?;
            LuaReference::capture(&self.lua, state, -1)
        }
    }

    /// Release the slot. Disposing twice, or disposing a persistent reference, does nothing.
    pub fn dispose(&self) {
        let slot = self.slot.get();
        if slot == DISPOSED || registry::is_persistent(slot) {
            return;
        }
        self.slot.set(DISPOSED);

        if let Ok(state) = self.lua.state() {
            unsafe { registry::release(state, slot) };
            tracing::trace!(slot, "released registry reference");
        }
    }

    /// Native type of the referenced value
    pub fn value_type(&self) -> Result<ValueType> {
        let state = self.lua.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.push_onto(state)?;
            Ok(ValueType::from_native(ffi::lua_type(state, -1)))
        }
    }

    /// Identity of the referenced value
    pub fn to_pointer(&self) -> Result<*const c_void> {
        let state = self.lua.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            self.push_onto(state)?;
            Ok(ffi::lua_topointer(state, -1))
        }
    }

    /// Weak observation of the referenced value
    pub fn downgrade(&self) -> Result<WeakReference<LuaReference>> {
        WeakReference::new(self)
    }
}

impl Drop for LuaReference {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl PartialEq for LuaReference {
    fn eq(&self, other: &LuaReference) -> bool {
        if !self.lua.ptr_eq(&other.lua) {
            return false;
        }
        match (self.to_pointer(), other.to_pointer()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for LuaReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value_type() {
            Ok(kind) => write!(f, "{}: slot {}", kind, self.slot.get()),
            Err(_) => write!(f, "disposed reference"),
        }
    }
}

/// Reference wrappers that can be built from a checked [`LuaReference`]
pub trait ReferenceKind: Sized {
    /// Whether values of `kind` can be wrapped
    fn accepts(kind: ValueType) -> bool;

    fn from_reference(reference: LuaReference) -> Self;

    fn as_reference(&self) -> &LuaReference;
}

impl ReferenceKind for LuaReference {
    fn accepts(kind: ValueType) -> bool {
        kind.is_referenceable()
    }

    fn from_reference(reference: LuaReference) -> Self {
        reference
    }

    fn as_reference(&self) -> &LuaReference {
        self
    }
}

macro_rules! typed_reference {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        pub struct $name(pub(crate) crate::reference::LuaReference);

        impl $name {
            pub fn reference(&self) -> &crate::reference::LuaReference {
                &self.0
            }

            pub fn into_reference(self) -> crate::reference::LuaReference {
                self.0
            }

            pub fn try_clone(&self) -> crate::error::Result<Self> {
                self.0.try_clone().map($name)
            }

            pub fn dispose(&self) {
                self.0.dispose()
            }

            pub fn is_disposed(&self) -> bool {
                self.0.is_disposed()
            }

            pub fn downgrade(&self) -> crate::error::Result<crate::reference::WeakReference<Self>> {
                crate::reference::WeakReference::new(&self.0)
            }
        }

        impl crate::reference::ReferenceKind for $name {
            fn accepts(kind: crate::value::ValueType) -> bool {
                kind == $kind
            }

            fn from_reference(reference: crate::reference::LuaReference) -> Self {
                $name(reference)
            }

            fn as_reference(&self) -> &crate::reference::LuaReference {
                &self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0 == other.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(&self.0, f)
            }
        }
    };
}

pub(crate) use typed_reference;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_rejects_scalars() {
        let lua = Lua::new().unwrap();
        let state = lua.state().unwrap();
        unsafe {
            let _guard = StackGuard::new(state);
            ffi::lua_pushinteger(state, 5);
            let err = LuaReference::capture(&lua, state, -1).unwrap_err();
            assert!(matches!(err, LuaError::InvalidValue(_)));
        }
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let lua = Lua::new().unwrap();
        let table = lua.create_table().unwrap().into_reference();
        let slot = table.slot().unwrap();
        assert!(slot > 0);

        table.dispose();
        table.dispose();
        assert!(table.is_disposed());
        assert!(matches!(table.slot(), Err(LuaError::ObjectDisposed(_))));
        assert!(matches!(table.push(), Err(LuaError::ObjectDisposed(_))));
        assert!(matches!(table.try_clone(), Err(LuaError::ObjectDisposed(_))));
    }

    #[test]
    fn test_persistent_reference_survives_dispose() {
        let lua = Lua::new().unwrap();
        let globals = lua.globals().unwrap();
        assert!(globals.reference().is_persistent());

        globals.dispose();
        assert!(!globals.is_disposed());
        assert_eq!(globals.reference().value_type().unwrap(), ValueType::Table);
    }

    #[test]
    fn test_references_disposed_after_close() {
        let lua = Lua::new().unwrap();
        let table = lua.create_table().unwrap();
        lua.close().unwrap();

        assert!(table.is_disposed());
        assert!(matches!(
            table.reference().value_type(),
            Err(LuaError::ObjectDisposed(_))
        ));
        // Dropping after close must not touch the native state
        drop(table);
    }

    #[test]
    fn test_clone_gets_new_slot() {
        let lua = Lua::new().unwrap();
        let table = lua.create_table().unwrap();
        let clone = table.try_clone().unwrap();

        assert_ne!(table.reference().slot().unwrap(), clone.reference().slot().unwrap());
        assert_eq!(table, clone);
    }
}
