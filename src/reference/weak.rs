//! Weak references
//!
//! A weak reference stores its target in a weak-valued registry table under a
//! numeric id. It never keeps the target alive; probing it captures a strong
//! reference for as long as the caller holds the result.

use std::fmt;
use std::marker::PhantomData;

use crate::error::Result;
use crate::registry;
use crate::stack::StackGuard;
use crate::state::Lua;
use crate::value::ValueType;

use super::{LuaReference, ReferenceKind};

/// Weak observation of a table, function, thread or userdata
pub struct WeakReference<T> {
    lua: Lua,
    id: i64,
    _marker: PhantomData<T>,
}

impl<T: ReferenceKind> WeakReference<T> {
    pub(crate) fn new(target: &LuaReference) -> Result<Self> {
        let lua = target.lua().clone();
        let state = lua.state()?;
        let extra = lua.extra();
        let id = extra.next_weak_id();

        unsafe {
            let _guard = StackGuard::new(state);
            target.push_onto(state)?;
            registry::weak_store(extra, state, id)?;
        }
        tracing::trace!(id, "created weak reference");

        Ok(WeakReference {
            lua,
            id,
            _marker: PhantomData,
        })
    }

    /// Strong reference to the target, or `None` once it has been collected.
    ///
    /// A slot holding anything other than the expected kind counts as
    /// collected.
    pub fn try_get(&self) -> Result<Option<T>> {
        let state = self.lua.state()?;
        unsafe {
            let _guard = StackGuard::new(state);
            crate::protect::check_stack(state, 2)?;
            let kind = ValueType::from_native(registry::weak_push(state, self.id));
            if !T::accepts(kind) {
                return Ok(None);
            }
            let strong = LuaReference::capture(&self.lua, state, -1)?;
            Ok(Some(T::from_reference(strong)))
        }
    }

    /// Whether the target is still reachable
    pub fn is_alive(&self) -> Result<bool> {
        Ok(self.try_get()?.is_some())
    }
}

impl<T> Drop for WeakReference<T> {
    fn drop(&mut self) {
        if let Ok(state) = self.lua.state() {
            unsafe {
                let _guard = StackGuard::new(state);
                let _ = registry::weak_remove(self.lua.extra(), state, self.id);
            }
        }
    }
}

impl<T> fmt::Debug for WeakReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakReference").field("id", &self.id).finish()
    }
}
