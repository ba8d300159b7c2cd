//! Registry index
//!
//! Two kinds of containers live in the native registry. Strong slots are
//! integer keys of the registry itself, handed out by `luaL_ref`; a value in a
//! strong slot stays alive until the slot is released. Weak tables are
//! registry fields with a `__mode` metatable; they observe values without
//! keeping them alive and are evicted by the collector.

use std::os::raw::{c_int, c_void};

use mlua_sys as ffi;

use crate::error::Result;
use crate::protect::protect_lua_call;
use crate::state::ExtraData;

static WEAK_REFERENCES_KEY: u8 = 1;
static GC_SENTINELS_KEY: u8 = 2;
static USERDATA_CACHE_KEY: u8 = 3;
static SENTINEL_TARGETS_KEY: u8 = 6;

/// Weak-mode tables kept in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WeakTable {
    /// Weak references, keyed by id. Weak values.
    References,

    /// Reference target to GC sentinel. Ephemeron (weak keys).
    GcSentinels,

    /// Host object address to its userdata. Weak values.
    UserDataCache,

    /// GC sentinel to the value it watches. Weak keys and values.
    SentinelTargets,
}

impl WeakTable {
    const ALL: [WeakTable; 4] = [
        WeakTable::References,
        WeakTable::GcSentinels,
        WeakTable::UserDataCache,
        WeakTable::SentinelTargets,
    ];

    fn key(self) -> *const c_void {
        let key: &'static u8 = match self {
            WeakTable::References => &WEAK_REFERENCES_KEY,
            WeakTable::GcSentinels => &GC_SENTINELS_KEY,
            WeakTable::UserDataCache => &USERDATA_CACHE_KEY,
            WeakTable::SentinelTargets => &SENTINEL_TARGETS_KEY,
        };
        key as *const u8 as *const c_void
    }

    fn mode(self) -> &'static std::ffi::CStr {
        match self {
            WeakTable::References | WeakTable::UserDataCache => c"v",
            WeakTable::GcSentinels => c"k",
            WeakTable::SentinelTargets => c"kv",
        }
    }
}

/// Create the weak tables. Called once per state.
pub(crate) unsafe fn initialize(extra: &ExtraData, state: *mut ffi::lua_State) -> Result<()> {
    for table in WeakTable::ALL {
        let key = table.key();
        let mode = table.mode();
        protect_lua_call(extra, state, 0, 0, |state| {
            ffi::lua_createtable(state, 0, 0);
            ffi::lua_createtable(state, 0, 1);
            ffi::lua_pushstring(state, mode.as_ptr());
            ffi::lua_setfield(state, -2, c"__mode".as_ptr());
            ffi::lua_setmetatable(state, -2);
            ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, key);
        })?;
    }
    Ok(())
}

/// Whether `slot` is one of the reserved registry slots (main thread, globals)
pub(crate) fn is_persistent(slot: c_int) -> bool {
    slot >= ffi::LUA_RIDX_MAINTHREAD as c_int && slot <= ffi::LUA_RIDX_GLOBALS as c_int
}

/// Pop the top value into a fresh strong slot
pub(crate) unsafe fn store(extra: &ExtraData, state: *mut ffi::lua_State) -> Result<c_int> {
    protect_lua_call(extra, state, 1, 0, |state| ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX))
}

/// Release a strong slot for reuse. Never allocates.
pub(crate) unsafe fn release(state: *mut ffi::lua_State, slot: c_int) {
    if slot > 0 && !is_persistent(slot) && ffi::lua_checkstack(state, 2) != 0 {
        ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, slot);
    }
}

/// Push a weak table. Never allocates.
pub(crate) unsafe fn push_weak_table(state: *mut ffi::lua_State, table: WeakTable) {
    ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, table.key());
}

/// Pop the top value into the weak reference table under `id`
pub(crate) unsafe fn weak_store(extra: &ExtraData, state: *mut ffi::lua_State, id: i64) -> Result<()> {
    let key = WeakTable::References.key();
    protect_lua_call(extra, state, 1, 0, |state| {
        ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, key);
        ffi::lua_pushvalue(state, 1);
        ffi::lua_rawseti(state, -2, id as ffi::lua_Integer);
    })
}

/// Push the value stored under `id`, or nil once collected. Never allocates.
pub(crate) unsafe fn weak_push(state: *mut ffi::lua_State, id: i64) -> c_int {
    push_weak_table(state, WeakTable::References);
    let kind = ffi::lua_rawgeti(state, -1, id as ffi::lua_Integer);
    ffi::lua_remove(state, -2);
    kind
}

/// Clear the weak reference entry for `id`
pub(crate) unsafe fn weak_remove(extra: &ExtraData, state: *mut ffi::lua_State, id: i64) -> Result<()> {
    let key = WeakTable::References.key();
    protect_lua_call(extra, state, 0, 0, |state| {
        ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, key);
        ffi::lua_pushnil(state);
        ffi::lua_rawseti(state, -2, id as ffi::lua_Integer);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_slots() {
        assert!(is_persistent(ffi::LUA_RIDX_MAINTHREAD as c_int));
        assert!(is_persistent(ffi::LUA_RIDX_GLOBALS as c_int));
        assert!(!is_persistent(ffi::LUA_NOREF));
        assert!(!is_persistent(3));
    }

    #[test]
    fn test_weak_table_keys_are_distinct() {
        let keys: Vec<_> = WeakTable::ALL.iter().map(|t| t.key()).collect();
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
        assert_ne!(keys[0], keys[2]);
        assert!(!keys[..3].contains(&keys[3]));
    }
}
