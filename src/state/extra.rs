//! Per-state host data
//!
//! The native state carries a single user pointer, the allocator's `ud`. It
//! points at [`ExtraData`], so every trampoline can reach the owning host
//! state from a bare `lua_State` pointer.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::{Rc, Weak};

use mlua_sys as ffi;

use crate::alloc::AllocatorState;
use crate::config::LuaConfig;
use crate::dump::ChunkMode;
use crate::error::Result;
use crate::hook::LuaHook;
use crate::library::LuaLibrary;
use crate::protect::{panic_message, ProtectedCallBoundary};
use crate::userdata::{DescriptorProvider, MemberFilter};

use super::{Lua, LuaInner};

pub(crate) type GcCallback = Box<dyn FnOnce() -> Result<()>>;

/// Callbacks waiting on one GC sentinel, and the sentinel's block address
pub(crate) struct GcWatch {
    pub(crate) address: usize,
    pub(crate) callbacks: Vec<GcCallback>,
}

impl GcWatch {
    pub(crate) fn new(address: usize) -> Self {
        GcWatch {
            address,
            callbacks: Vec::new(),
        }
    }
}
pub(crate) type WarningHandler = Rc<dyn Fn(&str)>;

/// Host-side data shared by every trampoline of one state
pub(crate) struct ExtraData {
    pub(crate) owner: Weak<LuaInner>,
    pub(crate) allocator: AllocatorState,
    pub(crate) boundary: ProtectedCallBoundary,
    pub(crate) descriptors: RefCell<DescriptorProvider>,
    pub(crate) gc_callbacks: RefCell<HashMap<u64, GcWatch>>,
    pub(crate) next_sentinel: Cell<u64>,
    pub(crate) next_weak_id: Cell<i64>,
    pub(crate) hook: RefCell<Option<Rc<dyn LuaHook>>>,
    pub(crate) warning_handler: RefCell<Option<WarningHandler>>,
    pub(crate) open_libraries: RefCell<BTreeSet<LuaLibrary>>,
    pub(crate) chunk_mode: Cell<ChunkMode>,
    pub(crate) member_filter: Cell<MemberFilter>,

    /// Set while `lua_close` runs the remaining finalizers
    pub(crate) closing: Cell<bool>,
}

impl ExtraData {
    pub(crate) fn new(owner: Weak<LuaInner>, config: &LuaConfig) -> Self {
        ExtraData {
            owner,
            allocator: AllocatorState::new(config.memory_limit),
            boundary: ProtectedCallBoundary::new(),
            descriptors: RefCell::new(DescriptorProvider::new()),
            gc_callbacks: RefCell::new(HashMap::new()),
            next_sentinel: Cell::new(1),
            next_weak_id: Cell::new(1),
            hook: RefCell::new(None),
            warning_handler: RefCell::new(None),
            open_libraries: RefCell::new(BTreeSet::new()),
            chunk_mode: Cell::new(config.chunk_mode),
            member_filter: Cell::new(MemberFilter {
                strict: config.strict_members,
            }),
            closing: Cell::new(false),
        }
    }

    /// Recover the host data from a native state.
    ///
    /// # Safety
    ///
    /// `state` must belong to a state created by [`Lua`], and the returned
    /// reference must not outlive it.
    pub(crate) unsafe fn from_state<'a>(state: *mut ffi::lua_State) -> &'a ExtraData {
        let mut ud: *mut c_void = ptr::null_mut();
        ffi::lua_getallocf(state, &mut ud);
        &*(ud as *const ExtraData)
    }

    /// Strong handle to the owning state, if it is still alive
    pub(crate) fn owner(&self) -> Option<Lua> {
        self.owner.upgrade().map(|inner| Lua { inner })
    }

    pub(crate) fn next_weak_id(&self) -> i64 {
        let id = self.next_weak_id.get();
        self.next_weak_id.set(id + 1);
        id
    }

    /// Report a non-fatal diagnostic
    pub(crate) fn emit_warning(&self, message: &str) {
        tracing::warn!(%message, "Lua warning");

        let handler = self.warning_handler.borrow().clone();
        if let Some(handler) = handler {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                tracing::warn!("warning handler panicked");
            }
        }
    }

    /// Run and discard the callbacks registered for a collected sentinel.
    ///
    /// Nothing runs unless `address` is the block the sentinel was created in.
    pub(crate) fn run_gc_callbacks(&self, sentinel: u64, address: usize) {
        let watch = match self.gc_callbacks.try_borrow_mut() {
            Ok(mut watches) => {
                let known = watches.get(&sentinel).is_some_and(|watch| watch.address == address);
                if known {
                    watches.remove(&sentinel)
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        let Some(GcWatch { callbacks, .. }) = watch else {
            return;
        };

        let _suspend = self.boundary.suspend();
        for callback in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(callback)) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.emit_warning(&format!("GC callback failed: {}", err));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    self.emit_warning(&format!("GC callback panicked: {}", message));
                }
            }
        }
    }
}

/// The `lua_Alloc` entry point. `ud` is the state's [`ExtraData`].
pub(crate) unsafe extern "C-unwind" fn allocate(
    ud: *mut c_void,
    ptr: *mut c_void,
    old_size: usize,
    new_size: usize,
) -> *mut c_void {
    let extra = &*(ud as *const ExtraData);
    extra.allocator.reallocate(ptr, old_size, new_size)
}
