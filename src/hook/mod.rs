//! Debug hooks
//!
//! One hook is installed per state. It is called on the events in its mask
//! and, for count events, every `instruction_interval` instructions. A hook
//! that returns an error unwinds the running script; the error surfaces as
//! the cause of the [`LuaError::Runtime`](crate::LuaError::Runtime) returned
//! by the protected call.

mod cancel;
mod combined;
mod limit;
mod timeout;

pub use cancel::{CancellationHook, CancellationToken};
pub use combined::CombinedHook;
pub use limit::InstructionLimitHook;
pub use timeout::TimeoutHook;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::os::raw::c_int;
use std::rc::Rc;

use mlua_sys as ffi;

use crate::debug::DebugInfo;
use crate::error::Result;
use crate::protect::hook_boundary;
use crate::state::{ExtraData, Lua};

/// Instruction interval used by the built-in hooks unless configured otherwise
pub const DEFAULT_HOOK_INTERVAL: u32 = 1000;

/// Set of hook events
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct HookEvents(c_int);

impl HookEvents {
    pub const NONE: HookEvents = HookEvents(0);
    pub const CALL: HookEvents = HookEvents(ffi::LUA_MASKCALL);
    pub const RETURN: HookEvents = HookEvents(ffi::LUA_MASKRET);
    pub const LINE: HookEvents = HookEvents(ffi::LUA_MASKLINE);
    pub const COUNT: HookEvents = HookEvents(ffi::LUA_MASKCOUNT);

    pub fn contains(self, other: HookEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn bits(self) -> c_int {
        self.0
    }
}

impl BitOr for HookEvents {
    type Output = HookEvents;

    fn bitor(self, rhs: HookEvents) -> HookEvents {
        HookEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for HookEvents {
    fn bitor_assign(&mut self, rhs: HookEvents) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for HookEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (HookEvents::CALL, "CALL"),
            (HookEvents::RETURN, "RETURN"),
            (HookEvents::LINE, "LINE"),
            (HookEvents::COUNT, "COUNT"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(mask, _)| self.contains(*mask))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "HookEvents(NONE)")
        } else {
            write!(f, "HookEvents({})", set.join(" | "))
        }
    }
}

/// Event a hook was called for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    TailCall,
    Return,
    Line,
    Count,
}

impl HookEvent {
    fn from_native(event: c_int) -> Option<HookEvent> {
        match event {
            ffi::LUA_HOOKCALL => Some(HookEvent::Call),
            ffi::LUA_HOOKTAILCALL => Some(HookEvent::TailCall),
            ffi::LUA_HOOKRET => Some(HookEvent::Return),
            ffi::LUA_HOOKLINE => Some(HookEvent::Line),
            ffi::LUA_HOOKCOUNT => Some(HookEvent::Count),
            _ => None,
        }
    }

    /// Mask that enables this event
    pub fn mask(self) -> HookEvents {
        match self {
            HookEvent::Call | HookEvent::TailCall => HookEvents::CALL,
            HookEvent::Return => HookEvents::RETURN,
            HookEvent::Line => HookEvents::LINE,
            HookEvent::Count => HookEvents::COUNT,
        }
    }
}

pub trait LuaHook {
    fn events(&self) -> HookEvents;

    /// Instructions between count events; ignored without [`HookEvents::COUNT`]
    fn instruction_interval(&self) -> u32 {
        0
    }

    fn on_event(&self, lua: &Lua, event: HookEvent, info: &DebugInfo<'_>) -> Result<()>;
}

impl Lua {
    /// Install `hook`, replacing the current one
    pub fn set_hook(&self, hook: Rc<dyn LuaHook>) -> Result<()> {
        let events = hook.events();
        if events.is_empty() {
            return self.remove_hook();
        }
        let count = if events.contains(HookEvents::COUNT) {
            c_int::try_from(hook.instruction_interval().max(1)).unwrap_or(c_int::MAX)
        } else {
            0
        };

        let main = self.main_state()?;
        let current = self.state()?;
        *self.extra().hook.borrow_mut() = Some(hook);
        unsafe {
            ffi::lua_sethook(main, Some(hook_trampoline), events.bits(), count);
            if current != main {
                ffi::lua_sethook(current, Some(hook_trampoline), events.bits(), count);
            }
        }
        tracing::debug!(?events, count, "installed hook");
        Ok(())
    }

    pub fn remove_hook(&self) -> Result<()> {
        let main = self.main_state()?;
        let current = self.state()?;
        self.extra().hook.borrow_mut().take();
        unsafe {
            ffi::lua_sethook(main, None, 0, 0);
            if current != main {
                ffi::lua_sethook(current, None, 0, 0);
            }
        }
        Ok(())
    }

    pub fn hook(&self) -> Option<Rc<dyn LuaHook>> {
        self.extra().hook.borrow().clone()
    }
}

unsafe extern "C-unwind" fn hook_trampoline(state: *mut ffi::lua_State, ar: *mut ffi::lua_Debug) {
    let Some(event) = HookEvent::from_native((*ar).event) else {
        return;
    };
    let hook = match ExtraData::from_state(state).hook.try_borrow() {
        Ok(hook) => hook.clone(),
        Err(_) => None,
    };
    let Some(hook) = hook else {
        return;
    };

    hook_boundary(state, move |lua, state| {
        let info = DebugInfo::new(state, ar);
        hook.on_event(lua, event, &info)?;
        Ok(0)
    });
}
