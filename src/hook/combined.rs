//! Several hooks behind the single native hook slot

use std::cell::Cell;
use std::rc::Rc;

use crate::debug::DebugInfo;
use crate::error::Result;
use crate::state::Lua;

use super::{HookEvent, HookEvents, LuaHook};

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let rem = a % b;
        a = b;
        b = rem;
    }
    a
}

struct Member {
    hook: Rc<dyn LuaHook>,
    pending: Cell<u64>,
}

/// Dispatches to every member hook.
///
/// The native count interval is the greatest common divisor of the members'
/// intervals; each member still sees count events at its own interval.
/// Dispatch stops at the first member that fails.
pub struct CombinedHook {
    members: Vec<Member>,
    events: HookEvents,
    interval: u32,
}

impl CombinedHook {
    pub fn new(hooks: Vec<Rc<dyn LuaHook>>) -> Self {
        let mut events = HookEvents::NONE;
        let mut interval = 0;
        for hook in &hooks {
            events |= hook.events();
            if hook.events().contains(HookEvents::COUNT) {
                interval = gcd(interval, hook.instruction_interval().max(1));
            }
        }

        CombinedHook {
            members: hooks
                .into_iter()
                .map(|hook| Member {
                    hook,
                    pending: Cell::new(0),
                })
                .collect(),
            events,
            interval,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl LuaHook for CombinedHook {
    fn events(&self) -> HookEvents {
        self.events
    }

    fn instruction_interval(&self) -> u32 {
        self.interval
    }

    fn on_event(&self, lua: &Lua, event: HookEvent, info: &DebugInfo<'_>) -> Result<()> {
        for member in &self.members {
            if !member.hook.events().contains(event.mask()) {
                continue;
            }

            if event == HookEvent::Count {
                let own = member.hook.instruction_interval().max(1) as u64;
                let pending = member.pending.get() + self.interval as u64;
                if pending < own {
                    member.pending.set(pending);
                    continue;
                }
                member.pending.set(pending - own);
            }

            member.hook.on_event(lua, event, info)?;
        }
        Ok(())
    }
}
