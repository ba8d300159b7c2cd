//! Wall-clock deadline checked from the hook

use std::cell::Cell;
use std::time::{Duration, Instant};

use crate::debug::DebugInfo;
use crate::error::{LuaError, Result};
use crate::state::Lua;

use super::{HookEvent, HookEvents, LuaHook, DEFAULT_HOOK_INTERVAL};

/// Raises [`LuaError::Timeout`] once the deadline has passed.
///
/// Each execution (see [`Lua::execution_id`]) gets its own deadline, counted
/// from the moment the host entered the interpreter. There is no timer: a
/// script that runs no instructions, e.g. one blocked in a host call, is not
/// interrupted.
#[derive(Debug)]
pub struct TimeoutHook {
    timeout: Duration,
    interval: u32,
    started: Cell<Instant>,
    execution: Cell<u64>,
}

impl TimeoutHook {
    pub fn new(timeout: Duration) -> Self {
        Self::with_interval(timeout, DEFAULT_HOOK_INTERVAL)
    }

    pub fn with_interval(timeout: Duration, interval: u32) -> Self {
        TimeoutHook {
            timeout,
            interval: interval.max(1),
            started: Cell::new(Instant::now()),
            execution: Cell::new(0),
        }
    }

    /// Start a new deadline from now, for the rest of the current execution
    pub fn restart(&self) {
        self.started.set(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        self.started.get().elapsed()
    }
}

impl LuaHook for TimeoutHook {
    fn events(&self) -> HookEvents {
        HookEvents::COUNT
    }

    fn instruction_interval(&self) -> u32 {
        self.interval
    }

    fn on_event(&self, lua: &Lua, _event: HookEvent, _info: &DebugInfo<'_>) -> Result<()> {
        let execution = lua.execution_id();
        if self.execution.replace(execution) != execution {
            self.started.set(lua.execution_started());
        }

        if self.elapsed() >= self.timeout {
            tracing::debug!(timeout = ?self.timeout, "script timed out");
            Err(LuaError::Timeout(self.timeout))
        } else {
            Ok(())
        }
    }
}
