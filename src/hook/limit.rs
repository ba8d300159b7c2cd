//! Instruction budget

use std::cell::Cell;

use crate::debug::DebugInfo;
use crate::error::{LuaError, Result};
use crate::state::Lua;

use super::{HookEvent, HookEvents, LuaHook};

/// Raises [`LuaError::InstructionLimitExceeded`] once more than `limit`
/// instructions have run in one execution (see [`Lua::execution_id`]). The
/// count is approximate to one interval.
#[derive(Debug)]
pub struct InstructionLimitHook {
    limit: u64,
    interval: u32,
    executed: Cell<u64>,
    execution: Cell<u64>,
}

impl InstructionLimitHook {
    pub fn new(limit: u64, interval: u32) -> Self {
        InstructionLimitHook {
            limit,
            interval: interval.max(1),
            executed: Cell::new(0),
            execution: Cell::new(0),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Instructions counted in the latest execution
    pub fn executed(&self) -> u64 {
        self.executed.get()
    }

    pub fn reset(&self) {
        self.executed.set(0);
    }
}

impl LuaHook for InstructionLimitHook {
    fn events(&self) -> HookEvents {
        HookEvents::COUNT
    }

    fn instruction_interval(&self) -> u32 {
        self.interval
    }

    fn on_event(&self, lua: &Lua, _event: HookEvent, _info: &DebugInfo<'_>) -> Result<()> {
        let execution = lua.execution_id();
        if self.execution.replace(execution) != execution {
            self.executed.set(0);
        }

        let executed = self.executed.get().saturating_add(self.interval as u64);
        self.executed.set(executed);
        if executed > self.limit {
            tracing::debug!(limit = self.limit, executed, "instruction limit exceeded");
            Err(LuaError::InstructionLimitExceeded(self.limit))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::config::LuaConfig;

    #[test]
    fn test_limit_stops_infinite_loop() {
        let lua = Lua::new().unwrap();
        let hook = Rc::new(InstructionLimitHook::new(10_000, 100));
        lua.set_hook(hook.clone()).unwrap();

        let err = lua.execute("while true do end").unwrap_err();
        assert!(matches!(
            err.unwrap_exception(),
            LuaError::InstructionLimitExceeded(10_000)
        ));
        assert!(hook.executed() > 10_000);
        assert!(hook.executed() <= 10_100);
    }

    #[test]
    fn test_budget_applies_per_execution() {
        let config = LuaConfig::default()
            .with_instruction_limit(Some(10_000))
            .with_hook_interval(100);
        let lua = Lua::with_config(config).unwrap();
        let script = "(function() local s = 0 for i = 1, 1500 do s = s + i end return s end)()";

        for _ in 0..6 {
            let total: i64 = lua.evaluate(script).unwrap();
            assert_eq!(total, 1_125_750);
        }

        let err = lua.execute("while true do end").unwrap_err();
        assert!(matches!(
            err.unwrap_exception(),
            LuaError::InstructionLimitExceeded(10_000)
        ));
        let total: i64 = lua.evaluate(script).unwrap();
        assert_eq!(total, 1_125_750);
    }

    #[test]
    fn test_nested_calls_share_the_budget() {
        let lua = Lua::new().unwrap();
        lua.set_hook(Rc::new(InstructionLimitHook::new(10_000, 100))).unwrap();
        let spin = lua
            .create_function(|lua, rounds: i64| {
                lua.execute(&format!("for i = 1, {} do end", rounds))
            })
            .unwrap();
        lua.set_global("spin", spin).unwrap();

        let err = lua.execute("for _ = 1, 10 do spin(5000) end").unwrap_err();
        assert!(matches!(
            err.unwrap_exception(),
            LuaError::InstructionLimitExceeded(10_000)
        ));
    }

    #[test]
    fn test_limit_from_config() {
        let config = LuaConfig::default().with_instruction_limit(Some(5_000));
        let lua = Lua::with_config(config).unwrap();

        let err = lua.execute("local i = 0 while true do i = i + 1 end").unwrap_err();
        assert!(matches!(
            err.unwrap_exception(),
            LuaError::InstructionLimitExceeded(5_000)
        ));
    }
}
