//! Cooperative cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::debug::DebugInfo;
use crate::error::{LuaError, Result};
use crate::state::Lua;

use super::{HookEvent, HookEvents, LuaHook, DEFAULT_HOOK_INTERVAL};

/// Shared cancellation flag. Clones observe the same flag, from any thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Raises [`LuaError::OperationCanceled`] once its token is cancelled
#[derive(Debug)]
pub struct CancellationHook {
    token: CancellationToken,
    events: HookEvents,
    interval: u32,
}

impl CancellationHook {
    /// Check the token every [`DEFAULT_HOOK_INTERVAL`] instructions
    pub fn new(token: CancellationToken) -> Self {
        Self::with_events(token, HookEvents::COUNT, DEFAULT_HOOK_INTERVAL)
    }

    pub fn with_events(token: CancellationToken, events: HookEvents, interval: u32) -> Self {
        CancellationHook {
            token,
            events,
            interval,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl LuaHook for CancellationHook {
    fn events(&self) -> HookEvents {
        self.events
    }

    fn instruction_interval(&self) -> u32 {
        self.interval
    }

    fn on_event(&self, _lua: &Lua, _event: HookEvent, _info: &DebugInfo<'_>) -> Result<()> {
        if self.token.is_cancelled() {
            tracing::debug!("script cancelled");
            Err(LuaError::OperationCanceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_token_is_shared() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
        other.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_uncancelled_script_completes() {
        let lua = Lua::new().unwrap();
        let token = CancellationToken::new();
        lua.set_hook(Rc::new(CancellationHook::with_events(token, HookEvents::COUNT, 10)))
            .unwrap();

        let total: i64 = lua.evaluate("(function() local s = 0 for i = 1, 1000 do s = s + i end return s end)()").unwrap();
        assert_eq!(total, 500500);
    }

    #[test]
    fn test_cancelled_loop_stops() {
        let lua = Lua::new().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        lua.set_hook(Rc::new(CancellationHook::new(token))).unwrap();

        let err = lua.execute("while true do end").unwrap_err();
        assert!(matches!(err, LuaError::Runtime { .. }));
        assert!(matches!(err.unwrap_exception(), LuaError::OperationCanceled));
    }
}
