//! Error types for Ferrolua
//!
//! Every failure that crosses the native boundary ends up as a [`LuaError`].
//! Native status codes are converted at the protected-call checkpoint and
//! host errors raised from callbacks travel through the interpreter as
//! smuggled objects, so the original error is always reachable as a cause.

use std::error::Error as StdError;
use std::os::raw::c_int;
use std::sync::Arc;
use std::time::Duration;

use mlua_sys as ffi;

/// Type alias for Results throughout Ferrolua
pub type Result<T> = std::result::Result<T, LuaError>;

/// Main error type for Ferrolua operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum LuaError {
    /// A stack slot does not hold the expected or a referenceable type
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// An operation was attempted on a disposed reference or state
    #[error("cannot access a disposed {0}")]
    ObjectDisposed(&'static str),

    /// The native stack could not grow to the requested capacity
    #[error("stack overflow: unable to reserve {0} additional stack slots")]
    StackOverflow(usize),

    /// Native runtime error (`LUA_ERRRUN`)
    #[error("runtime error: {message}")]
    Runtime {
        message: String,
        #[source]
        cause: Option<Arc<LuaError>>,
    },

    /// Native syntax error (`LUA_ERRSYNTAX`)
    #[error("syntax error: {message}")]
    Syntax {
        message: String,
        #[source]
        cause: Option<Arc<LuaError>>,
    },

    /// Native memory error (`LUA_ERRMEM`)
    #[error("memory error: {message}")]
    Memory {
        message: String,
        #[source]
        cause: Option<Arc<LuaError>>,
    },

    /// Error while running the message handler (`LUA_ERRERR`)
    #[error("error in error handling: {message}")]
    Handler {
        message: String,
        #[source]
        cause: Option<Arc<LuaError>>,
    },

    /// An unprotected native error escaped to the top of the interpreter
    #[error("unprotected error in call to Lua API ({message})")]
    Panic {
        message: String,
        #[source]
        cause: Option<Arc<LuaError>>,
    },

    /// Raised by the cancellation hook
    #[error("the operation was canceled")]
    OperationCanceled,

    /// Raised by the instruction limit hook
    #[error("instruction limit of {0} exceeded")]
    InstructionLimitExceeded(u64),

    /// Raised by the timeout hook
    #[error("script execution exceeded the timeout of {0:?}")]
    Timeout(Duration),

    /// Feature deliberately not supported
    #[error("{0} is not supported")]
    NotSupported(String),

    /// Invalid operation for the current state of an object
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Arbitrary host error
    #[error(transparent)]
    External(Arc<dyn StdError + Send + Sync>),
}

impl LuaError {
    /// Create a plain script error.
    ///
    /// When returned from a host callback this is raised as a native string
    /// error, so scripts observe the message itself.
    pub fn runtime(message: impl Into<String>) -> Self {
        LuaError::Runtime {
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap an arbitrary host error
    pub fn external<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        LuaError::External(Arc::new(error))
    }

    /// Build a structured error from a native status code
    pub(crate) fn from_status(status: c_int, message: String, cause: Option<Arc<LuaError>>) -> Self {
        match status {
            ffi::LUA_ERRSYNTAX => LuaError::Syntax { message, cause },
            ffi::LUA_ERRMEM => LuaError::Memory { message, cause },
            ffi::LUA_ERRERR => LuaError::Handler { message, cause },
            _ => LuaError::Runtime { message, cause },
        }
    }

    /// Whether this error was produced from a native status code or the panic handler
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            LuaError::Runtime { .. }
                | LuaError::Syntax { .. }
                | LuaError::Memory { .. }
                | LuaError::Handler { .. }
                | LuaError::Panic { .. }
        )
    }

    /// Whether this error came from the panic handler
    pub fn is_panic(&self) -> bool {
        matches!(self, LuaError::Panic { .. })
    }

    /// The wrapped cause of a structured error, if any
    pub fn cause(&self) -> Option<&Arc<LuaError>> {
        match self {
            LuaError::Runtime { cause, .. }
            | LuaError::Syntax { cause, .. }
            | LuaError::Memory { cause, .. }
            | LuaError::Handler { cause, .. }
            | LuaError::Panic { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    /// The native message of a structured error
    pub fn message(&self) -> Option<&str> {
        match self {
            LuaError::Runtime { message, .. }
            | LuaError::Syntax { message, .. }
            | LuaError::Memory { message, .. }
            | LuaError::Handler { message, .. }
            | LuaError::Panic { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Walk nested structured errors down to the error that started it all.
    ///
    /// Returns the first non-structured cause, or the innermost structured
    /// error when the chain ends without one. A panic error wrapping a
    /// structured error is unwrapped through both levels.
    pub fn unwrap_exception(&self) -> &LuaError {
        let mut current = self;
        while current.is_structured() {
            match current.cause() {
                Some(inner) => current = inner.as_ref(),
                None => break,
            }
        }
        current
    }

    /// Downcast an external host error
    pub fn downcast_external<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            LuaError::External(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<std::str::Utf8Error> for LuaError {
    fn from(err: std::str::Utf8Error) -> Self {
        LuaError::InvalidValue(format!("string is not valid UTF-8: {}", err))
    }
}

impl From<std::io::Error> for LuaError {
    fn from(err: std::io::Error) -> Self {
        LuaError::external(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct HostFailure;

    impl std::fmt::Display for HostFailure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "host failure")
        }
    }

    impl StdError for HostFailure {}

    #[test]
    fn test_unwrap_plain_structured_error() {
        let err = LuaError::runtime("boom");
        assert!(matches!(err.unwrap_exception(), LuaError::Runtime { message, .. } if message == "boom"));
    }

    #[test]
    fn test_unwrap_nested_cause() {
        let host = LuaError::external(HostFailure);
        let inner = LuaError::Runtime {
            message: "host failure".to_string(),
            cause: Some(Arc::new(host)),
        };
        let outer = LuaError::Runtime {
            message: "host failure".to_string(),
            cause: Some(Arc::new(inner)),
        };

        let unwrapped = outer.unwrap_exception();
        assert!(unwrapped.downcast_external::<HostFailure>().is_some());
    }

    #[test]
    fn test_unwrap_panic_wrapper() {
        let inner = LuaError::Runtime {
            message: "canceled".to_string(),
            cause: Some(Arc::new(LuaError::OperationCanceled)),
        };
        let panic = LuaError::Panic {
            message: "canceled".to_string(),
            cause: Some(Arc::new(inner)),
        };

        assert!(panic.is_panic());
        assert!(matches!(panic.unwrap_exception(), LuaError::OperationCanceled));
    }

    #[test]
    fn test_from_status() {
        let err = LuaError::from_status(ffi::LUA_ERRSYNTAX, "bad".to_string(), None);
        assert!(matches!(err, LuaError::Syntax { .. }));

        let err = LuaError::from_status(ffi::LUA_ERRMEM, "oom".to_string(), None);
        assert!(matches!(err, LuaError::Memory { .. }));

        let err = LuaError::from_status(ffi::LUA_ERRERR, "handler".to_string(), None);
        assert!(matches!(err, LuaError::Handler { .. }));

        let err = LuaError::from_status(ffi::LUA_ERRRUN, "run".to_string(), None);
        assert_eq!(err.message(), Some("run"));
    }
}
