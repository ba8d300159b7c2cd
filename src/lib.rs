//! Ferrolua library
//!
//! A managed embedding layer over the Lua 5.4 C API. Interpreter values are
//! held through registry references, every native call that can raise runs
//! inside a protection frame, and host objects cross into scripts as
//! userdata with descriptor-driven metatables.

pub mod alloc;
pub mod config;
pub mod convert;
pub mod debug;
pub mod dump;
pub mod error;
pub mod gc;
pub mod hook;
pub mod library;
pub mod protect;
pub mod reference;
pub mod stack;
pub mod state;
pub mod userdata;
pub mod value;

mod marshal;
mod registry;

// Re-export commonly used types
pub use alloc::AllocatorStats;
pub use config::{parse_config_file, parse_config_str, ConfigParseError, LuaConfig};
pub use convert::{FromLua, FromLuaMulti, IntoLua, IntoLuaMulti};
pub use debug::{ActivationRecord, DebugInfo};
pub use dump::{ChunkCache, ChunkMode, ChunkWriter, IoChunkWriter};
pub use error::{LuaError, Result};
pub use gc::{GcMode, LuaGc};
pub use hook::{
    CancellationHook, CancellationToken, CombinedHook, HookEvent, HookEvents, InstructionLimitHook, LuaHook,
    TimeoutHook,
};
pub use library::LuaLibrary;
pub use protect::{BoundaryState, LuaPanic};
pub use reference::{
    CoroutineState, LuaFunction, LuaReference, LuaTable, LuaThread, LuaUserData, ReferenceKind, ThreadStatus,
    WeakReference,
};
pub use stack::{LuaStack, StackSnapshot};
pub use state::Lua;
pub use userdata::{
    HostFunction, HostType, MemberFilter, MembersBuilder, ObjectDescriptor, UserDataDescriptor, UserDataHandle,
};
pub use value::{LightUserData, LuaString, MultiValue, Value, ValueType};
