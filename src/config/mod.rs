//! Configuration for Ferrolua states
//!
//! A [`LuaConfig`] is applied once, when the state is created. It can be
//! built in code or read from a line-oriented configuration file.

mod parser;

pub use parser::{parse_config_file, parse_config_str, ConfigParseError};

use crate::dump::ChunkMode;
use crate::gc::GcMode;
use crate::hook::DEFAULT_HOOK_INTERVAL;
use crate::library::LuaLibrary;

/// Settings applied by [`Lua::with_config`](crate::Lua::with_config)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuaConfig {
    /// Allocator cap in bytes (None = unlimited)
    pub memory_limit: Option<usize>,

    /// Standard libraries opened at creation
    pub libraries: Vec<LuaLibrary>,

    /// Collector mode
    pub gc_mode: GcMode,

    /// Installs an [`InstructionLimitHook`](crate::hook::InstructionLimitHook) when set
    pub instruction_limit: Option<u64>,

    /// Instructions between checks of the instruction limit
    pub hook_interval: u32,

    /// Chunks accepted by [`Lua::load`](crate::Lua::load)
    pub chunk_mode: ChunkMode,

    /// Require declaring types to opt in before their members are exposed
    pub strict_members: bool,
}

impl Default for LuaConfig {
    fn default() -> Self {
        LuaConfig {
            memory_limit: None,
            libraries: LuaLibrary::ALL.to_vec(),
            gc_mode: GcMode::default(),
            instruction_limit: None,
            hook_interval: DEFAULT_HOOK_INTERVAL,
            chunk_mode: ChunkMode::Both,
            strict_members: false,
        }
    }
}

impl LuaConfig {
    /// Only the libraries in [`LuaLibrary::SAFE`], text chunks only
    pub fn sandboxed() -> Self {
        LuaConfig {
            libraries: LuaLibrary::SAFE.to_vec(),
            chunk_mode: ChunkMode::Text,
            ..Self::default()
        }
    }

    pub fn with_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn with_libraries(mut self, libraries: Vec<LuaLibrary>) -> Self {
        self.libraries = libraries;
        self
    }

    pub fn with_gc_mode(mut self, mode: GcMode) -> Self {
        self.gc_mode = mode;
        self
    }

    pub fn with_instruction_limit(mut self, limit: Option<u64>) -> Self {
        self.instruction_limit = limit;
        self
    }

    pub fn with_hook_interval(mut self, interval: u32) -> Self {
        self.hook_interval = interval.max(1);
        self
    }

    pub fn with_chunk_mode(mut self, mode: ChunkMode) -> Self {
        self.chunk_mode = mode;
        self
    }

    pub fn with_strict_members(mut self, strict: bool) -> Self {
        self.strict_members = strict;
        self
    }
}
