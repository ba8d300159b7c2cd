//! Chunk loading, dumping and caching
//!
//! Functions are dumped to the interpreter's byte-code format through a
//! [`ChunkWriter`]. A writer error stops the dump and is returned as the cause
//! of the resulting [`LuaError::Runtime`].
//!
//! [`ChunkCache`] keeps compiled byte-code keyed by the SHA-1 hex digest of
//! the source, so a script is only parsed once.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::io::Write;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::str::FromStr;
use std::sync::Arc;

use mlua_sys as ffi;
use sha1::{Digest, Sha1};

use crate::error::{LuaError, Result};
use crate::protect::{check_stack, pop_error, protect_lua_call};
use crate::reference::{LuaFunction, LuaReference, ReferenceKind};
use crate::stack::StackGuard;
use crate::state::Lua;

/// Sink for dumped byte-code
pub trait ChunkWriter {
    fn write_chunk(&mut self, bytes: &[u8]) -> Result<()>;
}

impl ChunkWriter for Vec<u8> {
    fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Adapts any [`Write`] into a [`ChunkWriter`]
pub struct IoChunkWriter<W> {
    inner: W,
}

impl<W: Write> IoChunkWriter<W> {
    pub fn new(inner: W) -> Self {
        IoChunkWriter { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> ChunkWriter for IoChunkWriter<W> {
    fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        Ok(())
    }
}

/// Kinds of chunk accepted by a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkMode {
    Text,
    Binary,
    #[default]
    Both,
}

impl ChunkMode {
    fn as_native(self) -> &'static CStr {
        match self {
            ChunkMode::Text => c"t",
            ChunkMode::Binary => c"b",
            ChunkMode::Both => c"bt",
        }
    }
}

impl FromStr for ChunkMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "t" => Ok(ChunkMode::Text),
            "binary" | "b" => Ok(ChunkMode::Binary),
            "both" | "bt" => Ok(ChunkMode::Both),
            other => Err(format!("unknown chunk mode '{}'", other)),
        }
    }
}

impl fmt::Display for ChunkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkMode::Text => write!(f, "text"),
            ChunkMode::Binary => write!(f, "binary"),
            ChunkMode::Both => write!(f, "both"),
        }
    }
}

struct DumpState<'a> {
    writer: &'a mut dyn ChunkWriter,
    error: Option<LuaError>,
    panic: Option<Box<dyn Any + Send + 'static>>,
}

unsafe extern "C-unwind" fn write_chunk(
    _state: *mut ffi::lua_State,
    p: *const c_void,
    size: usize,
    ud: *mut c_void,
) -> c_int {
    let dump = &mut *(ud as *mut DumpState);
    if dump.error.is_some() || dump.panic.is_some() {
        return 1;
    }

    let bytes = if p.is_null() || size == 0 {
        &[][..]
    } else {
        slice::from_raw_parts(p as *const u8, size)
    };
    match panic::catch_unwind(AssertUnwindSafe(|| dump.writer.write_chunk(bytes))) {
        Ok(Ok(())) => 0,
        Ok(Err(error)) => {
            dump.error = Some(error);
            1
        }
        Err(payload) => {
            dump.panic = Some(payload);
            1
        }
    }
}

impl LuaFunction {
    /// Write the function's byte-code to `writer`; `strip` drops debug information
    pub fn dump(&self, writer: &mut dyn ChunkWriter, strip: bool) -> Result<()> {
        let lua = self.0.lua();
        let state = lua.state()?;

        let mut dump = DumpState {
            writer,
            error: None,
            panic: None,
        };
        let ud = &mut dump as *mut DumpState as *mut c_void;

        let status = unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 2)?;
            self.0.push_onto(state)?;
            protect_lua_call(lua.extra(), state, 1, 0, |state| {
                ffi::lua_dump(state, write_chunk, ud, strip as c_int)
            })?
        };

        if let Some(payload) = dump.panic {
            panic::resume_unwind(payload);
        }
        if let Some(error) = dump.error {
            return Err(LuaError::Runtime {
                message: format!("chunk writer failed: {}", error),
                cause: Some(Arc::new(error)),
            });
        }
        if status != 0 {
            return Err(LuaError::runtime("unable to dump given function"));
        }
        Ok(())
    }

    /// Dump into a new buffer
    pub fn dump_to_vec(&self, strip: bool) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.dump(&mut bytes, strip)?;
        Ok(bytes)
    }
}

fn chunk_name(name: &str) -> Result<CString> {
    let name = if name.starts_with('=') || name.starts_with('@') {
        name.to_string()
    } else {
        format!("={}", name)
    };
    CString::new(name).map_err(|_| LuaError::InvalidValue("chunk name contains a NUL byte".to_string()))
}

impl Lua {
    /// Compile source text or byte-code without running it.
    ///
    /// `name` is used in error messages; it is taken literally unless it
    /// starts with `=` or `@`.
    pub fn load_chunk(&self, chunk: &[u8], name: &str, mode: ChunkMode) -> Result<LuaFunction> {
        let state = self.state()?;
        let extra = self.extra();
        let name = chunk_name(name)?;

        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 2)?;
            let status = {
                let _enter = extra.boundary.enter();
                ffi::luaL_loadbufferx(
                    state,
                    chunk.as_ptr() as *const c_char,
                    chunk.len(),
                    name.as_ptr(),
                    mode.as_native().as_ptr(),
                )
            };
            if status != ffi::LUA_OK {
                return Err(pop_error(extra, state, status));
            }
            Ok(LuaFunction::from_reference(LuaReference::capture(self, state, -1)?))
        }
    }
}

/// Compiled byte-code keyed by source digest
#[derive(Debug, Default)]
pub struct ChunkCache {
    chunks: HashMap<String, Vec<u8>>,
    strip: bool,
    hits: u64,
    misses: u64,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache stripped byte-code, without debug information
    pub fn stripped() -> Self {
        ChunkCache {
            strip: true,
            ..Self::default()
        }
    }

    /// SHA-1 hex digest of `source`, the cache key
    pub fn digest(source: &[u8]) -> String {
        let mut hasher = Sha1::new();
        hasher.update(source);
        hex::encode(hasher.finalize())
    }

    /// Load `source`, compiling it only on the first request
    pub fn load(&mut self, lua: &Lua, source: &[u8], name: &str) -> Result<LuaFunction> {
        let digest = Self::digest(source);
        if let Some(bytes) = self.chunks.get(&digest) {
            self.hits += 1;
            return lua.load_chunk(bytes, name, ChunkMode::Binary);
        }

        let function = lua.load_chunk(source, name, ChunkMode::Text)?;
        let bytes = function.dump_to_vec(self.strip)?;
        self.misses += 1;
        tracing::debug!(%digest, size = bytes.len(), "cached compiled chunk");
        self.chunks.insert(digest, bytes);
        Ok(function)
    }

    /// Load a chunk cached earlier, by digest
    pub fn load_by_digest(&mut self, lua: &Lua, digest: &str, name: &str) -> Result<LuaFunction> {
        let bytes = self
            .chunks
            .get(digest)
            .ok_or_else(|| LuaError::InvalidValue(format!("no cached chunk for digest {}", digest)))?;
        self.hits += 1;
        lua.load_chunk(bytes, name, ChunkMode::Binary)
    }

    pub fn exists(&self, digest: &str) -> bool {
        self.chunks.contains_key(digest)
    }

    pub fn remove(&mut self, digest: &str) -> bool {
        self.chunks.remove(digest).is_some()
    }

    pub fn flush(&mut self) {
        self.chunks.clear();
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// `(hits, misses)` since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct BrokenPipe;

    impl fmt::Display for BrokenPipe {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "sink closed")
        }
    }

    impl std::error::Error for BrokenPipe {}

    struct FailingWriter {
        error: LuaError,
    }

    impl ChunkWriter for FailingWriter {
        fn write_chunk(&mut self, _bytes: &[u8]) -> Result<()> {
            Err(self.error.clone())
        }
    }

    #[test]
    fn test_dump_and_reload() {
        let lua = Lua::new().unwrap();
        let function = lua.load("return 42", "answer").unwrap();
        let bytes = function.dump_to_vec(false).unwrap();
        assert!(!bytes.is_empty());

        let reloaded = lua.load_chunk(&bytes, "answer", ChunkMode::Binary).unwrap();
        let original: i64 = function.call(()).unwrap();
        let copy: i64 = reloaded.call(()).unwrap();
        assert_eq!(original, 42);
        assert_eq!(copy, 42);
    }

    #[test]
    fn test_failing_writer_is_cause() {
        let lua = Lua::new().unwrap();
        let function = lua.load("return 1", "one").unwrap();
        let mut writer = FailingWriter {
            error: LuaError::external(BrokenPipe),
        };

        let err = function.dump(&mut writer, false).unwrap_err();
        assert!(matches!(err, LuaError::Runtime { .. }));
        assert!(err.unwrap_exception().downcast_external::<BrokenPipe>().is_some());
    }

    #[test]
    fn test_native_function_cannot_be_dumped() {
        let lua = Lua::new().unwrap();
        let print: LuaFunction = lua.get_global("print").unwrap();
        assert!(print.dump_to_vec(false).is_err());
    }

    #[test]
    fn test_mode_restrictions() {
        let lua = Lua::new().unwrap();
        let bytes = lua.load("return 1", "one").unwrap().dump_to_vec(true).unwrap();

        let err = lua.load_chunk(&bytes, "one", ChunkMode::Text).unwrap_err();
        assert!(matches!(err, LuaError::Syntax { .. }));
        let err = lua.load_chunk(b"return 1", "one", ChunkMode::Binary).unwrap_err();
        assert!(matches!(err, LuaError::Syntax { .. }));
    }

    #[test]
    fn test_io_writer_to_file() {
        let lua = Lua::new().unwrap();
        let function = lua.load("return 'from file'", "file").unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = IoChunkWriter::new(file.reopen().unwrap());
        function.dump(&mut writer, false).unwrap();
        writer.into_inner().flush().unwrap();

        let bytes = std::fs::read(file.path()).unwrap();
        let reloaded = lua.load_chunk(&bytes, "file", ChunkMode::Both).unwrap();
        let text: String = reloaded.call(()).unwrap();
        assert_eq!(text, "from file");
    }

    #[test]
    fn test_chunk_cache_reuses_bytecode() {
        let lua = Lua::new().unwrap();
        let mut cache = ChunkCache::new();
        let source = b"return 6 * 7";

        let first: i64 = cache.load(&lua, source, "cached").unwrap().call(()).unwrap();
        let second: i64 = cache.load(&lua, source, "cached").unwrap().call(()).unwrap();
        assert_eq!(first, 42);
        assert_eq!(second, 42);
        assert_eq!(cache.stats(), (1, 1));

        let digest = ChunkCache::digest(source);
        assert_eq!(digest.len(), 40);
        assert!(cache.exists(&digest));
        let third: i64 = cache.load_by_digest(&lua, &digest, "cached").unwrap().call(()).unwrap();
        assert_eq!(third, 42);

        cache.flush();
        assert!(cache.is_empty());
        assert!(cache.load_by_digest(&lua, &digest, "cached").is_err());
    }

    #[test]
    fn test_digest_matches_sha1() {
        assert_eq!(ChunkCache::digest(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }
}
