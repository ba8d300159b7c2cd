//! Standard libraries
//!
//! Libraries are opened with `luaL_requiref`, which also records them in
//! the registry's loaded table. Closing a library removes its globals and
//! that record, so `require` cannot bring it back either.

use std::ffi::CStr;
use std::fmt;
use std::str::FromStr;

use mlua_sys as ffi;

use crate::error::{LuaError, Result};
use crate::protect::{check_stack, protect_lua_call};
use crate::stack::StackGuard;
use crate::state::Lua;

/// Globals defined by the base library
const BASE_GLOBALS: &[&CStr] = &[
    c"assert",
    c"collectgarbage",
    c"dofile",
    c"error",
    c"getmetatable",
    c"ipairs",
    c"load",
    c"loadfile",
    c"next",
    c"pairs",
    c"pcall",
    c"print",
    c"rawequal",
    c"rawget",
    c"rawlen",
    c"rawset",
    c"select",
    c"setmetatable",
    c"tonumber",
    c"tostring",
    c"type",
    c"warn",
    c"xpcall",
    c"_VERSION",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LuaLibrary {
    Base,
    Coroutine,
    Table,
    Io,
    Os,
    String,
    Utf8,
    Math,
    Debug,
    Package,
}

impl LuaLibrary {
    pub const ALL: [LuaLibrary; 10] = [
        LuaLibrary::Base,
        LuaLibrary::Coroutine,
        LuaLibrary::Table,
        LuaLibrary::Io,
        LuaLibrary::Os,
        LuaLibrary::String,
        LuaLibrary::Utf8,
        LuaLibrary::Math,
        LuaLibrary::Debug,
        LuaLibrary::Package,
    ];

    /// Libraries with no file system, process or debug access
    pub const SAFE: [LuaLibrary; 6] = [
        LuaLibrary::Base,
        LuaLibrary::Coroutine,
        LuaLibrary::Table,
        LuaLibrary::String,
        LuaLibrary::Utf8,
        LuaLibrary::Math,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LuaLibrary::Base => "base",
            LuaLibrary::Coroutine => "coroutine",
            LuaLibrary::Table => "table",
            LuaLibrary::Io => "io",
            LuaLibrary::Os => "os",
            LuaLibrary::String => "string",
            LuaLibrary::Utf8 => "utf8",
            LuaLibrary::Math => "math",
            LuaLibrary::Debug => "debug",
            LuaLibrary::Package => "package",
        }
    }

    /// Key in the loaded table
    fn module_name(self) -> &'static CStr {
        match self {
            LuaLibrary::Base => c"_G",
            LuaLibrary::Coroutine => c"coroutine",
            LuaLibrary::Table => c"table",
            LuaLibrary::Io => c"io",
            LuaLibrary::Os => c"os",
            LuaLibrary::String => c"string",
            LuaLibrary::Utf8 => c"utf8",
            LuaLibrary::Math => c"math",
            LuaLibrary::Debug => c"debug",
            LuaLibrary::Package => c"package",
        }
    }

    fn opener(self) -> ffi::lua_CFunction {
        match self {
            LuaLibrary::Base => ffi::luaopen_base,
            LuaLibrary::Coroutine => ffi::luaopen_coroutine,
            LuaLibrary::Table => ffi::luaopen_table,
            LuaLibrary::Io => ffi::luaopen_io,
            LuaLibrary::Os => ffi::luaopen_os,
            LuaLibrary::String => ffi::luaopen_string,
            LuaLibrary::Utf8 => ffi::luaopen_utf8,
            LuaLibrary::Math => ffi::luaopen_math,
            LuaLibrary::Debug => ffi::luaopen_debug,
            LuaLibrary::Package => ffi::luaopen_package,
        }
    }

    /// Globals removed when the library is closed
    fn globals(self) -> &'static [&'static CStr] {
        match self {
            LuaLibrary::Base => BASE_GLOBALS,
            LuaLibrary::Package => &[c"package", c"require"],
            LuaLibrary::Coroutine => &[c"coroutine"],
            LuaLibrary::Table => &[c"table"],
            LuaLibrary::Io => &[c"io"],
            LuaLibrary::Os => &[c"os"],
            LuaLibrary::String => &[c"string"],
            LuaLibrary::Utf8 => &[c"utf8"],
            LuaLibrary::Math => &[c"math"],
            LuaLibrary::Debug => &[c"debug"],
        }
    }
}

impl FromStr for LuaLibrary {
    type Err = LuaError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_lowercase();
        if lower == "_g" {
            return Ok(LuaLibrary::Base);
        }
        LuaLibrary::ALL
            .into_iter()
            .find(|library| library.name() == lower)
            .ok_or_else(|| LuaError::InvalidValue(format!("unknown library '{}'", s)))
    }
}

impl fmt::Display for LuaLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Lua {
    /// Open `library`. Opening an open library does nothing.
    pub fn open_library(&self, library: LuaLibrary) -> Result<()> {
        let state = self.state()?;
        if self.is_library_open(library) {
            return Ok(());
        }

        let module = library.module_name().as_ptr();
        let opener = library.opener();
        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 3)?;
            protect_lua_call(self.extra(), state, 0, 0, |state| {
                ffi::luaL_requiref(state, module, opener, 1);
                ffi::lua_pop(state, 1);
            })?;
        }

        self.extra().open_libraries.borrow_mut().insert(library);
        tracing::debug!(library = library.name(), "opened library");
        Ok(())
    }

    pub fn open_library_by_name(&self, name: &str) -> Result<()> {
        self.open_library(name.parse()?)
    }

    /// Remove the library's globals and its loaded-table entry.
    ///
    /// Closing a library that is not open does nothing.
    pub fn close_library(&self, library: LuaLibrary) -> Result<()> {
        let state = self.state()?;
        if !self.is_library_open(library) {
            return Ok(());
        }

        let module = library.module_name().as_ptr();
        let globals = library.globals();
        unsafe {
            let _guard = StackGuard::new(state);
            check_stack(state, 4)?;
            protect_lua_call(self.extra(), state, 0, 0, |state| {
                ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS);
                for name in globals {
                    ffi::lua_pushnil(state);
                    ffi::lua_setfield(state, -2, name.as_ptr());
                }
                ffi::lua_pop(state, 1);

                if ffi::lua_getfield(state, ffi::LUA_REGISTRYINDEX, c"_LOADED".as_ptr()) == ffi::LUA_TTABLE {
                    ffi::lua_pushnil(state);
                    ffi::lua_setfield(state, -2, module);
                }
                ffi::lua_pop(state, 1);
            })?;
        }

        self.extra().open_libraries.borrow_mut().remove(&library);
        tracing::debug!(library = library.name(), "closed library");
        Ok(())
    }

    pub fn close_library_by_name(&self, name: &str) -> Result<()> {
        self.close_library(name.parse()?)
    }

    pub fn is_library_open(&self, library: LuaLibrary) -> bool {
        self.extra().open_libraries.borrow().contains(&library)
    }

    /// Open libraries, in declaration order
    pub fn open_libraries(&self) -> Vec<LuaLibrary> {
        self.extra().open_libraries.borrow().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LuaConfig;
    use crate::value::ValueType;

    fn bare() -> Lua {
        Lua::with_config(LuaConfig::default().with_libraries(Vec::new())).unwrap()
    }

    fn global_type(lua: &Lua, name: &str) -> ValueType {
        lua.globals().unwrap().get::<_, crate::Value>(name).unwrap().value_type()
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("math".parse::<LuaLibrary>().unwrap(), LuaLibrary::Math);
        assert_eq!("UTF8".parse::<LuaLibrary>().unwrap(), LuaLibrary::Utf8);
        assert_eq!("_G".parse::<LuaLibrary>().unwrap(), LuaLibrary::Base);
        assert!("sockets".parse::<LuaLibrary>().is_err());
        assert_eq!(LuaLibrary::Coroutine.to_string(), "coroutine");
    }

    #[test]
    fn test_open_and_close() {
        let lua = bare();
        assert_eq!(global_type(&lua, "string"), ValueType::Nil);

        lua.open_library_by_name("string").unwrap();
        assert!(lua.is_library_open(LuaLibrary::String));
        assert_eq!(global_type(&lua, "string"), ValueType::Table);

        lua.close_library(LuaLibrary::String).unwrap();
        assert!(!lua.is_library_open(LuaLibrary::String));
        assert_eq!(global_type(&lua, "string"), ValueType::Nil);
    }

    #[test]
    fn test_closing_base_removes_globals() {
        let lua = bare();
        lua.open_library(LuaLibrary::Base).unwrap();
        assert_eq!(global_type(&lua, "print"), ValueType::Function);

        lua.close_library(LuaLibrary::Base).unwrap();
        assert_eq!(global_type(&lua, "print"), ValueType::Nil);
        assert_eq!(global_type(&lua, "pcall"), ValueType::Nil);
    }

    #[test]
    fn test_closed_library_cannot_be_required() {
        let lua = bare();
        lua.open_library(LuaLibrary::Base).unwrap();
        lua.open_library(LuaLibrary::Package).unwrap();
        lua.open_library(LuaLibrary::Math).unwrap();
        let loaded: bool = lua.evaluate("package.loaded.math ~= nil").unwrap();
        assert!(loaded);

        lua.close_library(LuaLibrary::Math).unwrap();
        let loaded: bool = lua.evaluate("package.loaded.math ~= nil").unwrap();
        assert!(!loaded);
        assert_eq!(lua.open_libraries(), vec![LuaLibrary::Base, LuaLibrary::Package]);
    }
}
