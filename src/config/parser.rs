//! Configuration file parser
//!
//! One `parameter value...` pair per line; blank lines and lines starting
//! with `#` are ignored. Sizes accept `b`, `kb`, `mb` and `gb` suffixes.
//!
//! ```text
//! memory-limit 64mb
//! libraries base table string math
//! gc-mode generational 20 100
//! instruction-limit 1000000
//! hook-interval 500
//! chunk-mode text
//! strict-members yes
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use crate::dump::ChunkMode;
use crate::gc::GcMode;
use crate::library::LuaLibrary;

use super::LuaConfig;

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid line format
    #[error("Invalid line format at line {0}: {1}")]
    Format(usize, String),

    /// Invalid parameter value
    #[error("Invalid value for parameter '{0}' at line {1}: {2}")]
    Value(String, usize, String),

    /// Unknown parameter
    #[error("Unknown parameter '{0}' at line {1}")]
    UnknownParam(String, usize),
}

/// Parse a configuration file
pub fn parse_config_file(path: &Path) -> Result<LuaConfig, ConfigParseError> {
    let file = File::open(path)?;
    parse_config_reader(BufReader::new(file))
}

/// Parse configuration text
pub fn parse_config_str(text: &str) -> Result<LuaConfig, ConfigParseError> {
    parse_config_reader(BufReader::new(text.as_bytes()))
}

fn parse_config_reader<R: Read>(reader: BufReader<R>) -> Result<LuaConfig, ConfigParseError> {
    let mut config = LuaConfig::default();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.splitn(2, char::is_whitespace).collect();
        if parts.len() != 2 {
            return Err(ConfigParseError::Format(line_num + 1, line.to_string()));
        }

        let param = parts[0].trim().to_lowercase();
        let value = parts[1].trim();
        apply_config_param(&mut config, &param, value, line_num + 1)?;
    }

    Ok(config)
}

/// Apply a configuration parameter to the config
fn apply_config_param(config: &mut LuaConfig, param: &str, value: &str, line_num: usize) -> Result<(), ConfigParseError> {
    match param {
        "memory-limit" => {
            config.memory_limit = match value.to_lowercase().as_str() {
                "unlimited" | "0" => None,
                _ => {
                    let bytes = parse_size(param, value, line_num)?;
                    let bytes = usize::try_from(bytes)
                        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.to_string()))?;
                    Some(bytes)
                }
            };
        }

        "libraries" => {
            config.libraries = parse_libraries(param, value, line_num)?;
        }

        "gc-mode" => {
            config.gc_mode = parse_gc_mode(param, value, line_num)?;
        }

        "instruction-limit" => {
            let limit: u64 = parse_value(param, value, line_num)?;
            config.instruction_limit = if limit == 0 { None } else { Some(limit) };
        }

        "hook-interval" => {
            let interval: u32 = parse_value(param, value, line_num)?;
            if interval == 0 {
                return Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string()));
            }
            config.hook_interval = interval;
        }

        "chunk-mode" => {
            config.chunk_mode = value
                .parse::<ChunkMode>()
                .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.to_string()))?;
        }

        "strict-members" => {
            config.strict_members = parse_yes_no(param, value, line_num)?;
        }

        _ => return Err(ConfigParseError::UnknownParam(param.to_string(), line_num)),
    }

    Ok(())
}

/// Parse a value that implements FromStr
fn parse_value<T: FromStr>(param: &str, value: &str, line_num: usize) -> Result<T, ConfigParseError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.to_string()))
}

/// Parse a yes/no value
fn parse_yes_no(param: &str, value: &str, line_num: usize) -> Result<bool, ConfigParseError> {
    match value.to_lowercase().as_str() {
        "yes" | "1" => Ok(true),
        "no" | "0" => Ok(false),
        _ => Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string())),
    }
}

/// Parse a size value (e.g., 64mb, 2gb)
fn parse_size(param: &str, value: &str, line_num: usize) -> Result<u64, ConfigParseError> {
    let value = value.trim().to_lowercase();
    let idx = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    if idx == 0 {
        return Err(ConfigParseError::Value(param.to_string(), line_num, value));
    }

    let num: u64 = value[..idx]
        .parse()
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.clone()))?;

    let multiplier = match &value[idx..] {
        "" | "b" => 1,
        "kb" => 1024,
        "mb" => 1024 * 1024,
        "gb" => 1024 * 1024 * 1024,
        _ => return Err(ConfigParseError::Value(param.to_string(), line_num, value)),
    };

    num.checked_mul(multiplier)
        .ok_or(ConfigParseError::Value(param.to_string(), line_num, value))
}

/// `all`, `safe`, `none` or a list of library names
fn parse_libraries(param: &str, value: &str, line_num: usize) -> Result<Vec<LuaLibrary>, ConfigParseError> {
    match value.to_lowercase().as_str() {
        "all" => return Ok(LuaLibrary::ALL.to_vec()),
        "safe" => return Ok(LuaLibrary::SAFE.to_vec()),
        "none" => return Ok(Vec::new()),
        _ => {}
    }

    let mut libraries = Vec::new();
    for name in value.split_whitespace() {
        let library = name
            .parse::<LuaLibrary>()
            .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, name.to_string()))?;
        if !libraries.contains(&library) {
            libraries.push(library);
        }
    }
    Ok(libraries)
}

/// `incremental [pause step-multiplier step-size]` or `generational [minor major]`
fn parse_gc_mode(param: &str, value: &str, line_num: usize) -> Result<GcMode, ConfigParseError> {
    let mut parts = value.split_whitespace();
    let kind = parts.next().unwrap_or_default().to_lowercase();
    let numbers = parts
        .map(|part| parse_value::<i32>(param, part, line_num))
        .collect::<Result<Vec<_>, _>>()?;
    let arg = |index: usize| numbers.get(index).copied().unwrap_or(0);

    match (kind.as_str(), numbers.len()) {
        ("incremental", 0..=3) => Ok(GcMode::Incremental {
            pause: arg(0),
            step_multiplier: arg(1),
            step_size: arg(2),
        }),
        ("generational", 0..=2) => Ok(GcMode::Generational {
            minor_multiplier: arg(0),
            major_multiplier: arg(1),
        }),
        _ => Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_basic_config() {
        let config_content = r#"
# Memory
memory-limit 64mb

# Libraries and collector
libraries base table string math
gc-mode generational 20 100

# Execution
instruction-limit 1000000
hook-interval 500
chunk-mode text
strict-members yes
"#;

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();
        write(path, config_content).unwrap();

        let config = parse_config_file(path).unwrap();

        assert_eq!(config.memory_limit, Some(64 * 1024 * 1024));
        assert_eq!(
            config.libraries,
            vec![LuaLibrary::Base, LuaLibrary::Table, LuaLibrary::String, LuaLibrary::Math]
        );
        assert_eq!(
            config.gc_mode,
            GcMode::Generational {
                minor_multiplier: 20,
                major_multiplier: 100
            }
        );
        assert_eq!(config.instruction_limit, Some(1_000_000));
        assert_eq!(config.hook_interval, 500);
        assert_eq!(config.chunk_mode, ChunkMode::Text);
        assert!(config.strict_members);
    }

    #[test]
    fn test_library_shorthands() {
        assert_eq!(parse_config_str("libraries safe").unwrap().libraries, LuaLibrary::SAFE.to_vec());
        assert!(parse_config_str("libraries none").unwrap().libraries.is_empty());
        assert!(matches!(
            parse_config_str("libraries base sockets"),
            Err(ConfigParseError::Value(_, 1, _))
        ));
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        assert!(matches!(
            parse_config_str("# comment\nmemory-limit"),
            Err(ConfigParseError::Format(2, _))
        ));
        assert!(matches!(
            parse_config_str("\n\nthreads 4"),
            Err(ConfigParseError::UnknownParam(_, 3))
        ));
        assert!(matches!(
            parse_config_str("hook-interval 0"),
            Err(ConfigParseError::Value(_, 1, _))
        ));
        assert!(matches!(
            parse_config_str("gc-mode incremental 1 2 3 4"),
            Err(ConfigParseError::Value(_, 1, _))
        ));
    }

    #[test]
    fn test_unlimited_memory() {
        let config = parse_config_str("memory-limit 1mb\nmemory-limit unlimited").unwrap();
        assert!(config.memory_limit.is_none());
    }

    #[test]
    fn test_parse_yes_no() {
        assert!(parse_yes_no("test", "yes", 1).unwrap());
        assert!(!parse_yes_no("test", "no", 1).unwrap());
        assert!(parse_yes_no("test", "1", 1).unwrap());
        assert!(!parse_yes_no("test", "0", 1).unwrap());
        assert!(parse_yes_no("test", "invalid", 1).is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("test", "1024", 1).unwrap(), 1024);
        assert_eq!(parse_size("test", "1kb", 1).unwrap(), 1024);
        assert_eq!(parse_size("test", "1mb", 1).unwrap(), 1024 * 1024);
        assert_eq!(parse_size("test", "1gb", 1).unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("test", "invalid", 1).is_err());
        assert!(parse_size("test", "12tb", 1).is_err());
    }
}
