//! Bridge configuration
//!
//! Loaded from a TOML file named by the make variable `PYTHON_BRIDGE_CONFIG`.
//! Every section is optional; a makefile that never mentions the variable
//! gets the defaults below.

use std::ffi::CString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::host::{Host, HostString};

/// Make variable naming the configuration file
pub const CONFIG_VARIABLE: &str = "PYTHON_BRIDGE_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub errors: ErrorConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub python: PythonConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Names of the make variables the error reporter reads and writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorConfig {
    #[serde(default = "default_last_error")]
    pub last_error_variable: String,

    #[serde(default = "default_fatal")]
    pub fatal_variable: String,

    #[serde(default = "default_traceback")]
    pub traceback_variable: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Make variables copied into the process environment before Python starts
    #[serde(default = "default_exports")]
    pub export: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonConfig {
    #[serde(default)]
    pub path: Vec<PathBuf>,

    #[serde(default = "default_true")]
    pub add_package_location: bool,

    #[serde(default)]
    pub startup_modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default)]
    pub json: bool,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            last_error_variable: default_last_error(),
            fatal_variable: default_fatal(),
            traceback_variable: default_traceback(),
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self { export: default_exports() }
    }
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            path: Vec::new(),
            add_package_location: true,
            startup_modules: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
            json: false,
        }
    }
}

fn default_last_error() -> String { "PYTHON_LAST_ERROR".to_string() }
fn default_fatal() -> String { "PYTHON_FATAL_ERRORS".to_string() }
fn default_traceback() -> String { "PYTHON_PRINT_TRACEBACK".to_string() }
fn default_level() -> String { "warn".to_string() }
fn default_true() -> bool { true }

fn default_exports() -> Vec<String> {
    [
        "PYTHONHOME",
        "PYTHONPATH",
        "PYTHONOPTIMIZE",
        "PYTHONDEBUG",
        "PYTHONDONTWRITEBYTECODE",
        "PYTHONINSPECT",
        "PYTHONIOENCODING",
        "PYTHONUSERSITE",
        "PYTHONUNBUFFERED",
        "PYTHONVERBOSE",
        "PYTHONWARNINGS",
        "PYTHONHASHSEED",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "Failed to read config {}: {}", path.display(), source)
            }
            Self::Parse(err) => write!(f, "Failed to parse config: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Resolve the configuration for the running makefile.
    ///
    /// Reads `$(PYTHON_BRIDGE_CONFIG)` through the host; an empty value means
    /// defaults.
    pub fn discover(host: &dyn Host) -> Result<Self, ConfigError> {
        match expand_variable(host, CONFIG_VARIABLE) {
            Some(path) if !path.trim().is_empty() => Self::load(Path::new(path.trim())),
            _ => Ok(Self::default()),
        }
    }
}

/// Expand `$(name)` through the host and return its text, lossily decoded.
///
/// Used before the interpreter exists, so it cannot go through the locale
/// codec the marshaling layer uses.
pub(crate) fn expand_variable(host: &dyn Host, name: &str) -> Option<String> {
    let reference = CString::new(format!("$({})", name)).ok()?;
    let expanded = HostString::expand(host, &reference)?;
    Some(String::from_utf8_lossy(expanded.as_bytes()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.errors.last_error_variable, "PYTHON_LAST_ERROR");
        assert_eq!(config.errors.fatal_variable, "PYTHON_FATAL_ERRORS");
        assert!(config.environment.export.contains(&"PYTHONPATH".to_string()));
        assert!(config.python.add_package_location);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[errors]
last_error_variable = "LAST_PY_ERROR"

[python]
path = ["build/python"]
startup_modules = ["buildtools"]

[logging]
level = "debug"
json = true
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.errors.last_error_variable, "LAST_PY_ERROR");
        assert_eq!(config.errors.fatal_variable, "PYTHON_FATAL_ERRORS");
        assert_eq!(config.python.path, vec![PathBuf::from("build/python")]);
        assert_eq!(config.python.startup_modules, vec!["buildtools".to_string()]);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(Config::parse("[errors"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_discover() {
        let host = MemoryHost::new();
        assert_eq!(
            Config::discover(&host).unwrap().errors.last_error_variable,
            "PYTHON_LAST_ERROR"
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[errors]\nfatal_variable = \"STRICT\"\n").unwrap();
        host.set_variable(CONFIG_VARIABLE, &file.path().to_string_lossy());

        assert_eq!(Config::discover(&host).unwrap().errors.fatal_variable, "STRICT");
    }

    #[test]
    fn test_discover_missing_file() {
        let host = MemoryHost::new();
        host.set_variable(CONFIG_VARIABLE, "/nonexistent/bridge.toml");
        assert!(matches!(Config::discover(&host), Err(ConfigError::Io { .. })));
    }
}
