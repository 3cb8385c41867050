//! Error types for the make/Python bridge
//!
//! Only contract and setup failures live here. Failures raised by Python
//! callables during dispatch are never turned into a `BridgeError`: they are
//! handed to the error reporter, which publishes them through make.

use std::fmt;

use pyo3::exceptions::{PyImportError, PyTypeError, PyValueError};
use pyo3::PyErr;

use crate::config::ConfigError;

/// Largest name, and largest arity bound, make accepts for a function.
pub const MAX_FUNCTION_NAME: usize = 255;

#[derive(Debug)]
pub enum BridgeError {
    /// `min_args`/`max_args` outside 0..=255, or `max_args` below `min_args`
    InvalidArity { min_args: i64, max_args: i64 },
    /// Encoded function name longer than make allows
    NameTooLong(usize),
    /// A name or filename passed to make contains a NUL byte
    NulByte { what: &'static str },
    /// A filename was given without a line number, or the other way around
    IncompleteLocation,
    /// The bridge is not running inside make
    HostUnavailable,
    /// A required make API symbol could not be resolved
    Symbol { name: &'static str, error: SymbolError },
    Config(ConfigError),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArity { min_args, max_args } => {
                if *min_args < 0 || *max_args < 0 {
                    write!(f, "negative args (min_args={}, max_args={})", min_args, max_args)
                } else if *min_args > 255 || *max_args > 255 {
                    write!(f, "too many args (min_args={}, max_args={})", min_args, max_args)
                } else {
                    write!(f, "max_args < min_args ({} < {})", max_args, min_args)
                }
            }
            Self::NameTooLong(len) => {
                write!(f, "name too long ({} bytes, limit {})", len, MAX_FUNCTION_NAME)
            }
            Self::NulByte { what } => write!(f, "{} contains a NUL byte", what),
            Self::IncompleteLocation => {
                write!(f, "filename and lineno must be given together")
            }
            Self::HostUnavailable => write!(f, "GNU make not detected"),
            Self::Symbol { name, error } => write!(f, "{}: {}", name, error),
            Self::Config(err) => write!(f, "configuration error: {}", err),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Symbol { error, .. } => Some(error),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<BridgeError> for PyErr {
    fn from(err: BridgeError) -> PyErr {
        match err {
            BridgeError::IncompleteLocation => PyTypeError::new_err(err.to_string()),
            BridgeError::HostUnavailable | BridgeError::Symbol { .. } => {
                PyImportError::new_err(err.to_string())
            }
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

/// Symbol lookup errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolError {
    InvalidName,
    NotFound,
}

impl fmt::Display for SymbolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName => write!(f, "Invalid symbol name"),
            Self::NotFound => write!(f, "Symbol not found"),
        }
    }
}

impl std::error::Error for SymbolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_messages() {
        let err = BridgeError::InvalidArity { min_args: 3, max_args: 1 };
        assert_eq!(err.to_string(), "max_args < min_args (1 < 3)");

        let err = BridgeError::InvalidArity { min_args: 0, max_args: 256 };
        assert!(err.to_string().starts_with("too many args"));

        let err = BridgeError::InvalidArity { min_args: -1, max_args: 0 };
        assert!(err.to_string().starts_with("negative args"));
    }

    #[test]
    fn test_symbol_source() {
        use std::error::Error;

        let err = BridgeError::Symbol { name: "gmk_eval", error: SymbolError::NotFound };
        assert_eq!(err.to_string(), "gmk_eval: Symbol not found");
        assert!(err.source().is_some());
    }
}
