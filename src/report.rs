//! Error reporter - publish Python failures through make variables
//!
//! Design: the single translation point from a failed call to make's side
//! channel. The formatted failure is stored with
//!
//! ```make
//! define PYTHON_LAST_ERROR
//! ValueError: bad input
//! endef
//! ```
//!
//! and, when `$(PYTHON_FATAL_ERRORS)` expands to anything, re-raised with
//! `$(error $(PYTHON_LAST_ERROR))`, which ends the make process. Variable
//! names come from `[errors]` in the configuration.

use std::ffi::CString;

use pyo3::prelude::*;
use pyo3::types::PyString;
use tracing::{error, warn};

use crate::config::expand_variable;
use crate::escape::escape_verbatim;
use crate::marshal::encode_locale;
use crate::session::Session;

/// What the reporter did with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reported {
    /// No failure pending; the error variable is undefined
    Cleared,
    /// Stored in the error variable; the build continues
    Recorded,
    /// Handed to `$(error ...)`; make does not come back from this
    Fatal,
}

impl Session {
    /// Record `failure` in the error variable, or undefine the variable when
    /// there is none.
    pub fn report_failure(&self, py: Python<'_>, failure: Option<PyErr>) -> Reported {
        let errors = &self.config().errors;

        let Some(err) = failure else {
            self.eval_directive(&format!("undefine {}", errors.last_error_variable));
            return Reported::Cleared;
        };

        if self.flag_set(&errors.traceback_variable) {
            err.print(py);
        }

        let Ok(text) = format_failure(py, &err) else {
            return self.raise_marker("Internal error");
        };

        let mut definition = format!("define {}\n", errors.last_error_variable).into_bytes();
        definition.extend_from_slice(&escape_verbatim(&text));
        definition.extend_from_slice(b"\nendef\n");
        let Ok(definition) = CString::new(definition) else {
            return self.raise_marker("Internal error");
        };

        warn!(
            event = "callback_failed",
            error = %String::from_utf8_lossy(&text),
            "Python failure recorded in {}",
            errors.last_error_variable
        );

        if self.host().eval(&definition, None).diverged() {
            return Reported::Fatal;
        }

        if self.flag_set(&errors.fatal_variable) {
            error!(event = "fatal_error", "Stopping make on Python failure");
            self.eval_directive(&format!("$(error $({}))", errors.last_error_variable));
            return Reported::Fatal;
        }

        Reported::Recorded
    }

    /// The result buffer could not be allocated
    pub fn report_out_of_memory(&self) -> Reported {
        self.raise_marker("Out of memory")
    }

    /// Stop make with a fixed message when the failure itself cannot be
    /// formatted.
    fn raise_marker(&self, marker: &str) -> Reported {
        error!(event = "report_failed", marker, "Could not record Python failure");
        self.eval_directive(&format!("$(error {})", marker));
        Reported::Fatal
    }

    fn eval_directive(&self, directive: &str) {
        if let Ok(directive) = CString::new(directive) {
            let _ = self.host().eval(&directive, None);
        }
    }

    /// A make flag is set when it expands to anything at all
    fn flag_set(&self, variable: &str) -> bool {
        expand_variable(self.host(), variable).is_some_and(|value| !value.is_empty())
    }
}

/// `"<type name>: <str(value)>"` in the locale encoding
fn format_failure(py: Python<'_>, err: &PyErr) -> PyResult<Vec<u8>> {
    let type_name = err.get_type_bound(py).getattr("__name__")?;
    let value = err.value_bound(py).str()?;
    let formatted = PyString::new_bound(py, "{}: {}").call_method1("format", (type_name, value))?;
    encode_locale(formatted.downcast::<PyString>()?)
}
