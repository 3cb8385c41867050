//! The `gnumake` Python module
//!
//! Design: every host-touching function is a bound method of one `Bridge`
//! object, which holds a weak reference to its session. The module built by
//! `#[pymodule] gnumake` binds to the installed session; tests build one for
//! their own session with `module`. Without a session (plain `python`
//! importing the module) those functions raise `ImportError`, and `export`
//! hands the function back untouched.

mod builtins;
mod variables;

pub use builtins::register_builtins;
pub use variables::Variables;

use std::sync::{Arc, Weak};

use pyo3::prelude::*;
use pyo3::types::{PyCFunction, PyDict, PyString, PyTuple};

use crate::errors::BridgeError;
use crate::escape;
use crate::host::Location;
use crate::marshal::encode_locale;
use crate::session::{self, Session};

/// `string.whitespace` plus the characters make treats specially in names
const ILLEGAL_NAME_CHARS: &str = " \t\n\r\x0b\x0c:#=$()";

/// Host-facing half of the module
#[pyclass(frozen, module = "gnumake")]
pub struct Bridge {
    session: Weak<Session>,
}

impl Bridge {
    pub(crate) fn session(&self) -> PyResult<Arc<Session>> {
        self.session
            .upgrade()
            .ok_or_else(|| BridgeError::HostUnavailable.into())
    }

    fn export_function(
        &self,
        func: &Bound<'_, PyAny>,
        name: Option<&Bound<'_, PyAny>>,
        expand: bool,
        min_args: i64,
        max_args: i64,
    ) -> PyResult<()> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };

        let name = match name {
            Some(name) => name.clone(),
            None => func.getattr("__name__")?,
        };

        let (min_args, max_args) = if min_args == -1 || max_args == -1 {
            let (guessed_min, guessed_max) = guess_arity(func)?;
            let max_args = match max_args {
                -1 => match guessed_max {
                    Some(0) => {
                        return Err(pyo3::exceptions::PyValueError::new_err(
                            "Function must take at least one parameter",
                        ))
                    }
                    Some(max) => max,
                    None => 0,
                },
                explicit => explicit,
            };
            let min_args = match min_args {
                -1 => guessed_min.max(1),
                explicit => explicit,
            };
            (min_args, max_args)
        } else {
            (min_args, max_args)
        };

        session.register(&name, func, min_args, max_args, expand)
    }
}

#[pymethods]
impl Bridge {
    /// Register `callable` as the make function `name`
    #[pyo3(signature = (name, callable, min_args=0, max_args=0, expand=true))]
    fn add_function(
        &self,
        name: &Bound<'_, PyAny>,
        callable: &Bound<'_, PyAny>,
        min_args: i64,
        max_args: i64,
        expand: bool,
    ) -> PyResult<()> {
        self.session()?
            .register(name, callable, min_args, max_args, expand)
    }

    /// Decorator, with or without arguments, or a plain function:
    ///
    /// ```python
    /// @gnumake.export
    /// def newer(a, b): ...
    ///
    /// @gnumake.export(name="repeat-loop", expand=False)
    /// def repeat_loop(condition, body): ...
    ///
    /// gnumake.export(os.path.isfile, min_args=1, max_args=1)
    /// ```
    ///
    /// `-1` for an arity bound means: guess it from the signature.
    #[pyo3(signature = (func=None, *, name=None, expand=true, min_args=-1, max_args=-1))]
    fn export(
        slf: &Bound<'_, Self>,
        func: Option<Bound<'_, PyAny>>,
        name: Option<Bound<'_, PyAny>>,
        expand: bool,
        min_args: i64,
        max_args: i64,
    ) -> PyResult<PyObject> {
        let py = slf.py();

        if let Some(func) = func {
            slf.get()
                .export_function(&func, name.as_ref(), expand, min_args, max_args)?;
            return Ok(func.unbind());
        }

        let bridge = slf.clone().unbind();
        let name = name.map(Bound::unbind);
        let decorator = PyCFunction::new_closure_bound(
            py,
            None,
            None,
            move |args: &Bound<'_, PyTuple>, _kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<PyObject> {
                let py = args.py();
                let func = args.get_item(0)?;
                if func.is_none() {
                    return Err(pyo3::exceptions::PyValueError::new_err(
                        "callback must not be None",
                    ));
                }
                let name = name.as_ref().map(|n| n.bind(py).clone());
                bridge
                    .get()
                    .export_function(&func, name.as_ref(), expand, min_args, max_args)?;
                Ok(func.unbind())
            },
        )?;
        Ok(decorator.into_any().unbind())
    }

    /// Evaluate makefile text, as `$(eval ...)` would
    #[pyo3(signature = (text, filename=None, lineno=None))]
    fn evaluate(
        &self,
        text: &Bound<'_, PyString>,
        filename: Option<&Bound<'_, PyAny>>,
        lineno: Option<u64>,
    ) -> PyResult<()> {
        let filename = filename
            .map(|f| f.str().and_then(|f| encode_locale(&f)))
            .transpose()?;
        let location = Location::from_parts(filename, lineno)?;

        let _ = self.session()?.evaluate(text, location.as_ref())?;
        Ok(())
    }

    #[pyo3(name = "eval", signature = (text, filename=None, lineno=None))]
    fn eval_alias(
        &self,
        text: &Bound<'_, PyString>,
        filename: Option<&Bound<'_, PyAny>>,
        lineno: Option<u64>,
    ) -> PyResult<()> {
        self.evaluate(text, filename, lineno)
    }

    /// Expand text by make's rules
    fn expand<'py>(&self, text: &Bound<'py, PyString>) -> PyResult<Bound<'py, PyString>> {
        self.session()?.expand(text)
    }
}

/// Escape text for a `define` body; `$` references still expand
#[pyfunction]
fn escape_string(text: &str) -> String {
    escape::escape_string(text)
}

/// Escape text so a `define` body holds it verbatim
#[pyfunction]
fn fully_escape_string(text: &str) -> String {
    escape::fully_escape_string(text)
}

/// Whether `name` can be used as a make variable name
#[pyfunction]
pub fn is_legal_name(name: &str) -> bool {
    !name.chars().any(|c| ILLEGAL_NAME_CHARS.contains(c))
}

/// `(min, max)` from the positional parameters of `func`; `None` for max
/// when it takes `*args`.
fn guess_arity(func: &Bound<'_, PyAny>) -> PyResult<(i64, Option<i64>)> {
    let py = func.py();
    let inspect = py.import_bound("inspect")?;
    let parameter = inspect.getattr("Parameter")?;
    let empty = parameter.getattr("empty")?;
    let positional_only = parameter.getattr("POSITIONAL_ONLY")?;
    let positional_or_keyword = parameter.getattr("POSITIONAL_OR_KEYWORD")?;
    let var_positional = parameter.getattr("VAR_POSITIONAL")?;

    let signature = inspect.call_method1("signature", (func,))?;
    let mut min_args = 0;
    let mut max_args = Some(0);

    for param in signature.getattr("parameters")?.call_method0("values")?.iter()? {
        let param = param?;
        let kind = param.getattr("kind")?;

        if kind.eq(&positional_only)? || kind.eq(&positional_or_keyword)? {
            max_args = max_args.map(|max| max + 1);
            if param.getattr("default")?.is(&empty) {
                min_args += 1;
            }
        } else if kind.eq(&var_positional)? {
            max_args = None;
        }
    }

    Ok((min_args, max_args))
}

/// Fill `m` with the module contents, bound to `session` when there is one
pub fn populate(m: &Bound<'_, PyModule>, session: Option<&Arc<Session>>) -> PyResult<()> {
    let py = m.py();
    let bridge = Bound::new(
        py,
        Bridge {
            session: session.map_or_else(Weak::new, Arc::downgrade),
        },
    )?;

    for method in ["add_function", "export", "evaluate", "eval", "expand"] {
        m.add(method, bridge.getattr(method)?)?;
    }
    m.add_function(wrap_pyfunction!(escape_string, m)?)?;
    m.add_function(wrap_pyfunction!(fully_escape_string, m)?)?;
    m.add_function(wrap_pyfunction!(is_legal_name, m)?)?;

    m.add_class::<Variables>()?;
    let variables = Bound::new(py, Variables::new(bridge.unbind()))?;
    m.add("variables", &variables)?;
    m.add("var", &variables)?;

    match session {
        Some(session) => {
            let globals = session.globals(py);
            globals.set_item("gnumake", m)?;
            m.add("global_state", globals)?;
        }
        None => m.add("global_state", PyDict::new_bound(py))?,
    }

    Ok(())
}

/// A `gnumake` module bound to `session`, outside the import system
pub fn module<'py>(py: Python<'py>, session: &Arc<Session>) -> PyResult<Bound<'py, PyModule>> {
    let m = PyModule::new_bound(py, "gnumake")?;
    populate(&m, Some(session))?;
    Ok(m)
}

/// Python integration into GNU make
#[pymodule]
pub fn gnumake(m: &Bound<'_, PyModule>) -> PyResult<()> {
    populate(m, session::installed())
}
