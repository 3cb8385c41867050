//! Runtime session - callback registry, shared globals, registration
//!
//! Design: one `Session` per make process, built at bootstrap and handed by
//! reference to every bridge operation. Tests build their own over a
//! `MemoryHost`; only the C entry point make calls needs the process-wide
//! slot (`install` / `installed`).
//!
//! The registry lock is held for lookups and inserts only, never across a
//! Python call, so callbacks may register further functions or re-enter the
//! bridge through `expand`/`evaluate`.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::debug;

use crate::config::Config;
use crate::host::{validate_arity, FunctionDescriptor, Host};
use crate::marshal;

static SESSION: OnceCell<Arc<Session>> = OnceCell::new();

pub struct Session {
    host: Arc<dyn Host>,
    registry: Mutex<HashMap<Vec<u8>, Py<PyAny>>>,
    globals: Py<PyDict>,
    config: Config,
}

impl Session {
    /// Create a session with an empty registry and fresh shared globals
    /// holding `__builtins__`, `os` and `sys`.
    pub fn new(py: Python<'_>, host: Arc<dyn Host>, config: Config) -> PyResult<Arc<Self>> {
        let globals = PyDict::new_bound(py);
        globals.set_item("__builtins__", PyModule::import_bound(py, "builtins")?)?;
        globals.set_item("os", PyModule::import_bound(py, "os")?)?;
        globals.set_item("sys", PyModule::import_bound(py, "sys")?)?;

        Ok(Arc::new(Self {
            host,
            registry: Mutex::new(HashMap::new()),
            globals: globals.unbind(),
            config,
        }))
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The Global Shared State dict, the same object on every call
    pub fn globals<'py>(&self, py: Python<'py>) -> &Bound<'py, PyDict> {
        self.globals.bind(py)
    }

    /// Register `callable` as the make function `name`.
    ///
    /// Arity is validated before the name is touched; a failure at either
    /// step leaves the registry and the host unchanged. Re-registering a name
    /// replaces the previous callable.
    pub fn register(
        &self,
        name: &Bound<'_, PyAny>,
        callable: &Bound<'_, PyAny>,
        min_args: i64,
        max_args: i64,
        expand: bool,
    ) -> PyResult<()> {
        validate_arity(min_args, max_args)?;

        let encoded = marshal::encode_locale(&name.str()?)?;
        let descriptor = FunctionDescriptor::new(encoded.clone(), min_args, max_args, expand)?;

        let replaced = self
            .registry
            .lock()
            .insert(encoded, callable.clone().unbind())
            .is_some();
        self.host.add_function(&descriptor);

        debug!(
            event = "function_registered",
            function = %descriptor.name().to_string_lossy(),
            min_args = descriptor.min_args(),
            max_args = descriptor.max_args(),
            expand = descriptor.expands(),
            replaced,
            "Registered make function"
        );
        Ok(())
    }

    /// Registration for Rust-side callers with a plain name
    pub fn register_as(
        &self,
        name: &str,
        callable: &Bound<'_, PyAny>,
        min_args: i64,
        max_args: i64,
        expand: bool,
    ) -> PyResult<()> {
        let name = pyo3::types::PyString::new_bound(callable.py(), name);
        self.register(name.as_any(), callable, min_args, max_args, expand)
    }

    /// Callable registered under `name`, with its own reference
    pub fn callable(&self, py: Python<'_>, name: &[u8]) -> Option<Py<PyAny>> {
        self.registry.lock().get(name).map(|c| c.clone_ref(py))
    }

    pub fn is_registered(&self, name: &[u8]) -> bool {
        self.registry.lock().contains_key(name)
    }

    pub fn registered_count(&self) -> usize {
        self.registry.lock().len()
    }
}

/// Publish `session` to the C entry point. Only the first call wins.
pub fn install(session: Arc<Session>) -> Result<(), Arc<Session>> {
    SESSION.set(session)
}

/// The session make's calls are routed to, once bootstrap has finished
pub fn installed() -> Option<&'static Arc<Session>> {
    SESSION.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use pyo3::exceptions::PyValueError;

    fn session(py: Python<'_>) -> (Arc<MemoryHost>, Arc<Session>) {
        let host = Arc::new(MemoryHost::new());
        let session = Session::new(py, host.clone(), Config::default()).unwrap();
        (host, session)
    }

    fn identity(py: Python<'_>) -> Bound<'_, PyAny> {
        py.eval_bound("lambda x: x", None, None).unwrap()
    }

    #[test]
    fn test_register_exposes_function() {
        Python::with_gil(|py| {
            let (host, session) = session(py);
            session.register_as("greet", &identity(py), 1, 1, true).unwrap();

            let desc = host.function("greet").unwrap();
            assert_eq!((desc.min_args(), desc.max_args()), (1, 1));
            assert!(desc.expands());
            assert!(session.is_registered(b"greet"));
        });
    }

    #[test]
    fn test_register_overwrites() {
        Python::with_gil(|py| {
            let (host, session) = session(py);
            let first = identity(py);
            let second = py.eval_bound("lambda x: x * 2", None, None).unwrap();

            session.register_as("f", &first, 0, 0, true).unwrap();
            session.register_as("f", &second, 0, 0, false).unwrap();

            assert_eq!(session.registered_count(), 1);
            assert!(session.callable(py, b"f").unwrap().bind(py).is(&second));
            assert!(!host.function("f").unwrap().expands());
        });
    }

    #[test]
    fn test_invalid_arity_registers_nothing() {
        Python::with_gil(|py| {
            let (host, session) = session(py);
            let err = session.register_as("f", &identity(py), 3, 1, true).unwrap_err();

            assert!(err.is_instance_of::<PyValueError>(py));
            assert_eq!(session.registered_count(), 0);
            assert_eq!(host.function_count(), 0);
        });
    }

    #[test]
    fn test_name_coerced_to_text() {
        Python::with_gil(|py| {
            let (host, session) = session(py);
            let name = 42i32.into_py(py).into_bound(py);
            session.register(&name, &identity(py), 0, 0, true).unwrap();
            assert!(host.function("42").is_some());
        });
    }

    #[test]
    fn test_unencodable_name_rejected() {
        Python::with_gil(|py| {
            let (_host, session) = session(py);
            let name = py.eval_bound("'\\udcff'", None, None).unwrap();
            assert!(session.register(&name, &identity(py), 0, 0, true).is_err());
            assert_eq!(session.registered_count(), 0);
        });
    }

    #[test]
    fn test_globals_prepopulated() {
        Python::with_gil(|py| {
            let (_host, session) = session(py);
            let globals = session.globals(py);
            assert!(globals.contains("os").unwrap());
            assert!(globals.contains("sys").unwrap());
            assert!(globals.contains("__builtins__").unwrap());
        });
    }
}
