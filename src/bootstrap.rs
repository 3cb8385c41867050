//! Plugin entry point - what make runs on `load`
//!
//! ```make
//! load libpygnumake.so(pygnumake_gmk_setup)
//! ```
//!
//! Setup order: resolve the make API, read configuration, start logging,
//! export `PYTHON*` make variables to the environment, start the
//! interpreter, install the session, register the built-ins, import
//! `gnumake` and any startup modules. Any failure leaves the plugin inert
//! and makes `load` fail.

use std::ffi::{CStr, OsStr};
use std::fmt;
use std::os::raw::{c_int, c_void};
use std::os::unix::ffi::OsStrExt;
use std::panic::catch_unwind;
use std::path::PathBuf;
use std::sync::Arc;

use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::PyList;
use tracing::{debug, info};

use crate::bridge::dispatch_from_make;
use crate::config::{expand_variable, Config};
use crate::errors::BridgeError;
use crate::host::{GmkApi, GmkFloc, Host};
use crate::logging::{self, LogConfig};
use crate::python::{gnumake, register_builtins};
use crate::session::{self, Session};

/// GNU make refuses to load objects without this symbol
#[no_mangle]
#[allow(non_upper_case_globals)]
pub static plugin_is_GPL_compatible: c_int = 1;

/// Setup errors; all of them leave the plugin unloaded
#[derive(Debug)]
pub enum SetupError {
    Bridge(BridgeError),
    Python(PyErr),
    AlreadyInitialized,
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge(err) => write!(f, "{}", err),
            Self::Python(err) => write!(f, "Python error: {}", err),
            Self::AlreadyInitialized => write!(f, "Python interpreter already initialized"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bridge(err) => Some(err),
            Self::Python(err) => Some(err),
            Self::AlreadyInitialized => None,
        }
    }
}

impl From<BridgeError> for SetupError {
    fn from(err: BridgeError) -> Self {
        Self::Bridge(err)
    }
}

impl From<PyErr> for SetupError {
    fn from(err: PyErr) -> Self {
        Self::Python(err)
    }
}

/// Called by make's `load` directive. Non-zero means success.
///
/// # Safety
/// Called by make, once, on its main thread.
#[no_mangle]
pub unsafe extern "C" fn pygnumake_gmk_setup(_floc: *const GmkFloc) -> c_int {
    match catch_unwind(setup) {
        Ok(Ok(())) => 1,
        Ok(Err(err)) => {
            logging::log_setup_failure("setup", &err);
            eprintln!("pygnumake: {}", err);
            0
        }
        Err(_) => {
            eprintln!("pygnumake: panic during setup");
            0
        }
    }
}

/// Bring the bridge up inside the running make
pub fn setup() -> Result<(), SetupError> {
    let api = GmkApi::load(dispatch_from_make)?;
    let host: Arc<dyn Host> = Arc::new(api);

    let config = Config::discover(host.as_ref()).map_err(BridgeError::from)?;
    logging::init_with_config(LogConfig::from_config(&config.logging).with_env_overrides());

    export_environment(host.as_ref(), &config.environment.export);

    if unsafe { ffi::Py_IsInitialized() } != 0 {
        return Err(SetupError::AlreadyInitialized);
    }
    pyo3::append_to_inittab!(gnumake);
    pyo3::prepare_freethreaded_python();

    Python::with_gil(|py| {
        start_session(py, host, config).map_err(|err| {
            err.print(py);
            SetupError::Python(err)
        })
    })?;

    unsafe { libc::atexit(finalize_python) };
    info!(event = "bridge_ready", "Python bridge loaded");
    Ok(())
}

fn start_session(py: Python<'_>, host: Arc<dyn Host>, config: Config) -> PyResult<()> {
    let sys = py.import_bound("sys")?;
    sys.setattr("argv", PyList::new_bound(py, [""]))?;

    let path = sys.getattr("path")?;
    for entry in &config.python.path {
        path.call_method1("append", (entry.as_os_str(),))?;
    }
    if config.python.add_package_location {
        if let Some(location) = package_location() {
            debug!(event = "package_location", path = %location.display());
            path.call_method1("append", (location.as_os_str(),))?;
        }
    }

    let startup_modules = config.python.startup_modules.clone();
    let session = Session::new(py, host, config)?;
    if session::install(session.clone()).is_err() {
        return Err(pyo3::exceptions::PyRuntimeError::new_err(
            "a bridge session is already installed",
        ));
    }

    register_builtins(py, &session)?;
    py.import_bound("gnumake")?;
    for module in &startup_modules {
        py.import_bound(module.as_str())?;
    }

    Ok(())
}

/// Copy each named make variable that expands to something into the
/// process environment
pub fn export_environment(host: &dyn Host, names: &[String]) {
    for name in names {
        if let Some(value) = expand_variable(host, name).filter(|v| !v.is_empty()) {
            debug!(event = "export_environment", variable = %name);
            std::env::set_var(name, value);
        }
    }
}

/// Two directories above this shared object: the install prefix that holds
/// the Python side of the package
pub fn package_location() -> Option<PathBuf> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let address = package_location as usize as *const c_void;

    if unsafe { libc::dladdr(address, &mut info) } == 0 || info.dli_fname.is_null() {
        return None;
    }

    let object = unsafe { CStr::from_ptr(info.dli_fname) };
    let object = PathBuf::from(OsStr::from_bytes(object.to_bytes()));
    object.parent()?.parent().map(|p| p.to_path_buf())
}

extern "C" fn finalize_python() {
    unsafe {
        if ffi::Py_IsInitialized() != 0 {
            ffi::PyGILState_Ensure();
            ffi::Py_FinalizeEx();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SymbolError;
    use crate::host::MemoryHost;

    #[test]
    fn test_setup_outside_make() {
        match setup() {
            Err(SetupError::Bridge(BridgeError::Symbol { error, .. })) => {
                assert_eq!(error, SymbolError::NotFound)
            }
            other => panic!("unexpected setup result: {:?}", other.err()),
        }
    }

    #[test]
    fn test_export_environment() {
        let host = MemoryHost::new();
        host.set_variable("PYGNUMAKE_TEST_EXPORTED", "$(INNER)");
        host.set_variable("INNER", "value");
        host.set_variable("PYGNUMAKE_TEST_EMPTY", "");

        export_environment(
            &host,
            &[
                "PYGNUMAKE_TEST_EXPORTED".to_string(),
                "PYGNUMAKE_TEST_EMPTY".to_string(),
                "PYGNUMAKE_TEST_UNSET".to_string(),
            ],
        );

        assert_eq!(std::env::var("PYGNUMAKE_TEST_EXPORTED").unwrap(), "value");
        assert!(std::env::var("PYGNUMAKE_TEST_EMPTY").is_err());
        assert!(std::env::var("PYGNUMAKE_TEST_UNSET").is_err());
    }

    #[test]
    fn test_package_location() {
        // The test binary sits in target/<profile>/deps
        let location = package_location().unwrap();
        assert!(location.is_dir());
    }
}
