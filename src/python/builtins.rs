//! Built-in make functions: `python-eval`, `python-exec`, `python-file`,
//! `python-mod`
//!
//! Code runs in the session's shared globals. Everything but `python-eval`
//! returns what the code wrote to standard output, captured by pointing file
//! descriptor 1 at a temporary file for the duration of the call.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::raw::c_int;
use std::sync::{Arc, Weak};

use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyCFunction, PyDict, PyTuple};
use tracing::debug;

use crate::errors::BridgeError;
use crate::library;
use crate::session::Session;

const STDOUT_FD: c_int = 1;

/// Register the four built-ins with `session`
pub fn register_builtins(py: Python<'_>, session: &Arc<Session>) -> PyResult<()> {
    let builtins: [(&str, Builtin, i64, i64); 4] = [
        ("python-eval", python_eval, 1, 1),
        ("python-exec", python_exec, 1, 1),
        ("python-file", python_file, 1, 0),
        ("python-mod", python_mod, 1, 0),
    ];

    for (name, body, min_args, max_args) in builtins {
        let function = bind(py, Arc::downgrade(session), body)?;
        session.register_as(name, function.as_any(), min_args, max_args, true)?;
    }

    debug!(event = "builtins_registered", count = 4, "Registered built-in functions");
    Ok(())
}

type Builtin = for<'py> fn(Python<'py>, &Session, &Bound<'py, PyTuple>) -> PyResult<PyObject>;

/// Wrap `body` as a Python callable. The session is held weakly: it owns
/// the registry that holds the callable.
fn bind(py: Python<'_>, session: Weak<Session>, body: Builtin) -> PyResult<Bound<'_, PyCFunction>> {
    PyCFunction::new_closure_bound(
        py,
        None,
        None,
        move |args: &Bound<'_, PyTuple>, _kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<PyObject> {
            let session = session
                .upgrade()
                .ok_or_else(|| PyErr::from(BridgeError::HostUnavailable))?;
            body(args.py(), &session, args)
        },
    )
}

/// `$(python-eval expr)`: value of a Python expression
fn python_eval<'py>(py: Python<'py>, session: &Session, args: &Bound<'py, PyTuple>) -> PyResult<PyObject> {
    let code: String = args.get_item(0)?.extract()?;
    Ok(py.eval_bound(&code, Some(session.globals(py)), None)?.unbind())
}

/// `$(python-exec code)`: run statements, return their output
fn python_exec<'py>(py: Python<'py>, session: &Session, args: &Bound<'py, PyTuple>) -> PyResult<PyObject> {
    let code: String = args.get_item(0)?.extract()?;
    captured(py, || py.run_bound(&code, Some(session.globals(py)), None))
}

/// `$(python-file script,args...)`: run a script with `sys.argv` set
fn python_file<'py>(py: Python<'py>, session: &Session, args: &Bound<'py, PyTuple>) -> PyResult<PyObject> {
    let script: String = args.get_item(0)?.extract()?;

    with_argv(py, args, || {
        captured(py, || {
            // compile decodes the bytes, honouring a coding declaration
            let source = PyBytes::new_bound(py, &std::fs::read(&script)?);
            let builtins = py.import_bound("builtins")?;
            let code = builtins.getattr("compile")?.call1((source, script.as_str(), "exec"))?;
            let globals = session.globals(py);
            builtins.getattr("exec")?.call1((code, globals, globals))?;
            Ok(())
        })
    })
}

/// `$(python-mod module,args...)`: run a module with the shared globals as
/// its initial globals. Names the string library to install it instead.
fn python_mod<'py>(py: Python<'py>, session: &Session, args: &Bound<'py, PyTuple>) -> PyResult<PyObject> {
    let module: String = args.get_item(0)?.extract()?;

    if module == library::strings::MODULE_NAME {
        library::strings::install(py, session)?;
        return Ok(py.None());
    }

    with_argv(py, args, || {
        captured(py, || {
            let runpy = py.import_bound("runpy")?;
            let kwargs = PyDict::new_bound(py);
            kwargs.set_item("init_globals", session.globals(py))?;
            runpy.call_method("run_module", (module.as_str(),), Some(&kwargs))?;
            Ok(())
        })
    })
}

/// Run `body` with `sys.argv` set to `args`, restoring it afterwards
fn with_argv<'py, T>(
    py: Python<'py>,
    args: &Bound<'py, PyTuple>,
    body: impl FnOnce() -> PyResult<T>,
) -> PyResult<T> {
    let sys = py.import_bound("sys")?;
    let saved = sys.getattr("argv")?;
    sys.setattr("argv", args.to_list())?;

    let result = body();
    sys.setattr("argv", saved)?;
    result
}

/// Run `body` with standard output captured; returns the output as bytes
/// without trailing newlines.
fn captured(py: Python<'_>, body: impl FnOnce() -> PyResult<()>) -> PyResult<PyObject> {
    let capture = StdoutCapture::begin(py)?;
    if let Err(err) = body() {
        // keep partial output out of make's stdout
        let _ = flush_stdout(py);
        return Err(err);
    }
    let output = capture.finish(py)?;
    Ok(PyBytes::new_bound(py, &output).into_any().unbind())
}

/// File descriptor 1 redirected to a temporary file. Dropping it puts the
/// original descriptor back.
struct StdoutCapture {
    file: File,
    saved: c_int,
}

impl StdoutCapture {
    fn begin(py: Python<'_>) -> PyResult<Self> {
        flush_stdout(py)?;
        let file = tempfile::tempfile()?;

        let saved = unsafe { libc::dup(STDOUT_FD) };
        if saved < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if unsafe { libc::dup2(file.as_raw_fd(), STDOUT_FD) } < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(saved) };
            return Err(err.into());
        }

        Ok(Self { file, saved })
    }

    fn finish(mut self, py: Python<'_>) -> PyResult<Vec<u8>> {
        flush_stdout(py)?;
        self.restore();

        let mut output = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut output)?;

        while output.last() == Some(&b'\n') {
            output.pop();
        }
        Ok(output)
    }

    fn restore(&mut self) {
        if self.saved >= 0 {
            unsafe {
                libc::dup2(self.saved, STDOUT_FD);
                libc::close(self.saved);
            }
            self.saved = -1;
        }
    }
}

impl Drop for StdoutCapture {
    fn drop(&mut self) {
        self.restore();
    }
}

fn flush_stdout(py: Python<'_>) -> PyResult<()> {
    let stdout = py.import_bound("sys")?.getattr("stdout")?;
    if !stdout.is_none() {
        stdout.call_method0("flush")?;
    }
    Ok(())
}
