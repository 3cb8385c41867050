//! Dispatch bridge - make function call → Python callable → expansion text
//!
//! Design: make's calling convention returns a string or nothing, with no
//! error channel. Each call is first turned into an `Outcome`; `dispatch`
//! then maps it onto the host: text is copied into a host buffer, failures
//! go to the error reporter and yield no output.
//!
//! The opposite direction, `expand` and `evaluate`, lets a running callback
//! hand text back to make. Both may re-enter `dispatch` before returning.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_uint};
use std::panic::{catch_unwind, AssertUnwindSafe};

use pyo3::prelude::*;
use pyo3::types::PyString;
use tracing::{debug, debug_span, error, trace};

use crate::errors::BridgeError;
use crate::host::{Evaluation, HostString, Location};
use crate::marshal::{decode_locale, encode_locale, marshal_args, to_host_bytes};
use crate::session::{self, Session};

/// What a single callback invocation produced
#[derive(Debug)]
pub enum Outcome {
    /// Bytes for make, without terminator; never empty
    Expansion(Vec<u8>),
    /// The call succeeded and its result marshals to nothing
    NoOutput,
    /// No callable is registered under the name
    Unregistered,
    /// Raised by argument marshaling, the callable, or result marshaling
    Failure(PyErr),
}

impl Session {
    /// Run the callable registered as `name` with make's arguments.
    ///
    /// Returns the host buffer make takes ownership of, or `None` for no
    /// output. Failures are recorded through the error reporter; a call that
    /// succeeds clears the record. An unregistered name touches neither.
    pub fn dispatch(&self, name: &CStr, args: &[&CStr]) -> Option<HostString<'_>> {
        let span = debug_span!(
            "dispatch",
            function = %name.to_string_lossy(),
            argc = args.len()
        );
        let _enter = span.enter();

        Python::with_gil(|py| match self.invoke(py, name, args) {
            Outcome::Expansion(bytes) => {
                self.report_failure(py, None);
                let out = HostString::from_bytes(self.host(), &bytes);
                if out.is_none() {
                    self.report_out_of_memory();
                }
                out
            }
            Outcome::NoOutput => {
                self.report_failure(py, None);
                None
            }
            Outcome::Unregistered => None,
            Outcome::Failure(err) => {
                self.report_failure(py, Some(err));
                None
            }
        })
    }

    /// Steps 2 to 4 of a call: lookup, argument marshaling, invocation and
    /// result marshaling. Touches neither the host nor the error record.
    pub fn invoke(&self, py: Python<'_>, name: &CStr, args: &[&CStr]) -> Outcome {
        let Some(callable) = self.callable(py, name.to_bytes()) else {
            trace!(event = "unregistered_function", "No callable registered");
            return Outcome::Unregistered;
        };

        let result = marshal_args(py, args)
            .and_then(|args| callable.bind(py).call1(args))
            .and_then(|value| to_host_bytes(&value));

        match result {
            Ok(Some(bytes)) if !bytes.is_empty() => Outcome::Expansion(bytes),
            Ok(_) => Outcome::NoOutput,
            Err(err) => Outcome::Failure(err),
        }
    }

    /// Expand `text` by make's rules; empty when make produced nothing
    pub fn expand<'py>(
        &self,
        text: &Bound<'py, PyString>,
    ) -> PyResult<Bound<'py, PyString>> {
        let py = text.py();
        let text = host_text(text)?;

        match HostString::expand(self.host(), &text) {
            Some(expanded) => decode_locale(py, expanded.as_c_str()),
            None => Ok(PyString::new_bound(py, "")),
        }
    }

    /// Evaluate `text` as makefile syntax.
    ///
    /// A syntax error ends make inside this call; `Diverged` is only ever
    /// seen with a host that cannot exit.
    pub fn evaluate(
        &self,
        text: &Bound<'_, PyString>,
        location: Option<&Location>,
    ) -> PyResult<Evaluation> {
        let text = host_text(text)?;
        debug!(
            event = "evaluate",
            bytes = text.as_bytes().len(),
            file = ?location.map(|loc| loc.filename.to_string_lossy()),
            "Evaluating makefile text"
        );
        Ok(self.host().eval(&text, location))
    }
}

fn host_text(text: &Bound<'_, PyString>) -> PyResult<CString> {
    let bytes = encode_locale(text)?;
    Ok(CString::new(bytes).map_err(|_| BridgeError::NulByte { what: "text" })?)
}

/// Entry point make calls for every function the bridge registered.
///
/// # Safety
/// Called by make with a NUL-terminated `name` and `argc` NUL-terminated
/// strings in `argv`.
pub unsafe extern "C" fn dispatch_from_make(
    name: *const c_char,
    argc: c_uint,
    argv: *mut *mut c_char,
) -> *mut c_char {
    let Some(session) = session::installed() else {
        return core::ptr::null_mut();
    };
    if name.is_null() {
        return core::ptr::null_mut();
    }

    let result = catch_unwind(AssertUnwindSafe(|| {
        let name = CStr::from_ptr(name);
        let args = raw_args(argc, argv);
        session
            .dispatch(name, &args)
            .map_or(core::ptr::null_mut(), HostString::into_raw)
    }));

    result.unwrap_or_else(|_| {
        error!(event = "dispatch_panic", "Panic while dispatching a make function");
        core::ptr::null_mut()
    })
}

unsafe fn raw_args<'a>(argc: c_uint, argv: *mut *mut c_char) -> Vec<&'a CStr> {
    if argv.is_null() || argc == 0 {
        return Vec::new();
    }

    core::slice::from_raw_parts(argv, argc as usize)
        .iter()
        .map(|&arg| if arg.is_null() { c"" } else { CStr::from_ptr(arg) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::MemoryHost;
    use std::ffi::CString;
    use std::sync::Arc;

    fn setup(py: Python<'_>, code: &str) -> (Arc<MemoryHost>, Arc<Session>) {
        let host = Arc::new(MemoryHost::new());
        let session = Session::new(py, host.clone(), Config::default()).unwrap();
        let callable = py.eval_bound(code, None, None).unwrap();
        session.register_as("f", &callable, 0, 0, true).unwrap();
        (host, session)
    }

    fn invoke(py: Python<'_>, session: &Session, args: &[&str]) -> Outcome {
        let args: Vec<CString> = args.iter().map(|a| CString::new(*a).unwrap()).collect();
        let refs: Vec<&CStr> = args.iter().map(|a| a.as_c_str()).collect();
        session.invoke(py, c"f", &refs)
    }

    #[test]
    fn test_invoke_passes_args_in_order() {
        Python::with_gil(|py| {
            let (_host, session) = setup(py, "lambda *a: '|'.join(a)");
            match invoke(py, &session, &["a", "b c", ""]) {
                Outcome::Expansion(bytes) => assert_eq!(bytes, b"a|b c|"),
                other => panic!("unexpected outcome: {:?}", other),
            }
        });
    }

    #[test]
    fn test_empty_result_is_no_output() {
        Python::with_gil(|py| {
            let (_host, session) = setup(py, "lambda: ''");
            assert!(matches!(invoke(py, &session, &[]), Outcome::NoOutput));
        });
    }

    #[test]
    fn test_unregistered_outcome() {
        Python::with_gil(|py| {
            let (_host, session) = setup(py, "lambda: 'x'");
            assert!(matches!(session.invoke(py, c"missing", &[]), Outcome::Unregistered));
        });
    }

    #[test]
    fn test_raise_is_failure() {
        Python::with_gil(|py| {
            let (host, session) = setup(py, "lambda: 1 / 0");
            assert!(matches!(invoke(py, &session, &[]), Outcome::Failure(_)));
            // invoke alone never publishes anything
            assert!(host.evaluations().is_empty());
        });
    }

    #[test]
    fn test_dispatch_result_owned_by_host() {
        Python::with_gil(|py| {
            let (host, session) = setup(py, "lambda: 'out'");
            let out = session.dispatch(c"f", &[]).unwrap();
            assert_eq!(out.as_bytes_with_nul(), b"out\0");

            let raw = out.into_raw();
            assert_eq!(host.live_allocations(), 1);
            unsafe { crate::host::Host::free(host.as_ref(), raw) };
            assert_eq!(host.live_allocations(), 0);
        });
    }

    #[test]
    fn test_expand_and_evaluate() {
        Python::with_gil(|py| {
            let (host, session) = setup(py, "lambda: None");
            let text = PyString::new_bound(py, "A := $(B) two");
            host.set_variable("B", "one");

            let evaluation = session.evaluate(&text, None).unwrap();
            assert_eq!(evaluation, Evaluation::Returned);

            let expanded = session.expand(&PyString::new_bound(py, "$(A)")).unwrap();
            assert_eq!(expanded.to_str().unwrap(), "one two");
            assert_eq!(host.live_allocations(), 0);
        });
    }

    #[test]
    fn test_expand_reenters_dispatch() {
        Python::with_gil(|py| {
            let (host, session) = setup(py, "lambda x: x.upper()");
            host.attach(&session);

            let expanded = session.expand(&PyString::new_bound(py, "<$(f abc)>")).unwrap();
            assert_eq!(expanded.to_str().unwrap(), "<ABC>");
        });
    }

    #[test]
    fn test_evaluate_rejects_nul() {
        Python::with_gil(|py| {
            let (host, session) = setup(py, "lambda: None");
            let text = PyString::new_bound(py, "A = 1\0");
            assert!(session.evaluate(&text, None).is_err());
            assert!(host.evaluations().is_empty());
        });
    }

    #[test]
    fn test_trampoline_without_session() {
        // No session is ever installed in unit tests.
        let out = unsafe { dispatch_from_make(c"f".as_ptr(), 0, core::ptr::null_mut()) };
        assert!(out.is_null());
    }
}
