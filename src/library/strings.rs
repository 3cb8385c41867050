//! String functions for makefiles: `$(strupper ...)`, `$(strsplit ...)`, ...
//!
//! Installed with `$(python-mod gnumake.library.strings)`. Optional numeric
//! arguments left empty mean "not given", so `$(strcount $(s),a,,5)` works.
//! Case mapping and classification register Python's own `str` methods.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyString;
use tracing::debug;

use crate::session::Session;

/// Name `python-mod` recognises for this library
pub const MODULE_NAME: &str = "gnumake.library.strings";

/// make name → `str` method, all taking exactly one argument
const STR_METHODS: [(&str, &str); 14] = [
    ("strcapitalize", "capitalize"),
    ("strlower", "lower"),
    ("strupper", "upper"),
    ("strswapcase", "swapcase"),
    ("strtitle", "title"),
    ("strisalnum", "isalnum"),
    ("strisalpha", "isalpha"),
    ("strisdigit", "isdigit"),
    ("strisidentifier", "isidentifier"),
    ("strislower", "islower"),
    ("strisprintable", "isprintable"),
    ("strisspace", "isspace"),
    ("stristitle", "istitle"),
    ("strisupper", "isupper"),
];

/// Register every function in the library with `session`
pub fn install(py: Python<'_>, session: &Session) -> PyResult<()> {
    let functions = [
        (wrap_pyfunction_bound!(strcmp, py)?, 2, 2),
        (wrap_pyfunction_bound!(strlen, py)?, 1, 1),
        (wrap_pyfunction_bound!(strcenter, py)?, 2, 3),
        (wrap_pyfunction_bound!(strljust, py)?, 2, 3),
        (wrap_pyfunction_bound!(strrjust, py)?, 2, 3),
        (wrap_pyfunction_bound!(strcount, py)?, 2, 4),
        (wrap_pyfunction_bound!(strstartswith, py)?, 2, 4),
        (wrap_pyfunction_bound!(strendswith, py)?, 2, 4),
        (wrap_pyfunction_bound!(strindex, py)?, 2, 4),
        (wrap_pyfunction_bound!(strrindex, py)?, 2, 4),
        (wrap_pyfunction_bound!(strexpandtabs, py)?, 1, 2),
        (wrap_pyfunction_bound!(strlstrip, py)?, 1, 2),
        (wrap_pyfunction_bound!(strrstrip, py)?, 1, 2),
        (wrap_pyfunction_bound!(strsplit, py)?, 1, 3),
        (wrap_pyfunction_bound!(strrsplit, py)?, 1, 3),
        (wrap_pyfunction_bound!(strjoin, py)?, 2, 2),
        (wrap_pyfunction_bound!(strtranslate, py)?, 3, 3),
    ];

    for (function, min_args, max_args) in &functions {
        let name = function.getattr("__name__")?;
        session.register(&name, function.as_any(), *min_args, *max_args, true)?;
    }

    let str_type = py.get_type_bound::<PyString>();
    for (name, method) in STR_METHODS {
        session.register_as(name, &str_type.getattr(method)?, 1, 1, true)?;
    }

    debug!(
        event = "library_installed",
        library = MODULE_NAME,
        functions = functions.len() + STR_METHODS.len(),
        "Installed string library"
    );
    Ok(())
}

/// `<`, `>` or `=`
#[pyfunction]
fn strcmp(x: &str, y: &str) -> &'static str {
    match x.cmp(y) {
        std::cmp::Ordering::Less => "<",
        std::cmp::Ordering::Greater => ">",
        std::cmp::Ordering::Equal => "=",
    }
}

/// Length in characters
#[pyfunction]
fn strlen(s: &str) -> usize {
    s.chars().count()
}

#[pyfunction]
#[pyo3(signature = (s, width, fillchar=" "))]
fn strcenter<'py>(s: &Bound<'py, PyString>, width: &str, fillchar: &str) -> PyResult<Bound<'py, PyAny>> {
    s.call_method1("center", (parse_int(width)?, fillchar))
}

#[pyfunction]
#[pyo3(signature = (s, width, fillchar=" "))]
fn strljust<'py>(s: &Bound<'py, PyString>, width: &str, fillchar: &str) -> PyResult<Bound<'py, PyAny>> {
    s.call_method1("ljust", (parse_int(width)?, fillchar))
}

#[pyfunction]
#[pyo3(signature = (s, width, fillchar=" "))]
fn strrjust<'py>(s: &Bound<'py, PyString>, width: &str, fillchar: &str) -> PyResult<Bound<'py, PyAny>> {
    s.call_method1("rjust", (parse_int(width)?, fillchar))
}

#[pyfunction]
#[pyo3(signature = (s, sub, start="", end=""))]
fn strcount<'py>(s: &Bound<'py, PyString>, sub: &str, start: &str, end: &str) -> PyResult<Bound<'py, PyAny>> {
    ranged(s, "count", sub, start, end)
}

#[pyfunction]
#[pyo3(signature = (s, prefix, start="", end=""))]
fn strstartswith<'py>(s: &Bound<'py, PyString>, prefix: &str, start: &str, end: &str) -> PyResult<Bound<'py, PyAny>> {
    ranged(s, "startswith", prefix, start, end)
}

#[pyfunction]
#[pyo3(signature = (s, suffix, start="", end=""))]
fn strendswith<'py>(s: &Bound<'py, PyString>, suffix: &str, start: &str, end: &str) -> PyResult<Bound<'py, PyAny>> {
    ranged(s, "endswith", suffix, start, end)
}

/// Fails with `ValueError` when `sub` is absent
#[pyfunction]
#[pyo3(signature = (s, sub, start="", end=""))]
fn strindex<'py>(s: &Bound<'py, PyString>, sub: &str, start: &str, end: &str) -> PyResult<Bound<'py, PyAny>> {
    ranged(s, "index", sub, start, end)
}

#[pyfunction]
#[pyo3(signature = (s, sub, start="", end=""))]
fn strrindex<'py>(s: &Bound<'py, PyString>, sub: &str, start: &str, end: &str) -> PyResult<Bound<'py, PyAny>> {
    ranged(s, "rindex", sub, start, end)
}

#[pyfunction]
#[pyo3(signature = (s, tabsize="8"))]
fn strexpandtabs<'py>(s: &Bound<'py, PyString>, tabsize: &str) -> PyResult<Bound<'py, PyAny>> {
    s.call_method1("expandtabs", (parse_int(tabsize)?,))
}

#[pyfunction]
#[pyo3(signature = (s, chars=""))]
fn strlstrip<'py>(s: &Bound<'py, PyString>, chars: &str) -> PyResult<Bound<'py, PyAny>> {
    s.call_method1("lstrip", (optional_text(chars),))
}

#[pyfunction]
#[pyo3(signature = (s, chars=""))]
fn strrstrip<'py>(s: &Bound<'py, PyString>, chars: &str) -> PyResult<Bound<'py, PyAny>> {
    s.call_method1("rstrip", (optional_text(chars),))
}

/// Split, then join the pieces with spaces to form a make word list
#[pyfunction]
#[pyo3(signature = (s, sep="", maxsplit=""))]
fn strsplit<'py>(s: &Bound<'py, PyString>, sep: &str, maxsplit: &str) -> PyResult<Bound<'py, PyAny>> {
    split_words(s, "split", sep, maxsplit)
}

#[pyfunction]
#[pyo3(signature = (s, sep="", maxsplit=""))]
fn strrsplit<'py>(s: &Bound<'py, PyString>, sep: &str, maxsplit: &str) -> PyResult<Bound<'py, PyAny>> {
    split_words(s, "rsplit", sep, maxsplit)
}

/// Join the words of `words` with `sep`
#[pyfunction]
fn strjoin(sep: &str, words: &str) -> String {
    words.split_whitespace().collect::<Vec<_>>().join(sep)
}

/// Replace each character of `fromchars` with the one at the same position
/// in `tochars`; extra characters in either are ignored.
#[pyfunction]
fn strtranslate(text: &str, fromchars: &str, tochars: &str) -> String {
    let table: std::collections::HashMap<char, char> = fromchars.chars().zip(tochars.chars()).collect();
    text.chars().map(|c| table.get(&c).copied().unwrap_or(c)).collect()
}

fn ranged<'py>(
    s: &Bound<'py, PyString>,
    method: &str,
    sub: &str,
    start: &str,
    end: &str,
) -> PyResult<Bound<'py, PyAny>> {
    s.call_method1(method, (sub, optional_int(start)?, optional_int(end)?))
}

fn split_words<'py>(
    s: &Bound<'py, PyString>,
    method: &str,
    sep: &str,
    maxsplit: &str,
) -> PyResult<Bound<'py, PyAny>> {
    let maxsplit = optional_int(maxsplit)?.unwrap_or(-1);
    let parts = s.call_method1(method, (optional_text(sep), maxsplit))?;
    PyString::new_bound(s.py(), " ").call_method1("join", (parts,))
}

fn parse_int(text: &str) -> PyResult<i64> {
    text.trim().parse().map_err(|_| {
        PyValueError::new_err(format!("invalid literal for int() with base 10: {:?}", text))
    })
}

fn optional_int(text: &str) -> PyResult<Option<i64>> {
    if text.is_empty() {
        Ok(None)
    } else {
        parse_int(text).map(Some)
    }
}

fn optional_text(text: &str) -> Option<&str> {
    (!text.is_empty()).then_some(text)
}
