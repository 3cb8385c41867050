//! `gnumake.variables`: make variables with a mapping-like interface

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyString;

use super::{is_legal_name, Bridge};
use crate::escape::escape_string;
use crate::marshal::to_make_text;

#[pyclass(frozen, module = "gnumake")]
pub struct Variables {
    bridge: Py<Bridge>,
}

impl Variables {
    pub(crate) fn new(bridge: Py<Bridge>) -> Self {
        Self { bridge }
    }

    fn expand(&self, py: Python<'_>, text: &str) -> PyResult<String> {
        let session = self.bridge.get().session()?;
        let expanded = session.expand(&PyString::new_bound(py, text))?;
        Ok(expanded.to_str()?.to_owned())
    }

    fn evaluate(&self, py: Python<'_>, text: &str) -> PyResult<()> {
        let session = self.bridge.get().session()?;
        let _ = session.evaluate(&PyString::new_bound(py, text), None)?;
        Ok(())
    }

    /// Escaped `define` body for `value`
    fn body(value: &Bound<'_, PyAny>) -> PyResult<String> {
        Ok(escape_string(&to_make_text(value)?))
    }
}

fn check_name(name: &str) -> PyResult<()> {
    if is_legal_name(name) {
        Ok(())
    } else {
        Err(PyValueError::new_err(format!("Illegal name: {:?}", name)))
    }
}

#[pymethods]
impl Variables {
    /// Value of `name`, expanded unless `expand_value` is false. `default`
    /// is returned only when the variable is undefined.
    #[pyo3(signature = (name, default=None, expand_value=true))]
    fn get(
        &self,
        py: Python<'_>,
        name: &str,
        default: Option<PyObject>,
        expand_value: bool,
    ) -> PyResult<PyObject> {
        check_name(name)?;

        let reference = if expand_value {
            format!("$({})", name)
        } else {
            format!("$(value {})", name)
        };
        let value = self.expand(py, &reference)?;

        if value.is_empty() {
            if let Some(default) = default {
                if default.bind(py).is_truthy()? && !self.defined(py, name)? {
                    return Ok(default);
                }
            }
        }
        Ok(value.into_py(py))
    }

    /// Assign `value`; flavor `recursive` is `name = value`, `simple` is
    /// `name := value`. `$` in the value is not escaped.
    #[pyo3(signature = (name, value, flavor="recursive"))]
    fn set(&self, py: Python<'_>, name: &str, value: &Bound<'_, PyAny>, flavor: &str) -> PyResult<()> {
        check_name(name)?;

        let operator = match flavor {
            "recursive" => "=",
            "simple" => ":=",
            _ => {
                return Err(PyValueError::new_err(
                    "Valid flavors are 'recursive' and 'simple'",
                ))
            }
        };

        let body = Self::body(value)?;
        self.evaluate(py, &format!("define {} {}\n{}\nendef", name, operator, body))
    }

    fn undefine(&self, py: Python<'_>, name: &str) -> PyResult<()> {
        check_name(name)?;
        self.evaluate(py, &format!("undefine {}", name))
    }

    /// Append with a single space; the flavor is unchanged
    fn append(&self, py: Python<'_>, name: &str, value: &Bound<'_, PyAny>) -> PyResult<()> {
        check_name(name)?;
        let body = Self::body(value)?;
        self.evaluate(py, &format!("define {} +=\n{}\nendef", name, body))
    }

    fn origin(&self, py: Python<'_>, name: &str) -> PyResult<String> {
        check_name(name)?;
        self.expand(py, &format!("$(origin {})", name))
    }

    /// `simple`, `recursive` or `undefined`
    fn flavor(&self, py: Python<'_>, name: &str) -> PyResult<String> {
        check_name(name)?;
        self.expand(py, &format!("$(flavor {})", name))
    }

    fn defined(&self, py: Python<'_>, name: &str) -> PyResult<bool> {
        Ok(self.origin(py, name)? != "undefined")
    }

    fn __getitem__(&self, py: Python<'_>, name: &str) -> PyResult<PyObject> {
        self.get(py, name, None, true)
    }

    fn __setitem__(&self, py: Python<'_>, name: &str, value: &Bound<'_, PyAny>) -> PyResult<()> {
        self.set(py, name, value, "recursive")
    }

    fn __delitem__(&self, py: Python<'_>, name: &str) -> PyResult<()> {
        self.undefine(py, name)
    }

    fn __contains__(&self, py: Python<'_>, name: &str) -> PyResult<bool> {
        self.defined(py, name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pyo3::types::PyDict;

    use crate::config::Config;
    use crate::host::MemoryHost;
    use crate::python::module;
    use crate::session::Session;

    use super::*;

    fn run(code: &str) -> Arc<MemoryHost> {
        Python::with_gil(|py| {
            let host = Arc::new(MemoryHost::new());
            let session = Session::new(py, host.clone(), Config::default()).unwrap();
            let globals = PyDict::new_bound(py);
            globals.set_item("gnumake", module(py, &session).unwrap()).unwrap();
            py.run_bound(code, Some(&globals), None).unwrap();
            host
        })
    }

    #[test]
    fn test_set_and_get() {
        let host = run(r#"
v = gnumake.variables
v.set('CC', 'gcc')
v['CFLAGS'] = '-O2 $(EXTRA)'
v.set('FIXED', '$(CC)', flavor='simple')
assert v['CC'] == 'gcc'
assert v.get('CFLAGS', expand_value=False) == '-O2 $(EXTRA)'
assert v.flavor('FIXED') == 'simple'
assert v.flavor('CC') == 'recursive'
"#);
        assert_eq!(host.variable("CC").unwrap(), "gcc");
        assert_eq!(host.variable("FIXED").unwrap(), "gcc");
    }

    #[test]
    fn test_defaults_and_membership() {
        run(r#"
v = gnumake.var
assert v.get('MISSING', 'fallback') == 'fallback'
v['EMPTY'] = ''
assert v.get('EMPTY', 'fallback') == ''
assert 'EMPTY' in v
assert 'MISSING' not in v
assert v.origin('MISSING') == 'undefined'
"#);
    }

    #[test]
    fn test_append_and_undefine() {
        let host = run(r#"
v = gnumake.variables
v['LIST'] = 'a'
v.append('LIST', 'b')
v.append('LIST', True)
assert v['LIST'] == 'a b 1'
del v['LIST']
assert 'LIST' not in v
"#);
        assert!(!host.is_defined("LIST"));
    }

    #[test]
    fn test_value_conversion_and_escaping() {
        let host = run(r#"
v = gnumake.variables
v['FLAG'] = False
v['RAW'] = b'bytes'
v['BLOCK'] = 'one\nendef\ntwo'
"#);
        assert_eq!(host.variable("FLAG").unwrap(), "");
        assert_eq!(host.variable("RAW").unwrap(), "bytes");
        assert_eq!(host.expand_str("$(BLOCK)"), "one\nendef\ntwo");
    }

    #[test]
    fn test_illegal_names() {
        run(r#"
v = gnumake.variables
for bad in ('A B', 'A=B', '$(X)', 'a:b', 'x#'):
    try:
        v[bad] = '1'
    except ValueError:
        pass
    else:
        raise AssertionError(bad)
"#);
    }

    #[test]
    fn test_bad_flavor() {
        run(r#"
try:
    gnumake.variables.set('A', '1', flavor='lazy')
except ValueError:
    pass
else:
    raise AssertionError('flavor accepted')
"#);
    }
}
