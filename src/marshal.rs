//! Value marshaling - make byte strings ↔ Python objects
//!
//! Design: inbound arguments always become `str`; outbound results are
//! classified once into a `Category` and converted by the first matching
//! rule:
//!
//! 1. objects exporting the buffer protocol: raw bytes, verbatim
//! 2. `str`: locale encoding, strict
//! 3. `True`: the text `true`
//! 4. `False` / `None`: no output
//! 5. anything else: `str(obj)`, then rule 2
//!
//! The bytes produced here are copied into a host-allocated buffer by the
//! dispatch bridge; nothing in this module allocates on make's behalf.

use std::ffi::CStr;
use std::os::raw::c_char;

use pyo3::exceptions::PyOverflowError;
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyByteArray, PyBytes, PyString, PyTuple};

const STRICT: &CStr = c"strict";

/// Outbound conversion rule for a Python value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Buffer,
    Text,
    True,
    Nothing,
    Other,
}

impl Category {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::Text => "text",
            Self::True => "true",
            Self::Nothing => "nothing",
            Self::Other => "other",
        }
    }
}

pub fn classify(obj: &Bound<'_, PyAny>) -> Category {
    if obj.is_none() {
        return Category::Nothing;
    }
    if supports_buffer(obj) {
        return Category::Buffer;
    }
    if obj.is_instance_of::<PyString>() {
        return Category::Text;
    }
    match obj.downcast::<PyBool>() {
        Ok(flag) if flag.is_true() => Category::True,
        Ok(_) => Category::Nothing,
        Err(_) => Category::Other,
    }
}

/// Bytes to hand to make, without terminator. `None` means no output.
pub fn to_host_bytes(obj: &Bound<'_, PyAny>) -> PyResult<Option<Vec<u8>>> {
    let category = classify(obj);
    tracing::trace!(
        event = "type_conversion",
        from = category.name(),
        "Marshaling result for make"
    );

    match category {
        Category::Buffer => buffer_bytes(obj).map(Some),
        Category::Text => encode_locale(obj.downcast::<PyString>()?).map(Some),
        Category::True => Ok(Some(b"true".to_vec())),
        Category::Nothing => Ok(None),
        Category::Other => encode_locale(&obj.str()?).map(Some),
    }
}

/// Convert make arguments to a tuple of `str`, in order
pub fn marshal_args<'py>(py: Python<'py>, args: &[&CStr]) -> PyResult<Bound<'py, PyTuple>> {
    let values = args
        .iter()
        .map(|arg| decode_locale(py, arg))
        .collect::<PyResult<Vec<_>>>()?;
    Ok(PyTuple::new_bound(py, values))
}

/// Encode with the process locale's codec, failing on unencodable text
pub fn encode_locale(text: &Bound<'_, PyString>) -> PyResult<Vec<u8>> {
    let py = text.py();
    let encoded = unsafe {
        Bound::from_owned_ptr_or_err(py, ffi::PyUnicode_EncodeLocale(text.as_ptr(), STRICT.as_ptr()))?
    };
    Ok(encoded.downcast_into::<PyBytes>()?.as_bytes().to_vec())
}

/// Decode a NUL-terminated make string with the locale codec, strictly
pub fn decode_locale<'py>(py: Python<'py>, text: &CStr) -> PyResult<Bound<'py, PyString>> {
    let len = ffi::Py_ssize_t::try_from(text.to_bytes().len())
        .map_err(|_| PyOverflowError::new_err("argument too long"))?;
    let decoded = unsafe {
        Bound::from_owned_ptr_or_err(
            py,
            ffi::PyUnicode_DecodeLocaleAndSize(text.as_ptr() as *const c_char, len, STRICT.as_ptr()),
        )?
    };
    Ok(decoded.downcast_into::<PyString>()?)
}

/// Conversion used when Python code writes make variables:
/// `True` → `1`, `False`/`None` → empty, `str` unchanged, `bytes` and
/// `bytearray` decoded, anything else `str(obj)`.
pub fn to_make_text(obj: &Bound<'_, PyAny>) -> PyResult<String> {
    if obj.is_none() {
        return Ok(String::new());
    }
    if let Ok(flag) = obj.downcast::<PyBool>() {
        return Ok(if flag.is_true() { "1".to_string() } else { String::new() });
    }
    if let Ok(text) = obj.downcast::<PyString>() {
        return Ok(text.to_str()?.to_owned());
    }
    if obj.is_instance_of::<PyBytes>() || obj.is_instance_of::<PyByteArray>() {
        return obj.call_method0("decode")?.extract();
    }
    obj.str()?.extract()
}

fn supports_buffer(obj: &Bound<'_, PyAny>) -> bool {
    unsafe { ffi::PyObject_CheckBuffer(obj.as_ptr()) != 0 }
}

/// Copy the raw contents of a buffer-protocol object
fn buffer_bytes(obj: &Bound<'_, PyAny>) -> PyResult<Vec<u8>> {
    let py = obj.py();
    let mut view = ffi::Py_buffer::new();

    unsafe {
        if ffi::PyObject_GetBuffer(obj.as_ptr(), &mut view, ffi::PyBUF_SIMPLE) == -1 {
            return Err(PyErr::fetch(py));
        }

        let len = usize::try_from(view.len).unwrap_or(0);
        let bytes = if view.buf.is_null() || len == 0 {
            Vec::new()
        } else {
            core::slice::from_raw_parts(view.buf as *const u8, len).to_vec()
        };

        ffi::PyBuffer_Release(&mut view);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostString, MemoryHost};
    use proptest::prelude::*;
    use pyo3::exceptions::PyUnicodeEncodeError;
    use std::ffi::CString;

    /// Marshal `obj` and copy it into a host buffer, as dispatch does
    fn host_buffer(host: &MemoryHost, obj: &Bound<'_, PyAny>) -> Option<Vec<u8>> {
        let bytes = to_host_bytes(obj).unwrap()?;
        let out = HostString::from_bytes(host, &bytes).unwrap();
        Some(out.as_bytes_with_nul().to_vec())
    }

    fn eval<'py>(py: Python<'py>, expr: &str) -> Bound<'py, PyAny> {
        py.eval_bound(expr, None, None).unwrap()
    }

    #[test]
    fn test_classify() {
        Python::with_gil(|py| {
            assert_eq!(classify(&eval(py, "b'raw'")), Category::Buffer);
            assert_eq!(classify(&eval(py, "bytearray(b'raw')")), Category::Buffer);
            assert_eq!(classify(&eval(py, "memoryview(b'raw')")), Category::Buffer);
            assert_eq!(classify(&eval(py, "'text'")), Category::Text);
            assert_eq!(classify(&eval(py, "True")), Category::True);
            assert_eq!(classify(&eval(py, "False")), Category::Nothing);
            assert_eq!(classify(&eval(py, "None")), Category::Nothing);
            assert_eq!(classify(&eval(py, "42")), Category::Other);
            assert_eq!(classify(&eval(py, "[1, 2]")), Category::Other);
        });
    }

    #[test]
    fn test_buffer_copied_verbatim() {
        Python::with_gil(|py| {
            let bytes = to_host_bytes(&eval(py, "b'a\\x00b\\xff'")).unwrap().unwrap();
            assert_eq!(bytes, b"a\x00b\xff");
        });
    }

    #[test]
    fn test_outbound_rules() {
        Python::with_gil(|py| {
            assert_eq!(to_host_bytes(&eval(py, "'hello'")).unwrap().unwrap(), b"hello");
            assert_eq!(to_host_bytes(&eval(py, "True")).unwrap().unwrap(), b"true");
            assert_eq!(to_host_bytes(&eval(py, "False")).unwrap(), None);
            assert_eq!(to_host_bytes(&eval(py, "None")).unwrap(), None);
            assert_eq!(to_host_bytes(&eval(py, "42")).unwrap().unwrap(), b"42");
            assert_eq!(to_host_bytes(&eval(py, "[1, 2]")).unwrap().unwrap(), b"[1, 2]");
        });
    }

    #[test]
    fn test_unencodable_text_fails() {
        Python::with_gil(|py| {
            let err = to_host_bytes(&eval(py, "'\\udcff'")).unwrap_err();
            assert!(err.is_instance_of::<PyUnicodeEncodeError>(py));
        });
    }

    #[test]
    fn test_marshal_args_in_order() {
        Python::with_gil(|py| {
            let a = CString::new("first").unwrap();
            let b = CString::new("").unwrap();
            let c = CString::new("third arg").unwrap();
            let args = marshal_args(py, &[&a, &b, &c]).unwrap();

            let values: Vec<String> = args.extract().unwrap();
            assert_eq!(values, vec!["first", "", "third arg"]);
        });
    }

    #[test]
    fn test_to_make_text() {
        Python::with_gil(|py| {
            assert_eq!(to_make_text(&eval(py, "True")).unwrap(), "1");
            assert_eq!(to_make_text(&eval(py, "False")).unwrap(), "");
            assert_eq!(to_make_text(&eval(py, "None")).unwrap(), "");
            assert_eq!(to_make_text(&eval(py, "b'abc'")).unwrap(), "abc");
            assert_eq!(to_make_text(&eval(py, "bytearray(b'xy')")).unwrap(), "xy");
            assert_eq!(to_make_text(&eval(py, "3.5")).unwrap(), "3.5");
        });
    }

    proptest! {
        #[test]
        fn prop_text_reaches_make_with_one_terminator(text in "[ -~\t\n]{0,64}") {
            let host = MemoryHost::new();
            let out = Python::with_gil(|py| host_buffer(&host, PyString::new_bound(py, &text).as_any()));

            let mut expected = text.clone().into_bytes();
            expected.push(0);
            prop_assert_eq!(out, Some(expected));
            prop_assert_eq!(host.live_allocations(), 0);
        }

        #[test]
        fn prop_buffers_reach_make_verbatim(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let host = MemoryHost::new();
            let out = Python::with_gil(|py| host_buffer(&host, PyBytes::new_bound(py, &data).as_any()));

            let mut expected = data.clone();
            expected.push(0);
            prop_assert_eq!(out, Some(expected));
        }
    }
}
