use pygnumake::python::module;
use pygnumake::{Config, MemoryHost, Session};
use pyo3::exceptions::PyTypeError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::sync::Arc;

fn with_module<F>(f: F)
where
    F: FnOnce(Python<'_>, &MemoryHost, &Arc<Session>, &Bound<'_, PyDict>),
{
    Python::with_gil(|py| {
        let host = Arc::new(MemoryHost::new());
        let session = Session::new(py, host.clone(), Config::default()).unwrap();
        host.attach(&session);

        let globals = PyDict::new_bound(py);
        globals.set_item("gnumake", module(py, &session).unwrap()).unwrap();
        f(py, &*host, &session, &globals);
    });
}

#[test]
fn test_add_function_then_call_from_make() {
    with_module(|py, host, _session, globals| {
        py.run_bound(
            r#"
gnumake.add_function("greet", lambda n: "hello " + n, 1, 1)

@gnumake.export
def newer(a, b="0"):
    return a if a > b else b
"#,
            Some(globals),
            None,
        )
        .unwrap();

        assert_eq!(host.expand_str("$(greet world)"), "hello world");
        assert_eq!(host.expand_str("$(newer 1,2)"), "2");
        assert_eq!(host.expand_str("$(newer 9)"), "9");
    });
}

#[test]
fn test_invalid_registration() {
    with_module(|py, host, session, globals| {
        let err = py
            .run_bound("gnumake.add_function('f', len, 2, 1)", Some(globals), None)
            .unwrap_err();
        assert_eq!(err.value_bound(py).to_string(), "max_args < min_args (1 < 2)");

        let name = "x".repeat(256);
        let code = format!("gnumake.add_function('{}', len)", name);
        assert!(py.run_bound(&code, Some(globals), None).is_err());

        assert_eq!(session.registered_count(), 0);
        assert_eq!(host.function_count(), 0);
    });
}

#[test]
fn test_evaluate_and_expand() {
    with_module(|py, host, _session, globals| {
        py.run_bound(
            r#"
gnumake.evaluate("OBJS := a.o b.o")
assert gnumake.expand("$(OBJS) c.o") == "a.o b.o c.o"
assert gnumake.expand("$(UNDEFINED)") == ""
"#,
            Some(globals),
            None,
        )
        .unwrap();
        assert_eq!(host.variable("OBJS").unwrap(), "a.o b.o");

        let err = py
            .run_bound("gnumake.evaluate('X = 1', lineno=4)", Some(globals), None)
            .unwrap_err();
        assert!(err.is_instance_of::<PyTypeError>(py));
        assert_eq!(host.evaluations().len(), 1);
    });
}

#[test]
fn test_callback_uses_module() {
    with_module(|py, host, _session, globals| {
        py.run_bound(
            r#"
def objects(sources):
    return " ".join(s.rsplit(".", 1)[0] + ".o" for s in sources.split())

def remember(value):
    gnumake.variables["LAST"] = value

gnumake.export(objects)
gnumake.export(remember)
"#,
            Some(globals),
            None,
        )
        .unwrap();

        host.set_variable("SRCS", "main.c util.c");
        assert_eq!(host.expand_str("$(objects $(SRCS))"), "main.o util.o");

        assert_eq!(host.expand_str("$(remember 50% $$HOME)"), "");
        // stored as given; references in it expand on use
        assert_eq!(host.expand_str("$(value LAST)"), "50% $HOME");
    });
}

#[test]
fn test_escape_functions() {
    with_module(|py, _host, _session, globals| {
        py.run_bound(
            r#"
assert gnumake.fully_escape_string("$(X)") == "$$(X)"
assert gnumake.escape_string("a\\\nb") == "a\\$()\nb"
assert gnumake.is_legal_name("CFLAGS")
assert not gnumake.is_legal_name("A=B")
"#,
            Some(globals),
            None,
        )
        .unwrap();
    });
}
