//! In-memory host for driving the bridge without a make process
//!
//! Implements enough of make's variable model to exercise everything the
//! bridge asks of its host: `define`/`endef` blocks (with nesting and the
//! `=`, `:=`, `+=`, `?=` operators), `undefine`, one-line assignments,
//! `$(VAR)`/`${VAR}`/`$X`/`$$` references, the `value`, `origin`, `flavor`,
//! `strip`, `info` and `error` functions, and calls to functions registered
//! through `add_function`.
//!
//! Where make would exit (`$(error ...)`, syntax errors) the host records the
//! message, reports `Evaluation::Diverged`, and refuses all further
//! evaluation, since a real process would be gone.
//!
//! Allocations go through `malloc`/`free` and are counted so tests can check
//! that every buffer crossing the boundary is released exactly once.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{Evaluation, FunctionDescriptor, Host, HostString, Location};
use crate::session::Session;

const MAX_EXPANSION_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Recursive,
    Simple,
}

#[derive(Debug, Clone)]
struct Variable {
    value: String,
    flavor: Flavor,
}

#[derive(Default)]
struct State {
    variables: HashMap<String, Variable>,
    functions: HashMap<Vec<u8>, FunctionDescriptor>,
    evaluations: Vec<(String, Option<Location>)>,
    messages: Vec<String>,
    fatal: Option<String>,
}

/// Marker: make would have exited
struct Diverged;

/// Why `MemoryHost::call` refused to dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallRejected {
    Unknown(String),
    Arity { name: String, argc: usize },
    NulByte,
    Diverged,
}

impl fmt::Display for CallRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(name) => write!(f, "no function named '{}'", name),
            Self::Arity { name, argc } => write!(
                f,
                "*** insufficient number of arguments ({}) to function '{}'.  Stop.",
                argc, name
            ),
            Self::NulByte => write!(f, "argument contains a NUL byte"),
            Self::Diverged => write!(f, "make exited while expanding arguments"),
        }
    }
}

impl std::error::Error for CallRejected {}

#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<State>,
    session: Mutex<Option<Weak<Session>>>,
    live: AtomicUsize,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `$(name args)` for registered functions into `session`
    pub fn attach(&self, session: &Arc<Session>) {
        *self.session.lock() = Some(Arc::downgrade(session));
    }

    /// Define a recursively expanded variable, as `name = value` would
    pub fn set_variable(&self, name: &str, value: &str) {
        self.state.lock().variables.insert(
            name.to_string(),
            Variable {
                value: value.to_string(),
                flavor: Flavor::Recursive,
            },
        );
    }

    /// Unexpanded value, `None` when undefined
    pub fn variable(&self, name: &str) -> Option<String> {
        self.state.lock().variables.get(name).map(|v| v.value.clone())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.state.lock().variables.contains_key(name)
    }

    pub fn function(&self, name: &str) -> Option<FunctionDescriptor> {
        self.state.lock().functions.get(name.as_bytes()).cloned()
    }

    pub fn function_count(&self) -> usize {
        self.state.lock().functions.len()
    }

    /// Every text handed to `eval`, in order
    pub fn evaluations(&self) -> Vec<(String, Option<Location>)> {
        self.state.lock().evaluations.clone()
    }

    /// Output of `$(info ...)`
    pub fn messages(&self) -> Vec<String> {
        self.state.lock().messages.clone()
    }

    /// Message make would have printed before exiting
    pub fn fatal_error(&self) -> Option<String> {
        self.state.lock().fatal.clone()
    }

    /// Buffers allocated through this host and not yet freed
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Expand `text` and return it as a `String`; empty if make exited
    pub fn expand_str(&self, text: &str) -> String {
        self.expand_text(text, 0).unwrap_or_default()
    }

    /// Call a registered function the way make does: look it up, expand the
    /// arguments unless registered with `expand = false`, enforce arity, then
    /// dispatch. The result buffer is copied out and freed.
    pub fn call(
        &self,
        session: &Session,
        name: &str,
        args: &[&str],
    ) -> Result<Option<Vec<u8>>, CallRejected> {
        let descriptor = self
            .function(name)
            .ok_or_else(|| CallRejected::Unknown(name.to_string()))?;

        let args = self.prepare_args(&descriptor, args.iter().map(|a| a.to_string()).collect())?;
        let args = args
            .into_iter()
            .map(|a| CString::new(a).map_err(|_| CallRejected::NulByte))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&CStr> = args.iter().map(|a| a.as_c_str()).collect();

        Ok(session
            .dispatch(descriptor.name(), &refs)
            .map(|out| out.as_bytes().to_vec()))
    }

    fn prepare_args(
        &self,
        descriptor: &FunctionDescriptor,
        args: Vec<String>,
    ) -> Result<Vec<String>, CallRejected> {
        if !descriptor.accepts(args.len()) {
            return Err(CallRejected::Arity {
                name: descriptor.name().to_string_lossy().into_owned(),
                argc: args.len(),
            });
        }

        if !descriptor.expands() {
            return Ok(args);
        }

        args.iter()
            .map(|a| self.expand_text(a, 0).map_err(|_| CallRejected::Diverged))
            .collect()
    }

    fn diverge(&self, message: String) -> Diverged {
        let mut state = self.state.lock();
        if state.fatal.is_none() {
            state.fatal = Some(message);
        }
        Diverged
    }

    fn has_exited(&self) -> bool {
        self.state.lock().fatal.is_some()
    }

    // ------------------------------------------------------------------
    // Expansion
    // ------------------------------------------------------------------

    fn expand_text(&self, text: &str, depth: usize) -> Result<String, Diverged> {
        if self.has_exited() {
            return Err(Diverged);
        }
        if depth > MAX_EXPANSION_DEPTH {
            return Err(self.diverge("*** Recursive variable references itself.  Stop.".into()));
        }

        let bytes = text.as_bytes();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;

        while i < bytes.len() {
            let Some(offset) = text[i..].find('$') else {
                out.push_str(&text[i..]);
                break;
            };
            out.push_str(&text[i..i + offset]);
            i += offset;

            let Some(&next) = bytes.get(i + 1) else {
                break;
            };

            match next {
                b'$' => {
                    out.push('$');
                    i += 2;
                }
                b'(' | b'{' => {
                    let close = if next == b'(' { b')' } else { b'}' };
                    let end = matching_close(bytes, i + 2, next, close).ok_or_else(|| {
                        self.diverge("*** unterminated variable reference.  Stop.".into())
                    })?;
                    out.push_str(&self.reference(&text[i + 2..end], depth)?);
                    i = end + 1;
                }
                _ => {
                    let ch = text[i + 1..].chars().next().unwrap_or_default();
                    out.push_str(&self.lookup(&ch.to_string(), depth)?);
                    i += 1 + ch.len_utf8();
                }
            }
        }

        Ok(out)
    }

    fn reference(&self, inner: &str, depth: usize) -> Result<String, Diverged> {
        if let Some((word, rest)) = inner.split_once([' ', '\t']) {
            match word {
                "value" => {
                    let name = self.expand_text(rest, depth + 1)?;
                    return Ok(self.variable(name.trim()).unwrap_or_default());
                }
                "origin" => {
                    let name = self.expand_text(rest, depth + 1)?;
                    let origin = if self.is_defined(name.trim()) { "file" } else { "undefined" };
                    return Ok(origin.to_string());
                }
                "flavor" => {
                    let name = self.expand_text(rest, depth + 1)?;
                    let flavor = match self.state.lock().variables.get(name.trim()) {
                        Some(v) if v.flavor == Flavor::Simple => "simple",
                        Some(_) => "recursive",
                        None => "undefined",
                    };
                    return Ok(flavor.to_string());
                }
                "strip" => {
                    let text = self.expand_text(rest, depth + 1)?;
                    return Ok(text.split_whitespace().collect::<Vec<_>>().join(" "));
                }
                "info" => {
                    let text = self.expand_text(rest, depth + 1)?;
                    self.state.lock().messages.push(text);
                    return Ok(String::new());
                }
                "error" => {
                    let text = self.expand_text(rest, depth + 1)?;
                    return Err(self.diverge(format!("*** {}.  Stop.", text)));
                }
                _ => {}
            }

            if let Some(descriptor) = self.function(word) {
                return self.call_function(&descriptor, rest);
            }
        }

        let name = self.expand_text(inner, depth + 1)?;
        self.lookup(&name, depth)
    }

    fn lookup(&self, name: &str, depth: usize) -> Result<String, Diverged> {
        let variable = self.state.lock().variables.get(name).cloned();
        match variable {
            None => Ok(String::new()),
            Some(v) if v.flavor == Flavor::Simple => Ok(v.value),
            Some(v) => self.expand_text(&v.value, depth + 1),
        }
    }

    fn call_function(&self, descriptor: &FunctionDescriptor, args: &str) -> Result<String, Diverged> {
        let raw = split_args(args, descriptor.max_args() as usize);
        let args = match self.prepare_args(descriptor, raw) {
            Ok(args) => args,
            Err(CallRejected::Diverged) => return Err(Diverged),
            Err(rejected) => return Err(self.diverge(rejected.to_string())),
        };

        let session = self.session.lock().as_ref().and_then(Weak::upgrade);
        let Some(session) = session else {
            return Ok(String::new());
        };

        let args: Vec<CString> = args
            .into_iter()
            .filter_map(|a| CString::new(a).ok())
            .collect();
        let refs: Vec<&CStr> = args.iter().map(|a| a.as_c_str()).collect();
        let result = session
            .dispatch(descriptor.name(), &refs)
            .map(|out| String::from_utf8_lossy(out.as_bytes()).into_owned())
            .unwrap_or_default();

        if self.has_exited() {
            return Err(Diverged);
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    fn eval_text(&self, text: &str, location: Option<&Location>) -> Result<(), Diverged> {
        let lines = logical_lines(text);
        let mut idx = 0;

        while idx < lines.len() {
            let (line_no, raw) = &lines[idx];
            let line = join_continuations(raw);
            let trimmed = line.trim();
            idx += 1;

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Some(header) = directive(trimmed, "define") {
                let (body, next) = self.define_body(&lines, idx, location, *line_no)?;
                idx = next;

                let mut parts = header.split_whitespace();
                let name = self.expand_text(parts.next().unwrap_or_default(), 0)?;
                let op = parts.next().unwrap_or("=");
                self.assign(name.trim(), op, &body)?;
            } else if let Some(rest) = directive(trimmed, "undefine") {
                let name = self.expand_text(rest, 0)?;
                self.state.lock().variables.remove(name.trim());
            } else if let Some((name, op, value)) = split_assignment(trimmed) {
                let name = self.expand_text(name, 0)?;
                self.assign(name.trim(), op, value)?;
            } else {
                let expanded = self.expand_text(trimmed, 0)?;
                if !expanded.trim().is_empty() && !expanded.contains(':') {
                    return Err(self.diverge(format!(
                        "{}*** missing separator.  Stop.",
                        prefix(location, *line_no)
                    )));
                }
            }
        }

        Ok(())
    }

    /// Body of a `define` starting at logical line `start`, kept verbatim.
    /// `define` and `endef` only count at the start of a logical line.
    fn define_body(
        &self,
        lines: &[(usize, String)],
        start: usize,
        location: Option<&Location>,
        line_no: usize,
    ) -> Result<(String, usize), Diverged> {
        let mut depth = 1;
        let mut idx = start;

        while idx < lines.len() {
            let trimmed = lines[idx].1.trim_start();
            if directive(trimmed, "define").is_some() {
                depth += 1;
            } else if directive(trimmed, "endef").is_some() {
                depth -= 1;
                if depth == 0 {
                    let body: Vec<&str> = lines[start..idx].iter().map(|(_, l)| l.as_str()).collect();
                    return Ok((body.join("\n"), idx + 1));
                }
            }
            idx += 1;
        }

        Err(self.diverge(format!(
            "{}*** missing 'endef', unterminated 'define'.  Stop.",
            prefix(location, line_no)
        )))
    }

    fn assign(&self, name: &str, op: &str, value: &str) -> Result<(), Diverged> {
        if name.is_empty() {
            return Err(self.diverge("*** empty variable name.  Stop.".into()));
        }

        let variable = match op {
            ":=" | "::=" => Variable {
                value: self.expand_text(value, 0)?,
                flavor: Flavor::Simple,
            },
            "+=" => {
                let existing = self.state.lock().variables.get(name).cloned();
                match existing {
                    Some(old) => {
                        let addition = match old.flavor {
                            Flavor::Simple => self.expand_text(value, 0)?,
                            Flavor::Recursive => value.to_string(),
                        };
                        let value = if old.value.is_empty() {
                            addition
                        } else {
                            format!("{} {}", old.value, addition)
                        };
                        Variable { value, flavor: old.flavor }
                    }
                    None => Variable {
                        value: value.to_string(),
                        flavor: Flavor::Recursive,
                    },
                }
            }
            "?=" if self.is_defined(name) => return Ok(()),
            _ => Variable {
                value: value.to_string(),
                flavor: Flavor::Recursive,
            },
        };

        self.state.lock().variables.insert(name.to_string(), variable);
        Ok(())
    }
}

impl Host for MemoryHost {
    fn add_function(&self, descriptor: &FunctionDescriptor) {
        self.state
            .lock()
            .functions
            .insert(descriptor.name().to_bytes().to_vec(), descriptor.clone());
    }

    fn alloc(&self, size: usize) -> *mut c_char {
        let ptr = unsafe { libc::malloc(size.max(1)) } as *mut c_char;
        if !ptr.is_null() {
            self.live.fetch_add(1, Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn free(&self, ptr: *mut c_char) {
        if !ptr.is_null() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            libc::free(ptr as *mut libc::c_void);
        }
    }

    fn expand(&self, text: &CStr) -> *mut c_char {
        match self.expand_text(&text.to_string_lossy(), 0) {
            Ok(expanded) => HostString::from_bytes(self, expanded.as_bytes())
                .map_or(core::ptr::null_mut(), HostString::into_raw),
            Err(Diverged) => core::ptr::null_mut(),
        }
    }

    fn eval(&self, text: &CStr, location: Option<&Location>) -> Evaluation {
        let text = text.to_string_lossy().into_owned();
        {
            let mut state = self.state.lock();
            state.evaluations.push((text.clone(), location.cloned()));
            if state.fatal.is_some() {
                return Evaluation::Diverged;
            }
        }

        match self.eval_text(&text, location) {
            Ok(()) => Evaluation::Returned,
            Err(Diverged) => Evaluation::Diverged,
        }
    }
}

/// `word` followed by whitespace or end of line; returns the remainder
/// Physical lines grouped the way make reads them: a line ending in an odd
/// number of backslashes continues on the next. Each entry is the offset of
/// its first physical line and the raw text, newlines included.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (no, physical) in text.split('\n').enumerate() {
        let (first, mut raw) = match current.take() {
            Some((first, mut raw)) => {
                raw.push('\n');
                (first, raw)
            }
            None => (no, String::new()),
        };
        raw.push_str(physical);

        if continues(physical) {
            current = Some((first, raw));
        } else {
            lines.push((first, raw));
        }
    }

    lines.extend(current);
    lines
}

fn continues(line: &str) -> bool {
    line.bytes().rev().take_while(|&b| b == b'\\').count() % 2 == 1
}

/// A logical line outside `define`: each backslash-newline and the
/// indentation after it become one space.
fn join_continuations(raw: &str) -> String {
    let mut pieces = raw.split('\n').peekable();
    let mut out = String::new();

    while let Some(piece) = pieces.next() {
        if pieces.peek().is_some() {
            out.push_str(piece.strip_suffix('\\').unwrap_or(piece).trim_end());
            out.push(' ');
        } else {
            out.push_str(piece);
        }
        if let Some(next) = pieces.peek_mut() {
            *next = str::trim_start(*next);
        }
    }

    out
}

fn directive<'a>(line: &'a str, word: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(word)?;
    if rest.is_empty() {
        Some(rest)
    } else if rest.starts_with([' ', '\t']) {
        Some(rest.trim())
    } else {
        None
    }
}

/// Split `NAME op value` at the first top-level assignment operator
fn split_assignment(line: &str) -> Option<(&str, &str, &str)> {
    let bytes = line.as_bytes();
    let mut depth = 0usize;

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'{' => depth += 1,
            b')' | b'}' => depth = depth.saturating_sub(1),
            b'=' if depth == 0 => {
                let (op_start, op) = if line[..i].ends_with("::") {
                    (i - 2, "::=")
                } else if i > 0 && matches!(bytes[i - 1], b':' | b'+' | b'?') {
                    (i - 1, &line[i - 1..=i])
                } else {
                    (i, "=")
                };
                let name = line[..op_start].trim();
                if name.is_empty() || name.contains(char::is_whitespace) {
                    return None;
                }
                return Some((name, op, line[i + 1..].trim_start()));
            }
            _ => {}
        }
    }

    None
}

fn matching_close(bytes: &[u8], start: usize, open: u8, close: u8) -> Option<usize> {
    let mut depth = 1usize;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some(start + offset);
            }
        }
    }
    None
}

/// Split function arguments at top-level commas; with a maximum, the last
/// argument keeps any further commas, as make does.
fn split_args(text: &str, max_args: usize) -> Vec<String> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();

    for ch in text.chars() {
        match ch {
            '(' | '{' => depth += 1,
            ')' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 && (max_args == 0 || args.len() + 1 < max_args) => {
                args.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    args.push(current);
    args
}

fn prefix(location: Option<&Location>, line_offset: usize) -> String {
    match location {
        Some(loc) => format!(
            "{}:{}: ",
            loc.filename.to_string_lossy(),
            loc.lineno + line_offset as u64
        ),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(host: &MemoryHost, text: &str) -> Evaluation {
        host.eval(&CString::new(text).unwrap(), None)
    }

    #[test]
    fn test_assignments() {
        let host = MemoryHost::new();
        assert_eq!(eval(&host, "A = one\nB := $(A) two\nA += three"), Evaluation::Returned);

        assert_eq!(host.expand_str("$(A)"), "one three");
        assert_eq!(host.expand_str("${B}"), "one two");
        assert_eq!(host.expand_str("$(flavor B)"), "simple");
        assert_eq!(host.expand_str("$(flavor A)"), "recursive");
        assert_eq!(host.expand_str("$(origin C)"), "undefined");
    }

    #[test]
    fn test_recursive_expansion_is_lazy() {
        let host = MemoryHost::new();
        let _ = eval(&host, "OUT = $(IN)\nIN = late");
        assert_eq!(host.expand_str("$(OUT)"), "late");
        assert_eq!(host.expand_str("$(value OUT)"), "$(IN)");
    }

    #[test]
    fn test_define_block() {
        let host = MemoryHost::new();
        let _ = eval(&host, "define BLOCK\nline one\n  define INNER\n  endef\nline two\nendef");
        assert_eq!(
            host.variable("BLOCK").unwrap(),
            "line one\n  define INNER\n  endef\nline two"
        );
    }

    #[test]
    fn test_define_with_operator() {
        let host = MemoryHost::new();
        host.set_variable("X", "x");
        let _ = eval(&host, "define S :=\n$(X)\nendef\ndefine S +=\nmore\nendef");
        assert_eq!(host.variable("S").unwrap(), "x more");
    }

    #[test]
    fn test_escaped_endef_stays_in_body() {
        let host = MemoryHost::new();
        let _ = eval(&host, "define V\n$()endef\nendef");
        assert_eq!(host.expand_str("$(V)"), "endef");
    }

    #[test]
    fn test_undefine() {
        let host = MemoryHost::new();
        host.set_variable("GONE", "1");
        let _ = eval(&host, "undefine GONE");
        assert!(!host.is_defined("GONE"));
    }

    #[test]
    fn test_error_diverges() {
        let host = MemoryHost::new();
        host.set_variable("MSG", "boom");
        assert_eq!(eval(&host, "$(error $(MSG))"), Evaluation::Diverged);
        assert_eq!(host.fatal_error().unwrap(), "*** boom.  Stop.");

        // Nothing runs once make has exited.
        assert_eq!(eval(&host, "A = 1"), Evaluation::Diverged);
        assert!(!host.is_defined("A"));
    }

    #[test]
    fn test_missing_separator_uses_location() {
        let host = MemoryHost::new();
        let loc = Location::from_parts(Some(b"rules.mk".to_vec()), Some(10)).unwrap();
        let result = host.eval(&CString::new("A = 1\nnot make syntax").unwrap(), loc.as_ref());

        assert_eq!(result, Evaluation::Diverged);
        assert_eq!(
            host.fatal_error().unwrap(),
            "rules.mk:11: *** missing separator.  Stop."
        );
    }

    #[test]
    fn test_unterminated_define() {
        let host = MemoryHost::new();
        assert_eq!(eval(&host, "define X\nbody"), Evaluation::Diverged);
    }

    #[test]
    fn test_info_and_dollar() {
        let host = MemoryHost::new();
        let _ = eval(&host, "$(info cost: $$5)");
        assert_eq!(host.messages(), vec!["cost: $5".to_string()]);
    }

    #[test]
    fn test_split_args() {
        assert_eq!(split_args("a,b,c", 0), vec!["a", "b", "c"]);
        assert_eq!(split_args("a,b,c", 2), vec!["a", "b,c"]);
        assert_eq!(split_args("$(f x,y),z", 0), vec!["$(f x,y)", "z"]);
    }

    #[test]
    fn test_expand_allocates_from_host() {
        let host = MemoryHost::new();
        host.set_variable("V", "value");
        let expanded = HostString::expand(&host, &CString::new("$(V)").unwrap()).unwrap();
        assert_eq!(expanded.as_bytes(), b"value");
        assert_eq!(host.live_allocations(), 1);
        drop(expanded);
        assert_eq!(host.live_allocations(), 0);
    }

    #[test]
    fn test_line_continuation() {
        let host = MemoryHost::new();
        assert_eq!(eval(&host, "FLAGS = -O2 \\\n    -g"), Evaluation::Returned);
        assert_eq!(host.variable("FLAGS").unwrap(), "-O2 -g");

        // an even number of backslashes does not continue
        assert_eq!(eval(&host, "PATHS = a\\\\\nB = b"), Evaluation::Returned);
        assert_eq!(host.variable("PATHS").unwrap(), "a\\\\");
        assert_eq!(host.variable("B").unwrap(), "b");

        // inside define the body is kept as written
        assert_eq!(eval(&host, "define V\nx \\\ny\nendef"), Evaluation::Returned);
        assert_eq!(host.variable("V").unwrap(), "x \\\ny");
    }
}
