//! Escaping text for a make `define` body
//!
//! A `define` block ends at the first line starting with `endef` and nests on
//! lines starting with `define`; a backslash-newline joins lines. Inserting an
//! empty reference `$()` in front of those sequences keeps them in the body
//! and expands to nothing.

/// Neutralise block delimiters and line continuations. `$` is left alone,
/// so references in `text` still expand when the variable is used.
///
/// A trailing backslash also gets `$()`: the body is followed by the newline
/// before `endef`, which it would otherwise escape.
pub fn escape_definition(text: &[u8]) -> Vec<u8> {
    let out = replace_all(text, b"endef", b"$()endef");
    let out = replace_all(&out, b"define", b"$()define");
    let mut out = replace_all(&out, b"\\\n", b"\\$()\n");
    if out.ends_with(b"\\") {
        out.extend_from_slice(b"$()");
    }
    out
}

/// As `escape_definition`, but also doubles every `$` first so the body
/// expands back to exactly `text`.
pub fn escape_verbatim(text: &[u8]) -> Vec<u8> {
    escape_definition(&replace_all(text, b"$", b"$$"))
}

/// `escape_definition` for UTF-8 text. Replacements are ASCII, so the
/// result stays valid UTF-8.
pub fn escape_string(text: &str) -> String {
    String::from_utf8_lossy(&escape_definition(text.as_bytes())).into_owned()
}

/// `escape_verbatim` for UTF-8 text
pub fn fully_escape_string(text: &str) -> String {
    String::from_utf8_lossy(&escape_verbatim(text.as_bytes())).into_owned()
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;

    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }

    out
}
