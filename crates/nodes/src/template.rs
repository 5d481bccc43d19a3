//! `{{ expr }}` template rendering.
//!
//! Placeholders may contain nested braces (object literals) and quoted
//! strings containing braces. A placeholder whose expression fails is left in
//! the output verbatim and logged; rendering itself never fails.

use serde_json::{Map, Value};
use tracing::warn;

use crate::expression::{self, to_display_string};

/// A located `{{ ... }}` placeholder: byte range of the whole placeholder and
/// of the inner expression text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    start: usize,
    end: usize,
    inner_start: usize,
    inner_end: usize,
}

/// Find the placeholder opening at or after `from`.
///
/// The closing `}}` is the first one outside nested braces and quotes; when
/// those never balance it is the first `}}` at all.
fn next_placeholder(src: &str, from: usize) -> Option<Placeholder> {
    let bytes = src.as_bytes();
    let start = from + src[from..].find("{{")?;
    let inner_start = start + 2;
    let mut depth = 0usize;
    let mut i = inner_start;

    while i < bytes.len() {
        match bytes[i] {
            q @ (b'"' | b'\'' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != q {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'{' => depth += 1,
            b'}' if depth > 0 => depth -= 1,
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                return Some(Placeholder { start, end: i + 2, inner_start, inner_end: i });
            }
            _ => {}
        }
        i += 1;
    }

    // Unbalanced braces or an open quote: close at the first `}}`.
    let inner_end = inner_start + src[inner_start..].find("}}")?;
    Some(Placeholder { start, end: inner_end + 2, inner_start, inner_end })
}

/// Whether `src` is exactly one placeholder (ignoring surrounding whitespace).
/// Returns the inner expression when it is.
pub fn sole_expression(src: &str) -> Option<&str> {
    let trimmed = src.trim();
    let offset = src.len() - src.trim_start().len();
    let p = next_placeholder(src, offset)?;
    (p.start == offset && p.end == offset + trimmed.len()).then(|| src[p.inner_start..p.inner_end].trim())
}

/// Whether `src` contains at least one complete placeholder.
pub fn has_placeholders(src: &str) -> bool {
    next_placeholder(src, 0).is_some()
}

/// Render `src` against `scope`.
pub fn render(src: &str, scope: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(src.len());
    let mut cursor = 0;

    while let Some(p) = next_placeholder(src, cursor) {
        out.push_str(&src[cursor..p.start]);
        let expr = src[p.inner_start..p.inner_end].trim();
        match expression::evaluate(expr, scope) {
            Ok(value) => out.push_str(&to_display_string(&value)),
            Err(e) => {
                warn!(expression = expr, error = %e, "template placeholder failed; left unrendered");
                out.push_str(&src[p.start..p.end]);
            }
        }
        cursor = p.end;
    }

    out.push_str(&src[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Map<String, Value> {
        json!({ "name": "Ann", "items": [1, 2, 3], "user": { "b": 2, "a": 1 }, "none": null })
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn renders_names_and_lengths() {
        assert_eq!(
            render("Hello {{ name }}, {{ items.length }} items", &scope()),
            "Hello Ann, 3 items"
        );
    }

    #[test]
    fn failing_placeholder_is_left_verbatim() {
        assert_eq!(
            render("Hi {{ name }} {{ nope.x }} {{ 1 + }}!", &scope()),
            "Hi Ann {{ nope.x }} {{ 1 + }}!"
        );
    }

    #[test]
    fn nested_braces_in_object_literal() {
        assert_eq!(render("{{ { k: name } }}", &scope()), r#"{"k":"Ann"}"#);
    }

    #[test]
    fn objects_render_as_canonical_json() {
        assert_eq!(render("{{ user }}", &scope()), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn null_renders_empty() {
        assert_eq!(render("[{{ none }}]", &scope()), "[]");
    }

    #[test]
    fn braces_inside_strings_do_not_close() {
        assert_eq!(render("{{ '}}' + name }}", &scope()), "}}Ann");
    }

    #[test]
    fn unterminated_placeholder_is_kept() {
        assert_eq!(render("a {{ name", &scope()), "a {{ name");
    }

    #[test]
    fn unbalanced_brace_does_not_swallow_later_placeholders() {
        assert_eq!(render("{{ x{ }} and {{ name }}", &scope()), "{{ x{ }} and Ann");
        assert_eq!(render("{{ 'open }} then {{ name }}", &scope()), "{{ 'open }} then Ann");
    }

    #[test]
    fn sole_expression_detection() {
        assert_eq!(sole_expression("  {{ items }} "), Some("items"));
        assert_eq!(sole_expression("x {{ items }}"), None);
        assert_eq!(sole_expression("{{ a }}{{ b }}"), None);
    }
}
