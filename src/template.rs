//! Template resolver: substitutes `{{key}}` and `{{key.sub}}` tokens in a
//! string from run state. Only the top-level key is looked up — the dotted
//! form is matched syntactically but treated as a single lookup key, per
//! the specification. Unresolved placeholders are left literally so a
//! downstream render doesn't silently swallow a typo.
//!
//! Used uniformly by every node type before any external I/O (LLM calls,
//! tool invocations, notification sends, HTTP polls).

use crate::state::{RunState, Value};

/// Resolves every `{{...}}` token in `template` against `state`.
pub fn resolve(template: &str, state: &RunState) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = find_close(template, i + 2) {
                let key = template[i + 2..end].trim();
                match state.get(key) {
                    Some(value) => {
                        out.push_str(&value_to_string(value));
                    }
                    None => {
                        // Dotted form falls back to a single lookup key; if
                        // the literal key is also absent, leave the
                        // placeholder exactly as written.
                        out.push_str(&template[i..end + 2]);
                    }
                }
                i = end + 2;
                continue;
            }
        }
        let ch = template[i..]
            .chars()
            .next()
            .expect("i < bytes.len() and i is on a char boundary");
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn find_close(s: &str, from: usize) -> Option<usize> {
    s[from..].find("}}").map(|pos| from + pos)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_known_key() {
        let mut s = RunState::new();
        s.insert("name", json!("world"));
        assert_eq!(resolve("hello {{name}}", &s), "hello world");
    }

    #[test]
    fn leaves_unresolved_placeholder_literal() {
        let s = RunState::new();
        assert_eq!(resolve("hello {{missing}}", &s), "hello {{missing}}");
    }

    #[test]
    fn dotted_form_is_single_lookup_key() {
        let mut s = RunState::new();
        s.insert("node1", json!("value"));
        assert_eq!(resolve("{{node1.sub}}", &s), "{{node1.sub}}");
        // falls back to root key only as a last resort when the literal
        // dotted key itself is absent and explicitly requested via the
        // condition evaluator; the template resolver treats it as one key.
    }

    #[test]
    fn idempotent_on_already_resolved_string() {
        let mut s = RunState::new();
        s.insert("x", json!("1"));
        let once = resolve("value={{x}}", &s);
        let twice = resolve(&once, &s);
        assert_eq!(once, twice);
    }

    #[test]
    fn non_string_values_are_stringified() {
        let mut s = RunState::new();
        s.insert("n", json!(42));
        assert_eq!(resolve("{{n}}", &s), "42");
    }

    #[test]
    fn multibyte_literal_text_is_preserved() {
        let mut s = RunState::new();
        s.insert("name", json!("Jose"));
        assert_eq!(resolve("café {{name}} – naïve", &s), "café Jose – naïve");
    }
}
