//! Run state: the ordered key/value map accumulated across one workflow run.
//!
//! Keys prefixed with `__` are internal (`__status__`, `__user_input__<id>`,
//! `__output__`) and hidden from the condition evaluator's expression
//! environment, but still visible to templates and downstream state
//! inspection.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A run-state value. This is exactly the tagged variant called for by the
/// specification (`Null | Bool | Number | String | Array | Object`) — which
/// is precisely what `serde_json::Value` already is.
pub type Value = serde_json::Value;

/// Ordered key/value map scoped to one run.
///
/// Insertion order is preserved (backed by [`indexmap::IndexMap`]) because
/// the `output` node's default rendering concatenates non-internal values
/// "in key-sorted order" while other call sites (declaration order for
/// topological sort, for example) rely on stable iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState(IndexMap<String, Value>);

impl RunState {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// All non-internal key/value pairs, in key-sorted order. Used by the
    /// `output` node's default rendering and by the workflow service when it
    /// assembles the final `RunResult`.
    pub fn non_internal_sorted(&self) -> Vec<(&String, &Value)> {
        let mut entries: Vec<_> = self.0.iter().filter(|(k, _)| !is_internal_key(k)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// A plain `serde_json::Map` snapshot of every key, for serializing into
    /// the SSE `done` frame's `state` field.
    pub fn to_json_map(&self) -> serde_json::Map<String, Value> {
        self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn user_input_key(node_id: &str) -> String {
        format!("__user_input__{node_id}")
    }

    pub fn status_key() -> &'static str {
        "__status__"
    }

    pub fn output_key() -> &'static str {
        "__output__"
    }
}

/// `__`-prefixed keys are internal and hidden from the condition evaluator's
/// expression environment.
pub fn is_internal_key(key: &str) -> bool {
    key.starts_with("__")
}

/// Truthiness coercion used by the condition evaluator and by `branch`
/// nodes: `nil -> false`; `bool -> itself`; `number -> != 0`;
/// `string -> non-empty`; anything else (array, object) -> `true`.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness_rules() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(false)));
        assert!(truthy(&json!(true)));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!(1)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!({})));
    }

    #[test]
    fn internal_keys_are_hidden() {
        assert!(is_internal_key("__status__"));
        assert!(is_internal_key("__user_input__node1"));
        assert!(!is_internal_key("node1"));
    }

    #[test]
    fn non_internal_sorted_excludes_internal_and_sorts() {
        let mut state = RunState::new();
        state.insert("b", json!(1));
        state.insert("__status__", json!("x"));
        state.insert("a", json!(2));
        let entries = state.non_internal_sorted();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
