//! Template substitution for node configuration
//!
//! Rewrites `{{label.field}}` and `{{nodeId.field}}` markers using the outputs
//! accumulated so far in a run. Unresolvable markers are left in place so the
//! processor (or the user) can see exactly what was missing.

use regex::{Captures, Regex};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("template marker pattern"));

/// Walk a dotted path into a node output
///
/// `output` as the first segment addresses the whole value unless the value is
/// an object with its own `output` key. Numeric segments index arrays.
pub fn resolve_output_path<'a>(output: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = output;
    for (position, segment) in path.split('.').filter(|s| !s.is_empty()).enumerate() {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(value) => value,
                None if position == 0 && segment == "output" => current,
                None => return None,
            },
            Value::Array(items) => match segment.parse::<usize>() {
                Ok(index) => items.get(index)?,
                Err(_) if position == 0 && segment == "output" => current,
                Err(_) => return None,
            },
            _ if position == 0 && segment == "output" => current,
            _ => return None,
        };
    }
    Some(current)
}

/// Render a value the way it should appear inside a string
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute every marker in `template`
///
/// A marker's first segment is looked up as a label first, then as a node id.
/// Strings without markers come back borrowed and unchanged.
pub fn substitute<'t>(
    template: &'t str,
    outputs: &BTreeMap<String, Value>,
    labels: &HashMap<String, String>,
) -> Cow<'t, str> {
    if !template.contains("{{") {
        return Cow::Borrowed(template);
    }
    MARKER.replace_all(template, |caps: &Captures| {
        let expression = &caps[1];
        let (head, path) = expression.split_once('.').unwrap_or((expression, "output"));
        let node_id = labels.get(head).map(String::as_str).unwrap_or(head);

        match outputs.get(node_id).and_then(|output| resolve_output_path(output, path)) {
            Some(value) => stringify(value),
            None => {
                tracing::debug!("🧩 Unresolved template marker: {}", &caps[0]);
                caps[0].to_string()
            }
        }
    })
}

/// Substitute markers in every string inside a JSON config
pub fn substitute_value(
    config: &Value,
    outputs: &BTreeMap<String, Value>,
    labels: &HashMap<String, String>,
) -> Value {
    match config {
        Value::String(s) => Value::String(substitute(s, outputs, labels).into_owned()),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, outputs, labels))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), substitute_value(value, outputs, labels)))
                .collect(),
        ),
        other => other.clone(),
    }
}
