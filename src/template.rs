use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Replaces `{{name}}` with `variables["name"]` in one pass. Unknown names are
/// left as written; substituted text is never scanned again.
pub fn interpolate(template: &str, variables: &BTreeMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match variables.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Interpolates every string leaf of a JSON document (keys untouched).
pub fn interpolate_json(value: &Value, variables: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate(s, variables)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_json(item, variables))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_json(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}
