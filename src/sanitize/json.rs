use serde_json::{Map, Value};

use super::html::sanitize_html;
use super::url::{ALLOWED_SCHEMES, is_scriptable, url_scheme};

/// Recursively sanitize every string leaf of a JSON document.
///
/// Object keys, key order, array order and non-string values are preserved.
/// A leaf that reads as a single URL is checked with URL rules (scriptable
/// schemes become `""`, allowed absolute URLs are kept verbatim); every
/// other string goes through [`sanitize_html`].
pub fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_string(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_json).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), sanitize_json(item));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn looks_like_url(s: &str) -> bool {
    let trimmed = s.trim();
    !trimmed.is_empty() && !trimmed.contains(' ')
}

fn sanitize_string(s: &str) -> String {
    if looks_like_url(s) {
        if is_scriptable(s) {
            return String::new();
        }
        let allowed_absolute = url_scheme(s)
            .is_some_and(|scheme| ALLOWED_SCHEMES.contains(&scheme.as_str()));
        if allowed_absolute && !s.contains(['<', '>', '"']) {
            return s.to_string();
        }
    }

    let cleaned = sanitize_html(s);
    if looks_like_url(&cleaned) && is_scriptable(&cleaned) {
        return String::new();
    }
    cleaned
}
