//! `{{ path }}` template interpolation (spec §4.9).

use serde_json::Value as Json;

/// Recursively interpolate `{{ path }}` tokens in `template` against
/// `context`. Whitespace inside the braces is ignored; a missing path
/// renders as an empty string.
pub fn interpolate_str(template: &str, context: &Json) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = find_close(template, i + 2) {
                let path = template[i + 2..end].trim();
                out.push_str(&resolve_path(context, path));
                i = end + 2;
                continue;
            }
        }
        // Safe: we only ever step one byte at a time over ASCII braces;
        // non-brace bytes are copied as-is including multi-byte UTF-8
        // sequences via the char-boundary-respecting slice below.
        let ch_len = template[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
        out.push_str(&template[i..i + ch_len]);
        i += ch_len;
    }
    out
}

fn find_close(template: &str, from: usize) -> Option<usize> {
    template[from..].find("}}").map(|pos| from + pos)
}

fn resolve_path(context: &Json, path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(v) => current = v,
            None => return String::new(),
        }
    }
    json_to_template_string(current)
}

fn json_to_template_string(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Recursively interpolate string leaves of a JSON body/headers structure
/// (spec §4.9: "recursively into objects and arrays").
pub fn interpolate_json(value: &Json, context: &Json) -> Json {
    match value {
        Json::String(s) => Json::String(interpolate_str(s, context)),
        Json::Array(items) => Json::Array(items.iter().map(|v| interpolate_json(v, context)).collect()),
        Json::Object(map) => Json::Object(map.iter().map(|(k, v)| (k.clone(), interpolate_json(v, context))).collect()),
        other => other.clone(),
    }
}
