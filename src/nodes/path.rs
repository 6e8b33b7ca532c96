/// Dotted-path access and `{{path}}` templating over JSON values
///
/// Shared by the transform, conditional and webhook-response nodes.

use serde_json::{Map, Value};

/// Look up `a.b.0.c`. Numeric segments index into arrays.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// Intermediate scalars are replaced by objects. Returns false for an empty path.
pub fn set(root: &mut Value, path: &str, value: Value) -> bool {
    let keys: Vec<&str> = path.split('.').filter(|k| !k.is_empty()).collect();
    let Some((last, parents)) = keys.split_last() else {
        return false;
    };

    let mut current = root;
    for key in parents {
        current = match object_entry(current, key) {
            Some(next) => next,
            None => return false,
        };
    }
    match ensure_object(current) {
        Some(map) => {
            map.insert((*last).to_string(), value);
            true
        }
        None => false,
    }
}

/// Remove the value at `path`, returning it
pub fn delete(root: &mut Value, path: &str) -> Option<Value> {
    let keys: Vec<&str> = path.split('.').filter(|k| !k.is_empty()).collect();
    let (last, parents) = keys.split_last()?;

    let mut current = root;
    for key in parents {
        current = current.as_object_mut()?.get_mut(*key)?;
    }
    current.as_object_mut()?.remove(*last)
}

/// Resolve `{{path}}` placeholders against `scope`.
///
/// A string that is exactly one placeholder resolves to the referenced value
/// with its type intact. Placeholders embedded in longer strings are
/// substituted textually; unknown paths are left as written. Arrays and
/// objects are rendered recursively.
pub fn render(template: &Value, scope: &Value) -> Value {
    match template {
        Value::String(text) => render_str(text, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_str(text: &str, scope: &Value) -> Value {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("{{").and_then(|t| t.strip_suffix("}}")) {
        if !inner.contains("{{") {
            if let Some(value) = get(scope, inner) {
                return value.clone();
            }
            return Value::String(text.to_string());
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let inner = &rest[start + 2..start + 2 + len];
        out.push_str(&rest[..start]);
        match get(scope, inner) {
            Some(Value::String(s)) => out.push_str(s),
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str(&rest[start..start + 4 + len]),
        }
        rest = &rest[start + 4 + len..];
    }
    out.push_str(rest);
    Value::String(out)
}

fn ensure_object(value: &mut Value) -> Option<&mut Map<String, Value>> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut()
}

fn object_entry<'a>(value: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    let entry = ensure_object(value)?
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    Some(entry)
}
