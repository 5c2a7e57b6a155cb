//! Input reference resolution.
//!
//! Task inputs may reference context variables (`{{mailbox}}`) or fields of
//! prior task outputs (`{{snapshot.output.sha256}}`). A placeholder that is
//! the entire string keeps the referenced JSON type; placeholders embedded in
//! longer strings interpolate their stringified value. Unresolved references
//! are a hard error — a reference nobody produced is a definition bug, and
//! passing it through verbatim would hand connectors a template string.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::ResolveError;

/// Resolve every reference in a task's input mapping.
pub fn resolve_inputs(
    inputs: &Map<String, Value>,
    context: &Map<String, Value>,
    results: &HashMap<String, Value>,
) -> Result<Map<String, Value>, ResolveError> {
    let mut resolved = Map::new();
    for (key, value) in inputs {
        resolved.insert(key.clone(), resolve_value(value, context, results)?);
    }
    Ok(resolved)
}

fn resolve_value(
    value: &Value,
    context: &Map<String, Value>,
    results: &HashMap<String, Value>,
) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) => resolve_string(s, context, results),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, context, results))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, context, results)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    s: &str,
    context: &Map<String, Value>,
    results: &HashMap<String, Value>,
) -> Result<Value, ResolveError> {
    // Whole-string placeholder: preserve the referenced type.
    let trimmed = s.trim();
    if let Some(reference) = single_placeholder(trimmed) {
        return lookup(reference, context, results);
    }

    // Interpolation: replace each placeholder with its stringified value.
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        let Some(close_rel) = rest[open + 2..].find("}}") else {
            // Unbalanced braces are literal text, not a reference.
            break;
        };
        out.push_str(&rest[..open]);
        let reference = rest[open + 2..open + 2 + close_rel].trim();
        let value = lookup(reference, context, results)?;
        out.push_str(&stringify(&value));
        rest = &rest[open + 2 + close_rel + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Returns the inner reference if the whole string is exactly one
/// `{{…}}` placeholder.
fn single_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Look up a reference. Two forms exist:
/// `name` — a context variable; `task.output.field[.field…]` — a field path
/// into a prior task's output.
fn lookup(
    reference: &str,
    context: &Map<String, Value>,
    results: &HashMap<String, Value>,
) -> Result<Value, ResolveError> {
    let unresolved = || ResolveError::UnresolvedReference {
        reference: reference.to_string(),
    };

    let mut parts = reference.split('.');
    let head = parts.next().filter(|p| !p.is_empty()).ok_or_else(unresolved)?;

    match parts.next() {
        None => context.get(head).cloned().ok_or_else(unresolved),
        Some("output") => {
            let mut current = results.get(head).ok_or_else(unresolved)?;
            for field in parts {
                current = current.get(field).ok_or_else(unresolved)?;
            }
            Ok(current.clone())
        }
        Some(_) => Err(unresolved()),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
