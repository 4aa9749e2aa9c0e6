//! ABOUTME: JSONPath-lite: dotted/bracket path get/set used for stage data-flow mapping (spec §4.5)
//! ABOUTME: Never throws on a missing read; `set` auto-vivifies intermediate objects/arrays

use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path contains unsupported brace characters: {0}")]
    BraceNotAllowed(String),
    #[error("unbalanced bracket in path: {0}")]
    UnbalancedBracket(String),
    #[error("closing bracket without a matching opener: {0}")]
    UnmatchedCloseBracket(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
    Filter { field: String, value: String },
}

/// Rejects paths with `{`/`}`, unbalanced brackets, or a stray `]` (spec §4.5).
pub fn validate_path(path: &str) -> Result<(), PathError> {
    if path.contains('{') || path.contains('}') {
        return Err(PathError::BraceNotAllowed(path.to_string()));
    }
    let mut depth: i32 = 0;
    for ch in path.chars() {
        match ch {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(PathError::UnmatchedCloseBracket(path.to_string()));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PathError::UnbalancedBracket(path.to_string()));
    }
    Ok(())
}

fn strip_root(path: &str) -> &str {
    let trimmed = path.trim();
    if let Some(rest) = trimmed.strip_prefix("$.") {
        return rest;
    }
    if trimmed == "$" {
        return "";
    }
    if let Some(rest) = trimmed.strip_prefix("root.") {
        return rest;
    }
    if trimmed == "root" {
        return "";
    }
    trimmed
}

fn parse_bracket_content(content: &str) -> Segment {
    let content = content.trim();
    if let Some(filter) = content.strip_prefix("?(").and_then(|s| s.strip_suffix(")")) {
        let filter = filter.trim_start_matches('@').trim_start_matches('.');
        if let Some((field, value)) = filter.split_once("==") {
            let field = field.trim().to_string();
            let value = value
                .trim()
                .trim_matches('\'')
                .trim_matches('"')
                .to_string();
            return Segment::Filter { field, value };
        }
        return Segment::Field(content.to_string());
    }
    if let Ok(index) = content.parse::<usize>() {
        return Segment::Index(index);
    }
    Segment::Field(content.trim_matches('\'').trim_matches('"').to_string())
}

fn parse_segments(path: &str) -> Vec<Segment> {
    let body = strip_root(path);
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = body.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if !current.is_empty() {
                    segments.push(Segment::Field(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Field(std::mem::take(&mut current)));
                }
                let mut bracket = String::new();
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    bracket.push(inner);
                }
                segments.push(parse_bracket_content(&bracket));
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Field(current));
    }
    segments
}

/// Extract a value by path; returns `None` (JSONPath `undefined`) the
/// moment any intermediate segment is missing or null. Never panics.
pub fn get_value_by_path(obj: &Value, path: &str) -> Option<Value> {
    let segments = parse_segments(path);
    let mut current = obj;

    for segment in &segments {
        match segment {
            Segment::Field(name) => match current {
                Value::Object(map) => current = map.get(name)?,
                _ => return None,
            },
            Segment::Index(i) => match current {
                Value::Array(arr) => current = arr.get(*i)?,
                _ => return None,
            },
            Segment::Filter { field, value } => match current {
                Value::Array(arr) => {
                    let found = arr.iter().find(|item| {
                        item.get(field)
                            .map(|v| value_matches(v, value))
                            .unwrap_or(false)
                    })?;
                    current = found;
                }
                _ => return None,
            },
        }
        if current.is_null() {
            return None;
        }
    }
    Some(current.clone())
}

fn value_matches(v: &Value, expected: &str) -> bool {
    match v {
        Value::String(s) => s == expected,
        Value::Number(n) => n.to_string() == expected,
        Value::Bool(b) => b.to_string() == expected,
        _ => false,
    }
}

/// Returns a copy of `obj` with `value` set at `path`, auto-creating
/// intermediate objects; an index applied against a non-array node turns
/// that node into an array (spec §4.5).
pub fn set_value_by_path(obj: &Value, path: &str, value: Value) -> Value {
    let segments = parse_segments(path);
    let mut root = obj.clone();
    set_recursive(&mut root, &segments, value);
    root
}

fn set_recursive(node: &mut Value, segments: &[Segment], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };

    match head {
        Segment::Field(name) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let map = node.as_object_mut().expect("just coerced to object");
            let entry = map.entry(name.clone()).or_insert(Value::Null);
            if rest.is_empty() {
                *entry = value;
            } else {
                set_recursive(entry, rest, value);
            }
        }
        Segment::Index(i) => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            let arr = node.as_array_mut().expect("just coerced to array");
            while arr.len() <= *i {
                arr.push(Value::Null);
            }
            if rest.is_empty() {
                arr[*i] = value;
            } else {
                set_recursive(&mut arr[*i], rest, value);
            }
        }
        Segment::Filter { field, value: expected } => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            let arr = node.as_array_mut().expect("just coerced to array");
            let found = arr
                .iter()
                .position(|item| item.get(field).map(|v| value_matches(v, expected)).unwrap_or(false));
            let idx = found.unwrap_or_else(|| {
                let mut entry = Map::new();
                entry.insert(field.clone(), Value::String(expected.clone()));
                arr.push(Value::Object(entry));
                arr.len() - 1
            });
            if rest.is_empty() {
                arr[idx] = value;
            } else {
                set_recursive(&mut arr[idx], rest, value);
            }
        }
    }
}

/// Applies `{out_key -> path}` over `source`; a validation failure for one
/// entry maps that key to `null` with a warning, never aborts the batch
/// (spec §4.5).
pub fn apply_output_mapping(source: &Value, mapping: &HashMap<String, String>) -> Map<String, Value> {
    let mut result = Map::new();
    for (out_key, path) in mapping {
        match validate_path(path) {
            Ok(()) => {
                let value = get_value_by_path(source, path).unwrap_or(Value::Null);
                result.insert(out_key.clone(), value);
            }
            Err(err) => {
                tracing::warn!(out_key, path, %err, "invalid data-flow path, mapping to null");
                result.insert(out_key.clone(), Value::Null);
            }
        }
    }
    result
}
