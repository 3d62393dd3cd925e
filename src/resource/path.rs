//! Result path expressions
//!
//! A small JSON path dialect for projecting provider responses:
//!
//! - `Certificates` - field access
//! - `Reservations[].Instances[]` - flatten projection
//! - `Items[0].Name` - array index
//!
//! Field access on a projection maps over its elements and drops misses.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Flatten,
    Index(usize),
}

enum Current {
    Single(Value),
    Projected(Vec<Value>),
}

fn parse(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();

    for part in path.split('.').filter(|p| !p.is_empty()) {
        let (name, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !name.is_empty() {
            segments.push(Segment::Field(name.to_string()));
        }
        while let Some(end) = rest.find(']') {
            let inner = &rest[1..end];
            if inner.is_empty() {
                segments.push(Segment::Flatten);
            } else if let Ok(idx) = inner.parse::<usize>() {
                segments.push(Segment::Index(idx));
            }
            rest = &rest[end + 1..];
        }
    }

    segments
}

/// Evaluate `path` against `data`; `Value::Null` when nothing matches
pub fn search(data: &Value, path: &str) -> Value {
    let mut current = Current::Single(data.clone());

    for segment in parse(path) {
        current = match (current, segment) {
            (Current::Single(v), Segment::Field(name)) => {
                Current::Single(v.get(&name).cloned().unwrap_or(Value::Null))
            }
            (Current::Single(v), Segment::Index(idx)) => {
                Current::Single(v.get(idx).cloned().unwrap_or(Value::Null))
            }
            (Current::Single(Value::Array(items)), Segment::Flatten) => Current::Projected(items),
            (Current::Single(_), Segment::Flatten) => Current::Single(Value::Null),
            (Current::Projected(items), Segment::Field(name)) => Current::Projected(
                items
                    .iter()
                    .filter_map(|item| item.get(&name).cloned())
                    .filter(|v| !v.is_null())
                    .collect(),
            ),
            (Current::Projected(items), Segment::Index(idx)) => Current::Projected(
                items
                    .iter()
                    .filter_map(|item| item.get(idx).cloned())
                    .collect(),
            ),
            (Current::Projected(items), Segment::Flatten) => {
                let mut flat = Vec::new();
                for item in items {
                    match item {
                        Value::Array(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                Current::Projected(flat)
            }
        };
    }

    match current {
        Current::Single(v) => v,
        Current::Projected(items) => Value::Array(items),
    }
}

/// Project a response into a list of records
///
/// A missing match yields an empty list; a lone object becomes one record.
pub fn search_items(data: &Value, path: Option<&str>) -> Vec<Value> {
    let found = match path {
        Some(p) if !p.is_empty() => search(data, p),
        _ => data.clone(),
    };

    match found {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Read a string-ish value at `path`
pub fn search_str(data: &Value, path: &str) -> Option<String> {
    match search(data, path) {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
