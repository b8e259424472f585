// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration dispatch: webhook matching, variable extraction and
//! task seeding.
//!
//! Matching and extraction are pure functions of the request; the only
//! state they touch is what the caller hands them. Key paths into JSON
//! bodies use dotted notation with `[i]` for array indices
//! (`nested.items.[0].c`). XML bodies are converted to a JSON value
//! first and share the same path grammar.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::model::{
    BodyDataType, Integration, IntegrationExtractValue, IntegrationMatcher, MatchMethod,
    MatcherType, Task, ValueSource, VariableType,
};

/// Case-insensitive header lookup.
pub fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

// ============================================================================
// Matching
// ============================================================================

/// Evaluate a single matcher against a request. A whole integration
/// fires iff every matcher returns true.
pub fn matches(matcher: &IntegrationMatcher, headers: &[(String, String)], body: &[u8]) -> bool {
    let actual = match matcher.match_type {
        MatcherType::Header => header_get(headers, &matcher.key).map(str::to_string),
        MatcherType::Body => body_value(matcher.body_data_type, &matcher.key, body),
    };

    match actual {
        Some(actual) => compare(matcher.method, &matcher.value, &actual),
        None => false,
    }
}

/// True iff every matcher in the slice matches.
pub fn matches_all(
    matchers: &[IntegrationMatcher],
    headers: &[(String, String)],
    body: &[u8],
) -> bool {
    matchers.iter().all(|m| matches(m, headers, body))
}

fn compare(method: MatchMethod, expected: &str, actual: &str) -> bool {
    match method {
        MatchMethod::Equals => actual == expected,
        MatchMethod::Contains => actual.contains(expected),
        MatchMethod::BeginsWith => actual.starts_with(expected),
        MatchMethod::EndsWith => actual.ends_with(expected),
        MatchMethod::Regex => match regex::Regex::new(expected) {
            Ok(re) => re.is_match(actual),
            Err(e) => {
                warn!(pattern = expected, error = %e, "invalid matcher regex");
                false
            }
        },
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Derive variables from a request. Purely a function of its
/// arguments; calling twice yields identical maps. Variables whose
/// source value is missing or JSON `null` produce no entry.
pub fn extract(
    values: &[IntegrationExtractValue],
    headers: &[(String, String)],
    body: &[u8],
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for value in values {
        if let Some(extracted) = extract_one(value, headers, body) {
            out.insert(value.variable.clone(), extracted);
        }
    }
    out
}

fn extract_one(
    value: &IntegrationExtractValue,
    headers: &[(String, String)],
    body: &[u8],
) -> Option<String> {
    match value.value_source {
        ValueSource::Header => header_get(headers, &value.key).map(str::to_string),
        ValueSource::Body => body_value(value.body_data_type, &value.key, body),
    }
}

/// Designated body value as a string, per the body data type.
fn body_value(data_type: BodyDataType, key: &str, body: &[u8]) -> Option<String> {
    match data_type {
        // String mode: the raw body is the value, key ignored.
        BodyDataType::String => Some(String::from_utf8_lossy(body).into_owned()),
        BodyDataType::Json => {
            let parsed: Value = serde_json::from_slice(body).ok()?;
            format_value(lookup_path(&parsed, key)?)
        }
        BodyDataType::Xml => {
            let parsed = xml_to_value(body)?;
            format_value(lookup_path(&parsed, key)?)
        }
    }
}

/// Descend a dotted key path with `[i]` array indices. Both
/// `items.[0].c` and `items[0].c` forms are accepted.
fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }

        let (key, indices) = split_indices(segment);
        if !key.is_empty() {
            current = current.as_object()?.get(key)?;
        }
        for index in indices {
            current = current.as_array()?.get(index)?;
        }
    }
    Some(current)
}

/// Split `items[0][1]` into `("items", [0, 1])`; a bare `[0]` segment
/// yields an empty key.
fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    let Some(bracket) = segment.find('[') else {
        return (segment, Vec::new());
    };

    let (key, rest) = segment.split_at(bracket);
    let indices = rest
        .split(['[', ']'])
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    (key, indices)
}

/// String form of a JSON node. `null` yields no value; scalars are
/// plainly formatted; objects and arrays use the generic serializer.
fn format_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => serde_json::to_string(other).ok(),
    }
}

// ============================================================================
// XML bodies
// ============================================================================

/// Best-effort XML → JSON conversion sharing the JSON path grammar.
/// Child elements become object keys (repeated names coalesce into
/// arrays), attributes become `@name` keys, and an element holding
/// both attributes and text exposes the text under `#text`. The root
/// element's content is returned directly, so paths do not name it.
fn xml_to_value(body: &[u8]) -> Option<Value> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(body);
    let config = reader.config_mut();
    config.trim_text(true);

    // Parent frames: (element name, accumulated children, text so far).
    let mut stack: Vec<(String, serde_json::Map<String, Value>, String)> = Vec::new();
    let mut root: Option<Value> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut map = serde_json::Map::new();
                for attr in start.attributes().flatten() {
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    map.insert(key, Value::String(value));
                }
                stack.push((name, map, String::new()));
            }
            Ok(Event::Empty(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut map = serde_json::Map::new();
                for attr in start.attributes().flatten() {
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    map.insert(key, Value::String(value));
                }
                let value = if map.is_empty() {
                    Value::String(String::new())
                } else {
                    Value::Object(map)
                };
                attach(&mut stack, &mut root, name, value)?;
            }
            Ok(Event::Text(text)) => {
                if let Some((_, _, buffer)) = stack.last_mut() {
                    buffer.push_str(&text.unescape().ok()?);
                }
            }
            Ok(Event::End(_)) => {
                let (name, mut map, text) = stack.pop()?;
                let value = if map.is_empty() {
                    Value::String(text)
                } else {
                    if !text.is_empty() {
                        map.insert("#text".to_string(), Value::String(text));
                    }
                    Value::Object(map)
                };
                attach(&mut stack, &mut root, name, value)?;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    root
}

/// Attach a finished element to its parent frame, coalescing repeated
/// names into arrays, or install it as the root.
fn attach(
    stack: &mut [(String, serde_json::Map<String, Value>, String)],
    root: &mut Option<Value>,
    name: String,
    value: Value,
) -> Option<()> {
    match stack.last_mut() {
        Some((_, parent, _)) => {
            match parent.remove(&name) {
                Some(Value::Array(mut items)) => {
                    items.push(value);
                    parent.insert(name, Value::Array(items));
                }
                Some(existing) => {
                    parent.insert(name, Value::Array(vec![existing, value]));
                }
                None => {
                    parent.insert(name, value);
                }
            }
            Some(())
        }
        None => {
            *root = Some(value);
            Some(())
        }
    }
}

// ============================================================================
// Task seeding
// ============================================================================

/// Materialize a task for a fired integration. Extracted values fill
/// the task's environment and parameter map; entries already present
/// in the task definition win.
pub fn seed_task(
    integration: &Integration,
    values: &[IntegrationExtractValue],
    headers: &[(String, String)],
    body: &[u8],
) -> Result<Task> {
    let mut task = match &integration.task_params {
        Some(params) => params.to_task(integration.project_id, integration.template_id),
        None => Task::new(integration.project_id, integration.template_id),
    };
    task.integration_id = Some(integration.id);

    let mut env_vars = BTreeMap::new();
    let mut param_vars = BTreeMap::new();
    for value in values {
        if let Some(extracted) = extract_one(value, headers, body) {
            match value.variable_type {
                VariableType::Environment => env_vars.insert(value.variable.clone(), extracted),
                VariableType::TaskParam => param_vars.insert(value.variable.clone(), extracted),
            };
        }
    }

    if !env_vars.is_empty() {
        task.environment = Some(merge_environment(task.environment.as_deref(), &env_vars)?);
    }

    if !param_vars.is_empty() {
        let mut params = match task.params {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(CoreError::Config {
                    what: "task params".to_string(),
                    details: format!("expected an object, got {}", other),
                })
            }
        };
        for (key, value) in param_vars {
            params.entry(key).or_insert(Value::String(value));
        }
        task.params = Value::Object(params);
    }

    Ok(task)
}

/// Merge extracted variables into an environment JSON object. Task
/// definition entries win; extracted entries fill only absent keys.
fn merge_environment(
    existing: Option<&str>,
    extracted: &BTreeMap<String, String>,
) -> Result<String> {
    let mut env: serde_json::Map<String, Value> = match existing {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(raw).map_err(|e| CoreError::Config {
                what: "environment".to_string(),
                details: e.to_string(),
            })?
        }
        _ => serde_json::Map::new(),
    };

    for (key, value) in extracted {
        env.entry(key.clone())
            .or_insert_with(|| Value::String(value.clone()));
    }

    serde_json::to_string(&env).map_err(CoreError::from)
}
