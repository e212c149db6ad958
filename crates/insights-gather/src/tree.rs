// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Path based access to untyped resource trees.
//!
//! Cluster resources are handled as `serde_json::Value` trees. The helpers here
//! locate nested values by key path and fail with [`GatherError::FieldNotFound`]
//! when a segment is missing.

use crate::error::GatherError;
use chrono::{DateTime, Utc};
use serde_json::Value;

fn not_found(path: &[&str]) -> GatherError {
    GatherError::FieldNotFound(path.join("."))
}

/// Returns the value at `path`, or `FieldNotFound` if any segment is missing.
pub fn walk<'a>(tree: &'a Value, path: &[&str]) -> Result<&'a Value, GatherError> {
    let mut current = tree;
    for segment in path {
        current = current.get(*segment).ok_or_else(|| not_found(path))?;
    }
    Ok(current)
}

pub fn walk_mut<'a>(tree: &'a mut Value, path: &[&str]) -> Result<&'a mut Value, GatherError> {
    let mut current = tree;
    for segment in path {
        current = current
            .get_mut(*segment)
            .ok_or_else(|| not_found(path))?;
    }
    Ok(current)
}

pub fn str_at<'a>(tree: &'a Value, path: &[&str]) -> Option<&'a str> {
    walk(tree, path).ok().and_then(Value::as_str)
}

pub fn array_at<'a>(tree: &'a Value, path: &[&str]) -> &'a [Value] {
    walk(tree, path)
        .ok()
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

pub fn i64_at(tree: &Value, path: &[&str]) -> Option<i64> {
    walk(tree, path).ok().and_then(Value::as_i64)
}

pub fn time_at(tree: &Value, path: &[&str]) -> Option<DateTime<Utc>> {
    str_at(tree, path)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|time| time.with_timezone(&Utc))
}

/// Replaces the string at `path` with `f(old)`. The field must exist and be a string.
pub fn replace_string<F>(tree: &mut Value, path: &[&str], f: F) -> Result<(), GatherError>
where
    F: FnOnce(&str) -> String,
{
    let value = walk_mut(tree, path)?;
    match value.as_str() {
        Some(current) => {
            *value = Value::String(f(current));
            Ok(())
        }
        None => Err(GatherError::Anonymization(format!(
            "{} is not a string",
            path.join(".")
        ))),
    }
}

/// Same as [`replace_string`] but a missing or null field is left untouched.
pub fn replace_string_if_present<F>(tree: &mut Value, path: &[&str], f: F)
where
    F: FnOnce(&str) -> String,
{
    if let Ok(value) = walk_mut(tree, path) {
        if let Some(current) = value.as_str() {
            *value = Value::String(f(current));
        }
    }
}

pub fn name(resource: &Value) -> &str {
    str_at(resource, &["metadata", "name"]).unwrap_or_default()
}

pub fn namespace(resource: &Value) -> &str {
    str_at(resource, &["metadata", "namespace"]).unwrap_or_default()
}
