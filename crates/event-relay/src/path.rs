// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Path-based reads and writes over nested JSON structures.
//!
//! A [`Path`] is parsed once from a delimited string (`"context.page.url"`) or built from
//! pre-split segments, and can then be reused for any number of lookups. Reads never fail:
//! [`get`] reports absence with `None` and [`get_or`] substitutes a default. Only *absence*
//! triggers the default, so present values such as `""`, `0`, `false` or `null` are returned
//! as they are.
//!
//! # Example
//!
//! ```
//! use event_relay::path::{self, Path};
//! use serde_json::json;
//!
//! let mut payload = json!({});
//! let url = Path::parse("context.page.url");
//! path::set(&mut payload, &url, json!("https://example.com"));
//!
//! assert_eq!(path::get(&payload, &url), Some(&json!("https://example.com")));
//! assert_eq!(path::get_or(&payload, &Path::parse("context.ip"), json!("n/a")), json!("n/a"));
//! ```

use serde_json::{Map, Value};
use std::fmt;

use crate::errors::PathError;

/// Delimiter used when a path is parsed from a string without an explicit separator.
pub const DEFAULT_DELIMITER: char = '.';

/// A segment ending with this marker is joined with the next one, keeping the delimiter.
const ESCAPE_MARKER: char = '\\';

/// Location of a value inside a nested keyed structure. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    segments: Vec<String>,
    // Whole input text, used to match top-level keys that contain the delimiter.
    raw: Option<String>,
    delimiter: char,
}

impl Path {
    /// Parses a `.` delimited path.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self::parse_with(raw, DEFAULT_DELIMITER)
    }

    /// Parses a path delimited by `delimiter`. Splitting a string always yields at least one
    /// segment, so this cannot fail.
    #[must_use]
    pub fn parse_with(raw: &str, delimiter: char) -> Self {
        Self {
            segments: merge_escaped(raw.split(delimiter), delimiter),
            raw: Some(raw.to_string()),
            delimiter,
        }
    }

    /// Builds a path from segments that were split beforehand.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = segments.into_iter().map(Into::into).collect();
        if parts.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(Self {
            segments: merge_escaped(parts, DEFAULT_DELIMITER),
            raw: None,
            delimiter: DEFAULT_DELIMITER,
        })
    }

    /// Returns a new path with `segment` appended verbatim. The segment is not split, so
    /// keys containing the delimiter stay intact.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self {
            segments,
            raw: None,
            delimiter: self.delimiter,
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[must_use]
    pub fn delimiter(&self) -> char {
        self.delimiter
    }
}

impl From<&str> for Path {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for Path {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<usize> for Path {
    fn from(index: usize) -> Self {
        Self::parse(&index.to_string())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(raw) = &self.raw {
            return f.write_str(raw);
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", self.delimiter)?;
            }
            let escaped = segment.replace(
                self.delimiter,
                &format!("{ESCAPE_MARKER}{}", self.delimiter),
            );
            f.write_str(&escaped)?;
        }
        Ok(())
    }
}

fn merge_escaped<I, S>(parts: I, delimiter: char) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut segments = Vec::new();
    let mut pending: Option<String> = None;

    for part in parts {
        let part = part.into();
        let mut segment = match pending.take() {
            Some(mut prefix) => {
                prefix.push(delimiter);
                prefix.push_str(&part);
                prefix
            }
            None => part,
        };
        if segment.ends_with(ESCAPE_MARKER) {
            segment.pop();
            pending = Some(segment);
        } else {
            segments.push(segment);
        }
    }

    // A trailing escape keeps a literal delimiter with nothing after it.
    if let Some(mut rest) = pending {
        rest.push(delimiter);
        segments.push(rest);
    }
    segments
}

/// Options accepted by [`get_or`] and [`lookup`].
///
/// Converts from a bare default value, or from an options object such as
/// `{"default": "unknown", "separator": "/"}` in which case the nested `default` field is
/// the effective default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetOptions {
    pub default: Option<Value>,
    pub separator: Option<char>,
}

impl GetOptions {
    #[must_use]
    pub fn with_default(default: Value) -> Self {
        Self {
            default: Some(default),
            separator: None,
        }
    }
}

impl From<Value> for GetOptions {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(mut options) if options.contains_key("default") => {
                let separator = options
                    .get("separator")
                    .and_then(Value::as_str)
                    .and_then(|s| s.chars().next());
                Self {
                    default: options.remove("default"),
                    separator,
                }
            }
            bare => Self::with_default(bare),
        }
    }
}

impl From<Option<Value>> for GetOptions {
    fn from(default: Option<Value>) -> Self {
        Self {
            default,
            separator: None,
        }
    }
}

fn is_traversable(node: &Value) -> bool {
    matches!(node, Value::Object(_) | Value::Array(_))
}

fn child<'a>(node: &'a Value, key: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    }
}

/// Resolves `path` against `target`. Returns `None` when any segment is absent or when a
/// non-structure is reached before the last segment.
#[must_use]
pub fn get<'a>(target: &'a Value, path: &Path) -> Option<&'a Value> {
    if !is_traversable(target) {
        return None;
    }
    if let Some(found) = path.raw.as_deref().and_then(|raw| child(target, raw)) {
        return Some(found);
    }

    let segments = &path.segments;
    let mut current = target;
    let mut idx = 0;

    while idx < segments.len() {
        if !is_traversable(current) {
            return None;
        }
        if let Some(next) = child(current, &segments[idx]) {
            current = next;
            idx += 1;
            continue;
        }

        // Keys may themselves contain the delimiter: try progressively longer joins.
        let mut joined = segments[idx].clone();
        let mut found = None;
        for (n, segment) in segments.iter().enumerate().skip(idx + 1) {
            joined.push(path.delimiter);
            joined.push_str(segment);
            if let Some(next) = child(current, &joined) {
                found = Some((next, n + 1));
                break;
            }
        }
        let (next, next_idx) = found?;
        current = next;
        idx = next_idx;
    }

    Some(current)
}

/// Resolves `path` and clones the value, falling back to the effective default on a miss.
/// Without a default a miss yields `Value::Null`.
pub fn get_or(target: &Value, path: &Path, options: impl Into<GetOptions>) -> Value {
    let options = options.into();
    match get(target, path) {
        Some(value) => value.clone(),
        None => options.default.unwrap_or(Value::Null),
    }
}

/// Parses `raw` with the separator from `options` and resolves it like [`get_or`].
pub fn lookup(target: &Value, raw: &str, options: impl Into<GetOptions>) -> Value {
    let options = options.into();
    let path = Path::parse_with(raw, options.separator.unwrap_or(DEFAULT_DELIMITER));
    get_or(target, &path, options)
}

/// Writes `value` at `path`, creating intermediate objects as needed.
///
/// Missing intermediate nodes and nodes that are not structures are replaced by empty
/// objects. Arrays are walked by index when the segment is numeric (padding with `null`).
/// A top-level key equal to the whole raw path is written in place, mirroring [`get`].
pub fn set(target: &mut Value, path: &Path, value: Value) {
    if let (Some(raw), Value::Object(map)) = (path.raw.as_deref(), &mut *target) {
        if let Some(slot) = map.get_mut(raw) {
            *slot = value;
            return;
        }
    }

    let Some((last, parents)) = path.segments.split_last() else {
        return;
    };

    let mut current = target;
    for segment in parents {
        let next = slot_mut(current, segment);
        if !is_traversable(next) {
            *next = Value::Object(Map::new());
        }
        current = next;
    }
    *slot_mut(current, last) = value;
}

fn slot_mut<'a>(node: &'a mut Value, segment: &str) -> &'a mut Value {
    match (node, segment.parse::<usize>()) {
        (Value::Array(items), Ok(index)) => {
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            &mut items[index]
        }
        (node, _) => object_slot(node, segment),
    }
}

fn object_slot<'a>(node: &'a mut Value, key: &str) -> &'a mut Value {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map.entry(key.to_owned()).or_insert(Value::Null),
        other => other,
    }
}
