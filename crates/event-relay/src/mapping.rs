// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Declarative reshaping of source events into collector payloads.
//!
//! A [`MappingTable`] lists destination paths and where their values come from: a literal,
//! a single source path, or an ordered fallback chain of source paths where the first
//! present, non-null value wins. [`PayloadMapper`] selects a table per event from a
//! [`RuleSet`] keyed by the event's discriminant field (its name) and copies the remaining
//! public properties verbatim.
//!
//! Tables and rule sets can be built in code or loaded from JSON:
//!
//! ```json
//! {
//!   "constants": {"direct": true, "entries": {"channel": "s2s"}},
//!   "generic": {"entries": {"userId": ["$user_id", "distinct_id"]}},
//!   "rules": {"$pageview": {"type": "page", "mapping": {"entries": {"name": "properties.name"}}}},
//!   "default": {"type": "track", "mapping": {"entries": {"event": "event"}}}
//! }
//! ```

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::trace;

use crate::errors::MappingError;
use crate::path::{self, Path};

/// Where a destination value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingValue {
    Literal(Value),
    Path(Path),
    Fallback(Vec<Path>),
}

impl MappingValue {
    fn resolve(&self, input: &Value) -> Option<Value> {
        match self {
            Self::Literal(value) => Some(value.clone()),
            Self::Path(source) => path::get(input, source).cloned(),
            Self::Fallback(sources) => sources
                .iter()
                .filter_map(|source| path::get(input, source))
                .find(|value| !value.is_null())
                .cloned(),
        }
    }
}

impl From<&str> for MappingValue {
    fn from(source: &str) -> Self {
        Self::Path(Path::parse(source))
    }
}

impl<const N: usize> From<[&str; N]> for MappingValue {
    fn from(sources: [&str; N]) -> Self {
        Self::Fallback(sources.iter().map(|source| Path::parse(source)).collect())
    }
}

impl From<Vec<&str>> for MappingValue {
    fn from(sources: Vec<&str>) -> Self {
        Self::Fallback(sources.into_iter().map(Path::parse).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingEntry {
    pub destination: Path,
    pub value: MappingValue,
}

/// Destination path to source rules. A `direct` table holds only literals and never reads
/// the source event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "RawMappingTable")]
pub struct MappingTable {
    entries: Vec<MappingEntry>,
    direct: bool,
}

impl MappingTable {
    /// A table of literal values, written without looking at the source event.
    pub fn direct<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(destination, value)| MappingEntry {
                    destination: Path::parse(destination.as_ref()),
                    value: MappingValue::Literal(value),
                })
                .collect(),
            direct: true,
        }
    }

    /// A table resolved against the source event.
    pub fn paths<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<MappingValue>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(destination, value)| MappingEntry {
                    destination: Path::parse(destination.as_ref()),
                    value: value.into(),
                })
                .collect(),
            direct: false,
        }
    }

    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    #[must_use]
    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Deserialize)]
struct RawMappingTable {
    #[serde(default)]
    direct: bool,
    #[serde(default)]
    entries: Map<String, Value>,
}

impl TryFrom<RawMappingTable> for MappingTable {
    type Error = MappingError;

    fn try_from(raw: RawMappingTable) -> Result<Self, Self::Error> {
        let mut entries = Vec::with_capacity(raw.entries.len());
        for (destination, source) in raw.entries {
            let value = if raw.direct {
                MappingValue::Literal(source)
            } else {
                match source {
                    Value::String(source) => MappingValue::Path(Path::parse(&source)),
                    Value::Array(sources) => {
                        let mut chain = Vec::with_capacity(sources.len());
                        for source in sources {
                            let Value::String(source) = source else {
                                return Err(MappingError::InvalidFallback { destination });
                            };
                            chain.push(Path::parse(&source));
                        }
                        MappingValue::Fallback(chain)
                    }
                    literal => MappingValue::Literal(literal),
                }
            };
            entries.push(MappingEntry {
                destination: Path::parse(&destination),
                value,
            });
        }
        Ok(Self {
            entries,
            direct: raw.direct,
        })
    }
}

/// Applies `table` to `input`, writing every resolved value into `out`.
///
/// Destinations whose source is absent or null are skipped entirely: they are neither
/// written nor set to null.
pub fn construct_payload(out: &mut Value, input: &Value, table: &MappingTable) {
    for entry in &table.entries {
        match entry.value.resolve(input) {
            Some(value) if !value.is_null() => path::set(out, &entry.destination, value),
            _ => trace!("No value for {}", entry.destination),
        }
    }
}

/// Output type tag and table applied to events with a given discriminant.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventTypeRule {
    #[serde(rename = "type")]
    pub output_type: String,
    #[serde(default)]
    pub mapping: MappingTable,
}

impl EventTypeRule {
    pub fn new(output_type: impl Into<String>, mapping: MappingTable) -> Self {
        Self {
            output_type: output_type.into(),
            mapping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    rules: HashMap<String, EventTypeRule>,
    default: EventTypeRule,
}

impl RuleSet {
    #[must_use]
    pub fn new(default: EventTypeRule) -> Self {
        Self {
            rules: HashMap::new(),
            default,
        }
    }

    #[must_use]
    pub fn with_rule(mut self, discriminant: impl Into<String>, rule: EventTypeRule) -> Self {
        self.rules.insert(discriminant.into(), rule);
        self
    }

    /// Returns the rule registered for `discriminant`, or the default rule.
    #[must_use]
    pub fn select(&self, discriminant: Option<&str>) -> &EventTypeRule {
        discriminant
            .and_then(|name| self.rules.get(name))
            .unwrap_or(&self.default)
    }

    #[must_use]
    pub fn default_rule(&self) -> &EventTypeRule {
        &self.default
    }

    pub fn from_json(json: &str) -> Result<Self, MappingError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Field names the mapper reads from and writes to.
#[derive(Debug, Clone, PartialEq)]
pub struct MapperConfig {
    /// Source field selecting the rule, e.g. `event`.
    pub discriminant: Path,
    /// Destination field receiving the rule's output type.
    pub type_field: Path,
    /// Source object whose public keys are copied verbatim.
    pub source_properties: Path,
    /// Destination object receiving those keys.
    pub extra_properties: Path,
    /// Keys starting with this prefix are internal and never copied.
    pub reserved_prefix: String,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            discriminant: Path::parse("event"),
            type_field: Path::parse("type"),
            source_properties: Path::parse("properties"),
            extra_properties: Path::parse("properties"),
            reserved_prefix: "$".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayloadMapper {
    constants: MappingTable,
    generic: MappingTable,
    rules: RuleSet,
    config: MapperConfig,
}

#[derive(Deserialize)]
struct MapperDefinition {
    #[serde(default)]
    constants: MappingTable,
    #[serde(default)]
    generic: MappingTable,
    #[serde(flatten)]
    rules: RuleSet,
}

impl PayloadMapper {
    #[must_use]
    pub fn new(rules: RuleSet) -> Self {
        Self {
            constants: MappingTable::default(),
            generic: MappingTable::default(),
            rules,
            config: MapperConfig::default(),
        }
    }

    /// Literal values written into every payload before anything else.
    #[must_use]
    pub fn with_constants(mut self, constants: MappingTable) -> Self {
        self.constants = constants;
        self
    }

    /// Table applied to every event before its type specific rule.
    #[must_use]
    pub fn with_generic(mut self, generic: MappingTable) -> Self {
        self.generic = generic;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: MapperConfig) -> Self {
        self.config = config;
        self
    }

    /// Loads constants, generic table and rule set from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, MappingError> {
        let definition: MapperDefinition = serde_json::from_str(json)?;
        Ok(Self::new(definition.rules)
            .with_constants(definition.constants)
            .with_generic(definition.generic))
    }

    #[must_use]
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    #[must_use]
    pub fn select_rule(&self, event: &Value) -> &EventTypeRule {
        let discriminant = path::get(event, &self.config.discriminant).and_then(Value::as_str);
        self.rules.select(discriminant)
    }

    /// Builds the collector payload for `event`. Never fails: missing source fields are
    /// simply absent from the output.
    #[must_use]
    pub fn map_event(&self, event: &Value) -> Value {
        let mut payload = Value::Object(Map::new());

        construct_payload(&mut payload, event, &self.constants);
        construct_payload(&mut payload, event, &self.generic);

        let rule = self.select_rule(event);
        path::set(
            &mut payload,
            &self.config.type_field,
            Value::String(rule.output_type.clone()),
        );
        construct_payload(&mut payload, event, &rule.mapping);

        self.copy_extra_properties(&mut payload, event);
        payload
    }

    fn copy_extra_properties(&self, payload: &mut Value, event: &Value) {
        let Some(Value::Object(properties)) = path::get(event, &self.config.source_properties)
        else {
            return;
        };

        for (key, value) in properties {
            if value.is_null() || self.is_reserved(key) {
                continue;
            }
            let destination = self.config.extra_properties.child(key.as_str());
            path::set(payload, &destination, value.clone());
        }
    }

    fn is_reserved(&self, key: &str) -> bool {
        !self.config.reserved_prefix.is_empty() && key.starts_with(&self.config.reserved_prefix)
    }
}
