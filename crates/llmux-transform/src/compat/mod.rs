//! Declarative field-level request/response mapping.
//!
//! A `MappingTable` describes, per upstream quirk, which fields move where
//! and through which pure operation. Tables are data (JSON), operations are
//! the closed `MapperOp` registry; nothing here evaluates source strings.

mod cache;
mod ops;
mod path;

pub use cache::MappingCache;
pub use ops::{MapperOp, apply_op};
pub use path::{get_path, remove_path, set_path};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum MapError {
    UnknownEnumTable(String),
    IncompleteMapping(String),
    Op(MapperOp, String),
    NotInvertible(&'static str),
    Validation(Vec<String>),
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapError::UnknownEnumTable(name) => write!(f, "unknown enum table: {name}"),
            MapError::IncompleteMapping(what) => write!(f, "incomplete field mapping: {what}"),
            MapError::Op(op, msg) => write!(f, "op {op:?} failed: {msg}"),
            MapError::NotInvertible(what) => write!(f, "mapping not invertible: {what}"),
            MapError::Validation(fields) => {
                write!(f, "validation failed for fields: {}", fields.join(", "))
            }
        }
    }
}

impl std::error::Error for MapError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapDirection {
    Forward,
    Reverse,
}

/// The four mapping kinds a field entry can declare.
///
/// `transform` and `function` share the closed `MapperOp` registry; they stay
/// distinct so migrated tables keep their original wording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    /// Move the value unchanged.
    #[default]
    Direct,
    /// Enum lookup in a named table; `*` entry is the fallback.
    Mapping,
    /// Named primitive operation.
    Transform,
    /// Apply the operation to every element of an array.
    ArrayTransform,
    /// Whitelisted pure function.
    Function,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub kind: MappingKind,
    /// Enum table name; required when `kind` is `mapping`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Operation; required for the transform kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<MapperOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub path: String,
    pub op: ConditionOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Exists,
    Equals,
    NotEquals,
}

impl Condition {
    fn holds(&self, input: &Value) -> bool {
        let actual = get_path(input, &self.path);
        match self.op {
            ConditionOp::Exists => actual.is_some(),
            ConditionOp::Equals => actual == self.value.as_ref(),
            ConditionOp::NotEquals => actual != self.value.as_ref(),
        }
    }
}

/// Declared type for strict post-mapping validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl JsonType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSpec {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub types: HashMap<String, JsonType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingTable {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub enum_mappings: HashMap<String, HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSpec>,
}

impl MappingTable {
    /// Applies the table to `input`. Unmapped fields pass through; a mapped
    /// source is moved to its target path.
    pub fn apply(&self, input: &Value, direction: MapDirection) -> Result<Value, MapError> {
        let table = match direction {
            MapDirection::Forward => std::borrow::Cow::Borrowed(self),
            MapDirection::Reverse => std::borrow::Cow::Owned(self.reversed()?),
        };

        let mut output = input.clone();
        for mapping in &table.field_mappings {
            if let Some(condition) = &mapping.condition
                && !condition.holds(input)
            {
                continue;
            }
            let value = match remove_path(&mut output, &mapping.source) {
                Some(value) => value,
                None => match &mapping.default {
                    Some(default) => default.clone(),
                    None => continue,
                },
            };
            let mapped = table.apply_kind(mapping, value)?;
            set_path(&mut output, &mapping.target, mapped);
        }

        if let Some(validation) = &table.validation {
            table.validate(validation, &output)?;
        }
        Ok(output)
    }

    fn apply_kind(&self, mapping: &FieldMapping, value: Value) -> Result<Value, MapError> {
        match mapping.kind {
            MappingKind::Direct => Ok(value),
            MappingKind::Mapping => {
                let table = mapping.table.as_deref().ok_or_else(|| {
                    MapError::IncompleteMapping(format!("{}: mapping needs a table", mapping.source))
                })?;
                let lookup = self
                    .enum_mappings
                    .get(table)
                    .ok_or_else(|| MapError::UnknownEnumTable(table.to_string()))?;
                let key = match &value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                match lookup.get(&key).or_else(|| lookup.get("*")) {
                    Some(mapped) => Ok(Value::String(mapped.clone())),
                    // No entry and no fallback: keep the original value.
                    None => Ok(value),
                }
            }
            MappingKind::Transform | MappingKind::Function => {
                let op = mapping.op.ok_or_else(|| {
                    MapError::IncompleteMapping(format!("{}: transform needs an op", mapping.source))
                })?;
                apply_op(op, value)
            }
            MappingKind::ArrayTransform => {
                let op = mapping.op.ok_or_else(|| {
                    MapError::IncompleteMapping(format!("{}: transform needs an op", mapping.source))
                })?;
                match value {
                    Value::Array(items) => items
                        .into_iter()
                        .map(|item| apply_op(op, item))
                        .collect::<Result<Vec<_>, _>>()
                        .map(Value::Array),
                    other => apply_op(op, other),
                }
            }
        }
    }

    fn validate(&self, spec: &ValidationSpec, output: &Value) -> Result<(), MapError> {
        let mut failed = Vec::new();
        for field in &spec.required {
            if get_path(output, field).is_none() {
                failed.push(field.clone());
            }
        }
        for (field, expected) in &spec.types {
            if let Some(actual) = get_path(output, field)
                && !expected.matches(actual)
            {
                failed.push(field.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort();
            Err(MapError::Validation(failed))
        }
    }

    /// The inverse table: sources and targets swap, enum tables flip.
    ///
    /// Only direct and enum mappings are invertible; a table carrying value
    /// transforms cannot run in reverse.
    pub fn reversed(&self) -> Result<MappingTable, MapError> {
        let mut field_mappings = Vec::with_capacity(self.field_mappings.len());
        for mapping in &self.field_mappings {
            match mapping.kind {
                MappingKind::Direct | MappingKind::Mapping => {}
                MappingKind::Transform | MappingKind::ArrayTransform | MappingKind::Function => {
                    return Err(MapError::NotInvertible("value transform"));
                }
            }
            field_mappings.push(FieldMapping {
                source: mapping.target.clone(),
                target: mapping.source.clone(),
                kind: mapping.kind,
                table: mapping.table.clone(),
                op: None,
                default: None,
                condition: None,
            });
        }
        let enum_mappings = self
            .enum_mappings
            .iter()
            .map(|(name, table)| {
                let flipped = table
                    .iter()
                    .filter(|(key, _)| key.as_str() != "*")
                    .map(|(key, mapped)| (mapped.clone(), key.clone()))
                    .collect();
                (name.clone(), flipped)
            })
            .collect();
        Ok(MappingTable {
            version: self.version.clone(),
            description: self.description.clone(),
            field_mappings,
            enum_mappings,
            validation: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> MappingTable {
        serde_json::from_value(json!({
            "version": "1",
            "field_mappings": [
                {"source": "max_tokens", "target": "max_completion_tokens"},
                {"source": "finish", "target": "stop", "kind": "mapping", "table": "finish"},
                {"source": "created_ms", "target": "created", "kind": "transform",
                 "op": "epoch_ms_to_seconds"}
            ],
            "enum_mappings": {
                "finish": {"end_turn": "stop", "max_tokens": "length", "*": "stop"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn fields_move_and_transform() {
        let input = json!({
            "model": "m",
            "max_tokens": 16,
            "finish": "end_turn",
            "created_ms": 1700000123456_i64
        });
        let out = table().apply(&input, MapDirection::Forward).unwrap();
        assert_eq!(out["max_completion_tokens"], 16);
        assert!(out.get("max_tokens").is_none());
        assert_eq!(out["stop"], "stop");
        assert_eq!(out["created"], 1700000123_i64);
        assert_eq!(out["model"], "m");
    }

    #[test]
    fn enum_fallback_applies() {
        let out = table()
            .apply(&json!({"finish": "weird"}), MapDirection::Forward)
            .unwrap();
        assert_eq!(out["stop"], "stop");
    }

    #[test]
    fn missing_source_without_default_is_skipped() {
        let out = table()
            .apply(&json!({"model": "m"}), MapDirection::Forward)
            .unwrap();
        assert!(out.get("max_completion_tokens").is_none());
    }

    #[test]
    fn default_fills_missing_source() {
        let table: MappingTable = serde_json::from_value(json!({
            "version": "1",
            "field_mappings": [
                {"source": "stream", "target": "stream", "default": false}
            ]
        }))
        .unwrap();
        let out = table.apply(&json!({}), MapDirection::Forward).unwrap();
        assert_eq!(out["stream"], false);
    }

    #[test]
    fn condition_gates_a_mapping() {
        let table: MappingTable = serde_json::from_value(json!({
            "version": "1",
            "field_mappings": [
                {"source": "a", "target": "b",
                 "condition": {"path": "mode", "op": "equals", "value": "copy"}}
            ]
        }))
        .unwrap();
        let skipped = table
            .apply(&json!({"a": 1, "mode": "off"}), MapDirection::Forward)
            .unwrap();
        assert_eq!(skipped["a"], 1);
        let applied = table
            .apply(&json!({"a": 1, "mode": "copy"}), MapDirection::Forward)
            .unwrap();
        assert_eq!(applied["b"], 1);
    }

    #[test]
    fn strict_validation_reports_fields() {
        let table: MappingTable = serde_json::from_value(json!({
            "version": "1",
            "field_mappings": [],
            "validation": {"required": ["model"], "types": {"max_tokens": "number"}}
        }))
        .unwrap();
        let err = table
            .apply(&json!({"max_tokens": "sixteen"}), MapDirection::Forward)
            .unwrap_err();
        assert_eq!(
            err,
            MapError::Validation(vec!["max_tokens".to_string(), "model".to_string()])
        );
    }

    #[test]
    fn reverse_direction_swaps_moves() {
        let table: MappingTable = serde_json::from_value(json!({
            "version": "1",
            "field_mappings": [
                {"source": "max_tokens", "target": "max_completion_tokens"}
            ]
        }))
        .unwrap();
        let out = table
            .apply(&json!({"max_completion_tokens": 8}), MapDirection::Reverse)
            .unwrap();
        assert_eq!(out["max_tokens"], 8);
    }

    #[test]
    fn transform_tables_refuse_reverse() {
        let err = table()
            .apply(&json!({"created": 1}), MapDirection::Reverse)
            .unwrap_err();
        assert_eq!(err, MapError::NotInvertible("value transform"));
    }
}
