use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MapError;

/// Closed registry of pure field operations.
///
/// Mapping tables reference these by name; an unknown name fails table
/// deserialization, which the config validator reports as a config error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapperOp {
    Identity,
    ToString,
    ToNumber,
    ToBoolean,
    Lowercase,
    Uppercase,
    /// Epoch milliseconds -> whole seconds.
    EpochMsToSeconds,
    /// Whole seconds -> epoch milliseconds.
    SecondsToEpochMs,
    /// Any value -> its JSON text.
    JsonEncode,
    /// JSON text -> the parsed value.
    JsonParse,
}

pub fn apply_op(op: MapperOp, value: Value) -> Result<Value, MapError> {
    match op {
        MapperOp::Identity => Ok(value),
        MapperOp::ToString => Ok(match value {
            Value::String(text) => Value::String(text),
            other => Value::String(other.to_string()),
        }),
        MapperOp::ToNumber => match &value {
            Value::Number(_) => Ok(value),
            Value::String(text) => text
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| MapError::Op(op, format!("not a number: {text:?}"))),
            Value::Bool(flag) => Ok(Value::from(if *flag { 1 } else { 0 })),
            other => Err(MapError::Op(op, format!("cannot convert {other}"))),
        },
        MapperOp::ToBoolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(text) => match text.as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" | "" => Ok(Value::Bool(false)),
                other => Err(MapError::Op(op, format!("not a boolean: {other:?}"))),
            },
            Value::Number(number) => Ok(Value::Bool(number.as_f64().unwrap_or(0.0) != 0.0)),
            other => Err(MapError::Op(op, format!("cannot convert {other}"))),
        },
        MapperOp::Lowercase => string_op(op, value, |text| text.to_lowercase()),
        MapperOp::Uppercase => string_op(op, value, |text| text.to_uppercase()),
        MapperOp::EpochMsToSeconds => match value.as_i64() {
            Some(ms) => Ok(Value::from(ms / 1000)),
            None => Err(MapError::Op(op, "expected integer milliseconds".into())),
        },
        MapperOp::SecondsToEpochMs => match value.as_i64() {
            Some(secs) => Ok(Value::from(secs * 1000)),
            None => Err(MapError::Op(op, "expected integer seconds".into())),
        },
        MapperOp::JsonEncode => Ok(Value::String(value.to_string())),
        MapperOp::JsonParse => match value {
            Value::String(text) => serde_json::from_str(&text)
                .map_err(|err| MapError::Op(op, format!("invalid json: {err}"))),
            other => Err(MapError::Op(op, format!("expected string, got {other}"))),
        },
    }
}

fn string_op(op: MapperOp, value: Value, f: impl Fn(&str) -> String) -> Result<Value, MapError> {
    match value {
        Value::String(text) => Ok(Value::String(f(&text))),
        other => Err(MapError::Op(op, format!("expected string, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_op_name_fails_deserialization() {
        let result: Result<MapperOp, _> = serde_json::from_str("\"math_floor_now\"");
        assert!(result.is_err());
    }

    #[test]
    fn epoch_conversion_both_ways() {
        assert_eq!(
            apply_op(MapperOp::EpochMsToSeconds, json!(1700000123456_i64)).unwrap(),
            json!(1700000123)
        );
        assert_eq!(
            apply_op(MapperOp::SecondsToEpochMs, json!(1700000123)).unwrap(),
            json!(1700000123000_i64)
        );
    }

    #[test]
    fn to_number_parses_strings() {
        assert_eq!(apply_op(MapperOp::ToNumber, json!("2.5")).unwrap(), json!(2.5));
        assert!(apply_op(MapperOp::ToNumber, json!("nope")).is_err());
    }
}
