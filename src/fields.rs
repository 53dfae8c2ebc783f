//! Typed access to the members of a parsed MRF object.
//!
//! MRF producers are loose about scalar types: ids and codes show up as
//! strings in one file and as numbers in the next. String accessors
//! therefore accept numbers and normalize them to their JSON text.

use serde_json::{Map, Value};
use thiserror::Error;

pub type Object = Map<String, Value>;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("required field '{field}' is missing")]
    MissingField { field: String },
    #[error("field '{field}' has the wrong type: expected {expected}, found {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("expected a JSON object, found {found}")]
    NotAnObject { found: &'static str },
    #[error("{0} records are not supported")]
    Unsupported(&'static str),
    #[error("service_code is missing from negotiated_prices for billing_class == professional")]
    MissingServiceCode,
    #[error("negotiated rate carries both provider_references and provider_groups")]
    AmbiguousProviders,
}

impl SchemaError {
    pub fn missing(field: &str) -> Self {
        SchemaError::MissingField {
            field: field.to_string(),
        }
    }

    fn wrong_type(field: &str, expected: &'static str, found: &Value) -> Self {
        SchemaError::WrongType {
            field: field.to_string(),
            expected,
            found: json_type_name(found),
        }
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn as_object(value: &Value) -> Result<&Object, SchemaError> {
    value.as_object().ok_or(SchemaError::NotAnObject {
        found: json_type_name(value),
    })
}

/// Present and not null.
fn present<'a>(obj: &'a Object, field: &str) -> Option<&'a Value> {
    obj.get(field).filter(|v| !v.is_null())
}

pub fn has_field(obj: &Object, field: &str) -> bool {
    present(obj, field).is_some()
}

fn scalar_to_string(field: &str, value: &Value) -> Result<String, SchemaError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(SchemaError::wrong_type(field, "string", other)),
    }
}

pub fn required_str(obj: &Object, field: &str) -> Result<String, SchemaError> {
    let value = present(obj, field).ok_or_else(|| SchemaError::missing(field))?;
    scalar_to_string(field, value)
}

pub fn optional_str(obj: &Object, field: &str) -> Result<Option<String>, SchemaError> {
    present(obj, field)
        .map(|value| scalar_to_string(field, value))
        .transpose()
}

pub fn required_f64(obj: &Object, field: &str) -> Result<f64, SchemaError> {
    let value = present(obj, field).ok_or_else(|| SchemaError::missing(field))?;
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| SchemaError::wrong_type(field, "number", value)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| SchemaError::wrong_type(field, "number", value)),
        other => Err(SchemaError::wrong_type(field, "number", other)),
    }
}

pub fn required_object<'a>(obj: &'a Object, field: &str) -> Result<&'a Object, SchemaError> {
    let value = present(obj, field).ok_or_else(|| SchemaError::missing(field))?;
    value
        .as_object()
        .ok_or_else(|| SchemaError::wrong_type(field, "object", value))
}

pub fn optional_array<'a>(
    obj: &'a Object,
    field: &str,
) -> Result<Option<&'a Vec<Value>>, SchemaError> {
    match present(obj, field) {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(other) => Err(SchemaError::wrong_type(field, "array", other)),
    }
}

pub fn required_array<'a>(obj: &'a Object, field: &str) -> Result<&'a Vec<Value>, SchemaError> {
    optional_array(obj, field)?.ok_or_else(|| SchemaError::missing(field))
}

/// Array of strings or numbers, each normalized to a string.
pub fn optional_string_list(obj: &Object, field: &str) -> Result<Option<Vec<String>>, SchemaError> {
    let Some(items) = optional_array(obj, field)? else {
        return Ok(None);
    };
    items
        .iter()
        .map(|item| scalar_to_string(field, item))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

pub fn required_i64_list(obj: &Object, field: &str) -> Result<Vec<i64>, SchemaError> {
    required_array(obj, field)?
        .iter()
        .map(|item| match item {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| SchemaError::wrong_type(field, "integer", item)),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| SchemaError::wrong_type(field, "integer", item)),
            other => Err(SchemaError::wrong_type(field, "integer", other)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Object {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn strings_accept_numbers() {
        let obj = object(json!({"id": 62.0004808658, "code": "Q5116", "n": 492089}));
        assert_eq!(required_str(&obj, "id").unwrap(), "62.0004808658");
        assert_eq!(required_str(&obj, "code").unwrap(), "Q5116");
        assert_eq!(required_str(&obj, "n").unwrap(), "492089");
    }

    #[test]
    fn missing_and_null_are_the_same() {
        let obj = object(json!({"description": null}));
        assert_eq!(optional_str(&obj, "description").unwrap(), None);
        assert_eq!(
            required_str(&obj, "description").unwrap_err(),
            SchemaError::missing("description")
        );
        assert!(!has_field(&obj, "description"));
    }

    #[test]
    fn wrong_types_are_reported() {
        let obj = object(json!({"name": ["x"], "rate": "abc", "npi": [1.5]}));
        assert!(matches!(
            required_str(&obj, "name").unwrap_err(),
            SchemaError::WrongType { expected: "string", found: "array", .. }
        ));
        assert!(required_f64(&obj, "rate").is_err());
        assert!(required_i64_list(&obj, "npi").is_err());
    }

    #[test]
    fn lists_are_normalized() {
        let obj = object(json!({
            "refs": [62.0000565525, 11925, "abc"],
            "npi": [1821198789, "987654321"]
        }));
        assert_eq!(
            optional_string_list(&obj, "refs").unwrap().unwrap(),
            vec!["62.0000565525", "11925", "abc"]
        );
        assert_eq!(
            required_i64_list(&obj, "npi").unwrap(),
            vec![1821198789, 987654321]
        );
        assert_eq!(optional_string_list(&obj, "absent").unwrap(), None);
    }
}
