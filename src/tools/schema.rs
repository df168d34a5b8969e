//! Argument schemas for tool calls.
//!
//! A deliberately small subset of JSON Schema: an object with typed
//! `properties`, a `required` list and `additionalProperties`. Anything richer
//! is the tool's own business once its handler runs.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Type of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub field_type: FieldType,
    pub required: bool,
}

/// Why a set of arguments was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgError {
    #[error("Missing required argument '{0}'")]
    MissingField(String),

    #[error("Argument '{field}' must be of type {expected}")]
    WrongType { field: String, expected: &'static str },

    #[error("Arguments must be a JSON object")]
    NotAnObject,

    #[error("Unknown argument '{0}'")]
    UnknownField(String),
}

/// Compiled argument schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgSchema {
    pub fields: BTreeMap<String, FieldSpec>,
    /// When false, undeclared arguments are rejected
    pub allow_additional: bool,
}

impl ArgSchema {
    /// Schema accepting no arguments at all.
    pub fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
            allow_additional: false,
        }
    }

    /// Build from a JSON-schema declaration.
    ///
    /// `additionalProperties` defaults to `false`: a tool only receives the
    /// arguments it declares. Unrecognized `type` strings are treated as `Any`.
    pub fn from_json_schema(schema: &Value) -> Self {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut fields = BTreeMap::new();
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (name, prop) in props {
                let field_type = prop
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(FieldType::parse)
                    .unwrap_or(FieldType::Any);
                fields.insert(
                    name.clone(),
                    FieldSpec {
                        field_type,
                        required: required.contains(&name.as_str()),
                    },
                );
            }
        }

        // Required names without a property declaration still must be present.
        for name in required {
            fields.entry(name.to_string()).or_insert(FieldSpec {
                field_type: FieldType::Any,
                required: true,
            });
        }

        let allow_additional = schema
            .get("additionalProperties")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self {
            fields,
            allow_additional,
        }
    }

    /// Validate arguments against the schema.
    ///
    /// `null` is accepted as an empty object. Missing fields are reported
    /// before unknown ones.
    pub fn validate(&self, args: &Value) -> Result<(), ArgError> {
        let empty = Map::new();
        let obj = match args {
            Value::Object(obj) => obj,
            Value::Null => &empty,
            _ => return Err(ArgError::NotAnObject),
        };

        for (name, spec) in &self.fields {
            match obj.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(ArgError::MissingField(name.clone()));
                }
                Some(value) if !value.is_null() && !spec.field_type.accepts(value) => {
                    return Err(ArgError::WrongType {
                        field: name.clone(),
                        expected: spec.field_type.as_str(),
                    });
                }
                _ => {}
            }
        }

        if !self.allow_additional {
            if let Some(unknown) = obj.keys().find(|k| !self.fields.contains_key(*k)) {
                return Err(ArgError::UnknownField(unknown.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_schema() -> ArgSchema {
        ArgSchema::from_json_schema(&json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "start_line": {"type": "integer"}
            },
            "required": ["path"]
        }))
    }

    #[test]
    fn test_valid_args() {
        let schema = read_schema();
        assert!(schema.validate(&json!({"path": "a.txt"})).is_ok());
        assert!(schema
            .validate(&json!({"path": "a.txt", "start_line": 3}))
            .is_ok());
    }

    #[test]
    fn test_missing_required() {
        let schema = read_schema();
        assert_eq!(
            schema.validate(&json!({"start_line": 3})),
            Err(ArgError::MissingField("path".to_string()))
        );
        assert_eq!(
            schema.validate(&Value::Null),
            Err(ArgError::MissingField("path".to_string()))
        );
    }

    #[test]
    fn test_unknown_field() {
        let schema = read_schema();
        assert_eq!(
            schema.validate(&json!({"path": "a.txt", "mode": "w"})),
            Err(ArgError::UnknownField("mode".to_string()))
        );
    }

    #[test]
    fn test_additional_properties_allowed() {
        let schema = ArgSchema::from_json_schema(&json!({
            "properties": {"q": {"type": "string"}},
            "additionalProperties": true
        }));
        assert!(schema.validate(&json!({"q": "x", "page": 2})).is_ok());
    }

    #[test]
    fn test_wrong_type() {
        let schema = read_schema();
        assert!(matches!(
            schema.validate(&json!({"path": 7})),
            Err(ArgError::WrongType { field, expected: "string" }) if field == "path"
        ));
        assert_eq!(schema.validate(&json!("a.txt")), Err(ArgError::NotAnObject));
    }
}
