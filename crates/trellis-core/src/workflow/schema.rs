//! Structural schemas for step input and output objects.
//!
//! A `Schema` lists named fields with a coarse JSON type, whether they are
//! required, and an optional default that fills in absent values before
//! validation.

use std::fmt;

use serde_json::Value;

/// Coarse JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Any => "any",
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
        };
        f.write_str(s)
    }
}

/// Schema violations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("expected an object, got {0}")]
    NotAnObject(&'static str),

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' should be {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: &'static str,
    },

    #[error("unexpected field '{0}'")]
    UnexpectedField(String),
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    ty: FieldType,
    required: bool,
    default: Option<Value>,
}

/// Object schema.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<FieldSpec>,
    strict: bool,
}

impl Schema {
    pub fn object() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            required: true,
            default: None,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            required: false,
            default: None,
        });
        self
    }

    /// Optional field that takes `default` when absent.
    pub fn with_default(mut self, name: impl Into<String>, ty: FieldType, default: Value) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            required: false,
            default: Some(default),
        });
        self
    }

    /// Reject fields the schema does not declare.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Insert defaults for absent fields. Non-objects are left untouched.
    pub fn apply_defaults(&self, value: &mut Value) {
        let Some(map) = value.as_object_mut() else {
            return;
        };
        for field in &self.fields {
            if let Some(default) = &field.default {
                if !map.contains_key(&field.name) {
                    map.insert(field.name.clone(), default.clone());
                }
            }
        }
    }

    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        let map = value
            .as_object()
            .ok_or_else(|| SchemaError::NotAnObject(type_name(value)))?;

        for field in &self.fields {
            match map.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(SchemaError::MissingField(field.name.clone()));
                }
                None | Some(Value::Null) => {}
                Some(v) if !field.ty.accepts(v) => {
                    return Err(SchemaError::TypeMismatch {
                        field: field.name.clone(),
                        expected: field.ty,
                        found: type_name(v),
                    });
                }
                Some(_) => {}
            }
        }

        if self.strict {
            if let Some(extra) = map
                .keys()
                .find(|k| !self.fields.iter().any(|f| &f.name == *k))
            {
                return Err(SchemaError::UnexpectedField(extra.clone()));
            }
        }

        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
