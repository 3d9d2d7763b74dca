use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

/// A schema that could not be compiled at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("schema must be a JSON object")]
    NotAnObject,

    #[error("root type must be \"object\", found {0}")]
    RootNotObject(String),

    #[error("\"{0}\" must be {1}")]
    BadKeyword(&'static str, &'static str),

    #[error("property '{name}': {reason}")]
    BadProperty { name: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Object,
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Null,
}

impl JsonType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "object" => JsonType::Object,
            "string" => JsonType::String,
            "integer" => JsonType::Integer,
            "number" => JsonType::Number,
            "boolean" => JsonType::Boolean,
            "array" => JsonType::Array,
            "null" => JsonType::Null,
            _ => return None,
        })
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            JsonType::Object => value.is_object(),
            JsonType::String => value.is_string(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Number => value.is_number(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Array => value.is_array(),
            JsonType::Null => value.is_null(),
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsonType::Object => "object",
            JsonType::String => "string",
            JsonType::Integer => "integer",
            JsonType::Number => "number",
            JsonType::Boolean => "boolean",
            JsonType::Array => "array",
            JsonType::Null => "null",
        };
        f.write_str(name)
    }
}

/// Rules for a single top-level argument.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertySchema {
    pub ty: Option<JsonType>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub enum_values: Option<Vec<Value>>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub items: Option<JsonType>,
}

/// Compiled subset of JSON Schema used for tool arguments.
///
/// Supported: root `type: object`, `properties` with `type`, `minimum`,
/// `maximum`, `enum`, `minItems`, `maxItems` and `items.type`, plus
/// `required` and a boolean `additionalProperties`.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSchema {
    properties: BTreeMap<String, PropertySchema>,
    required: Vec<String>,
    additional_properties: bool,
}

impl InputSchema {
    pub fn compile(raw: &Value) -> Result<Self, SchemaError> {
        let object = raw.as_object().ok_or(SchemaError::NotAnObject)?;

        if let Some(ty) = object.get("type") {
            if ty.as_str() != Some("object") {
                return Err(SchemaError::RootNotObject(ty.to_string()));
            }
        }

        let mut properties = BTreeMap::new();
        match object.get("properties") {
            None | Some(Value::Null) => {}
            Some(Value::Object(props)) => {
                for (name, spec) in props {
                    let compiled = compile_property(spec).map_err(|reason| {
                        SchemaError::BadProperty {
                            name: name.clone(),
                            reason,
                        }
                    })?;
                    properties.insert(name.clone(), compiled);
                }
            }
            Some(_) => return Err(SchemaError::BadKeyword("properties", "an object")),
        }

        let required = match object.get("required") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(keys)) => keys
                .iter()
                .map(|k| k.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or(SchemaError::BadKeyword("required", "an array of strings"))?,
            Some(_) => return Err(SchemaError::BadKeyword("required", "an array of strings")),
        };

        let additional_properties = match object.get("additionalProperties") {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(SchemaError::BadKeyword("additionalProperties", "a boolean"));
            }
        };

        Ok(Self {
            properties,
            required,
            additional_properties,
        })
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Check `args` against the schema, stopping at the first violation.
    ///
    /// Order: argument shape, extraneous keys, required keys, then per-key
    /// type and constraints.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<(), String> {
        if !self.additional_properties {
            if let Some(extra) = args.keys().find(|k| !self.properties.contains_key(*k)) {
                return Err(format!("unexpected param: {extra}"));
            }
        }

        for key in &self.required {
            if !args.contains_key(key) {
                return Err(format!("missing required param: {key}"));
            }
        }

        for (key, spec) in &self.properties {
            if let Some(value) = args.get(key) {
                check_property(key, spec, value)?;
            }
        }

        Ok(())
    }
}

fn compile_property(spec: &Value) -> Result<PropertySchema, String> {
    let object = spec.as_object().ok_or("schema must be an object")?;

    let ty = match object.get("type") {
        None => None,
        Some(Value::String(name)) => {
            Some(JsonType::parse(name).ok_or_else(|| format!("unsupported type \"{name}\""))?)
        }
        Some(_) => return Err("\"type\" must be a string".into()),
    };

    let number = |key: &str| -> Result<Option<f64>, String> {
        match object.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| format!("\"{key}\" must be a number")),
        }
    };
    let count = |key: &str| -> Result<Option<usize>, String> {
        match object.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| format!("\"{key}\" must be a non-negative integer")),
        }
    };

    let enum_values = match object.get("enum") {
        None => None,
        Some(Value::Array(values)) => Some(values.clone()),
        Some(_) => return Err("\"enum\" must be an array".into()),
    };

    let items = match object.get("items") {
        None => None,
        Some(Value::Object(items)) => match items.get("type") {
            None => None,
            Some(Value::String(name)) => Some(
                JsonType::parse(name)
                    .ok_or_else(|| format!("unsupported items type \"{name}\""))?,
            ),
            Some(_) => return Err("\"items.type\" must be a string".into()),
        },
        Some(_) => return Err("\"items\" must be an object".into()),
    };

    Ok(PropertySchema {
        ty,
        minimum: number("minimum")?,
        maximum: number("maximum")?,
        enum_values,
        min_items: count("minItems")?,
        max_items: count("maxItems")?,
        items,
    })
}

fn check_property(key: &str, spec: &PropertySchema, value: &Value) -> Result<(), String> {
    if let Some(ty) = spec.ty {
        if !ty.matches(value) {
            return Err(format!("param '{key}' must be {ty}"));
        }
    }

    if let Some(n) = value.as_f64().filter(|_| value.is_number()) {
        if let Some(min) = spec.minimum {
            if n < min {
                return Err(format!("param '{key}' must be >= {min}"));
            }
        }
        if let Some(max) = spec.maximum {
            if n > max {
                return Err(format!("param '{key}' must be <= {max}"));
            }
        }
    }

    if let Some(allowed) = &spec.enum_values {
        if !allowed.contains(value) {
            let listed = serde_json::to_string(allowed).unwrap_or_default();
            return Err(format!("param '{key}' must be one of {listed}"));
        }
    }

    if let Value::Array(items) = value {
        if let Some(min) = spec.min_items {
            if items.len() < min {
                return Err(format!("param '{key}' must have at least {min} items"));
            }
        }
        if let Some(max) = spec.max_items {
            if items.len() > max {
                return Err(format!("param '{key}' must have at most {max} items"));
            }
        }
        if let Some(item_ty) = spec.items {
            if let Some(pos) = items.iter().position(|item| !item_ty.matches(item)) {
                return Err(format!("param '{key}[{pos}]' must be {item_ty}"));
            }
        }
    }

    Ok(())
}
