//! Function-call argument decoding
//!
//! The engine sends arguments as a serialized JSON object. Only flat objects
//! of scalar values are accepted; nested objects or arrays are malformed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::FunctionName;

/// A scalar argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null)
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Null => f.write_str("null"),
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Integer(i) => write!(f, "{}", i),
            ArgValue::Float(x) => write!(f, "{}", x),
            ArgValue::String(s) => f.write_str(s),
        }
    }
}

/// Why an argument payload was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    #[error("arguments are not valid JSON: {0}")]
    Malformed(String),
    #[error("arguments must be a JSON object")]
    NotAnObject,
    #[error("argument '{0}' must be a scalar value")]
    NotScalar(String),
    #[error("missing required argument '{0}'")]
    MissingRequired(String),
}

/// Ordered argument set of one function call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(BTreeMap<String, ArgValue>);

impl Arguments {
    /// Decode the engine's serialized argument object
    ///
    /// An empty or whitespace-only payload is an empty argument set.
    pub fn parse(raw: &str) -> Result<Self, ArgumentError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(raw).map_err(|e| ArgumentError::Malformed(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(ArgumentError::NotAnObject);
        };

        let mut args = BTreeMap::new();
        for (key, value) in map {
            let scalar = match value {
                Value::Null => ArgValue::Null,
                Value::Bool(b) => ArgValue::Bool(b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => ArgValue::Integer(i),
                    None => ArgValue::Float(n.as_f64().unwrap_or(f64::NAN)),
                },
                Value::String(s) => ArgValue::String(s),
                Value::Array(_) | Value::Object(_) => return Err(ArgumentError::NotScalar(key)),
            };
            args.insert(key, scalar);
        }
        Ok(Self(args))
    }

    /// Parse and check the function's required parameters are present
    pub fn parse_for(function: FunctionName, raw: &str) -> Result<Self, ArgumentError> {
        let args = Self::parse(raw)?;
        for param in function.required_params() {
            match args.get(param) {
                Some(value) if !value.is_null() => {}
                _ => return Err(ArgumentError::MissingRequired(param.to_string())),
            }
        }
        Ok(args)
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    /// String argument, if present and a string
    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ArgValue::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ArgValue) {
        self.0.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.0.iter()
    }
}
