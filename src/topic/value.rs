//! Typed topic values.
//!
//! `TopicValue` is serialized adjacently tagged (`{"type": "double", "value": 0.42}`)
//! so integers and doubles stay distinguishable on the wire. JSON has no
//! representation for NaN or infinities, so non-finite doubles refuse to
//! serialize instead of silently turning into `null`.

use std::fmt;

use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicType {
    Double,
    Int64,
    String,
    Json,
    Binary,
}

impl fmt::Display for TopicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopicType::Double => "double",
            TopicType::Int64 => "int64",
            TopicType::String => "string",
            TopicType::Json => "json",
            TopicType::Binary => "binary",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TopicValue {
    Double(#[serde(serialize_with = "finite")] f64),
    Int64(i64),
    String(String),
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl TopicValue {
    pub fn topic_type(&self) -> TopicType {
        match self {
            TopicValue::Double(_) => TopicType::Double,
            TopicValue::Int64(_) => TopicType::Int64,
            TopicValue::String(_) => TopicType::String,
            TopicValue::Json(_) => TopicType::Json,
            TopicValue::Binary(_) => TopicType::Binary,
        }
    }

    /// Rejects values the broker cannot store, which are non-finite doubles.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            TopicValue::Double(v) if !v.is_finite() => Err(format!("{v} is not a finite double")),
            _ => Ok(()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TopicValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TopicValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TopicValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for TopicValue {
    fn from(value: f64) -> Self {
        TopicValue::Double(value)
    }
}

impl From<i64> for TopicValue {
    fn from(value: i64) -> Self {
        TopicValue::Int64(value)
    }
}

impl From<String> for TopicValue {
    fn from(value: String) -> Self {
        TopicValue::String(value)
    }
}

impl From<&str> for TopicValue {
    fn from(value: &str) -> Self {
        TopicValue::String(value.to_string())
    }
}

impl From<serde_json::Value> for TopicValue {
    fn from(value: serde_json::Value) -> Self {
        TopicValue::Json(value)
    }
}

impl From<Vec<u8>> for TopicValue {
    fn from(value: Vec<u8>) -> Self {
        TopicValue::Binary(value)
    }
}

fn finite<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else {
        Err(S::Error::custom(format!("{value} is not a finite double")))
    }
}
