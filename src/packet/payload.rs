//! Flat, primitive-typed packet payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PacketError;

/// A single payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for PayloadValue {
    fn from(v: bool) -> Self {
        PayloadValue::Bool(v)
    }
}

impl From<i64> for PayloadValue {
    fn from(v: i64) -> Self {
        PayloadValue::Int(v)
    }
}

impl From<i32> for PayloadValue {
    fn from(v: i32) -> Self {
        PayloadValue::Int(v.into())
    }
}

impl From<u32> for PayloadValue {
    fn from(v: u32) -> Self {
        PayloadValue::Int(v.into())
    }
}

impl From<usize> for PayloadValue {
    fn from(v: usize) -> Self {
        PayloadValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for PayloadValue {
    fn from(v: f64) -> Self {
        PayloadValue::Float(v)
    }
}

impl From<&str> for PayloadValue {
    fn from(v: &str) -> Self {
        PayloadValue::Text(v.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(v: String) -> Self {
        PayloadValue::Text(v)
    }
}

/// Ordered key/value payload.
///
/// Keys are kept sorted so the serialized form is canonical, which the
/// signature relies on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, PayloadValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PayloadValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(PayloadValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(PayloadValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(PayloadValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value, accepting integers as well as floats.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key) {
            Some(PayloadValue::Float(v)) => Some(*v),
            Some(PayloadValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// Required text field.
    pub fn require_str(&self, key: &'static str) -> Result<&str, PacketError> {
        match self.0.get(key) {
            Some(PayloadValue::Text(s)) => Ok(s),
            Some(_) => Err(PacketError::FieldType {
                field: key,
                expected: "text",
            }),
            None => Err(PacketError::MissingField(key)),
        }
    }

    /// Optional non-negative integer field; present but mistyped is an error.
    pub fn optional_count(&self, key: &'static str) -> Result<Option<usize>, PacketError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(PayloadValue::Int(v)) if *v >= 0 => Ok(Some(*v as usize)),
            Some(_) => Err(PacketError::FieldType {
                field: key,
                expected: "non-negative integer",
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.0.iter()
    }
}
