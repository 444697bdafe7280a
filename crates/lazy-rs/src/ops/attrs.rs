//! Static attributes attached to recorded nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrValue {
    Int(i64),
    Ints(Vec<i64>),
    Float(f64),
    Bool(bool),
}

/// Ordered key/value map of node attributes.
///
/// Ordering is stable so the serialized form participates deterministically in region
/// signatures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes(BTreeMap<String, AttrValue>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_int(mut self, key: &str, value: i64) -> Self {
        self.0.insert(key.to_string(), AttrValue::Int(value));
        self
    }

    pub fn with_ints(mut self, key: &str, values: impl Into<Vec<i64>>) -> Self {
        self.0.insert(key.to_string(), AttrValue::Ints(values.into()));
        self
    }

    pub fn with_float(mut self, key: &str, value: f64) -> Self {
        self.0.insert(key.to_string(), AttrValue::Float(value));
        self
    }

    pub fn with_bool(mut self, key: &str, value: bool) -> Self {
        self.0.insert(key.to_string(), AttrValue::Bool(value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(AttrValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        self.int(key).unwrap_or(default)
    }

    pub fn ints(&self, key: &str) -> Option<&[i64]> {
        match self.0.get(key) {
            Some(AttrValue::Ints(values)) => Some(values),
            _ => None,
        }
    }

    /// Reads a float attribute, accepting integers as well.
    pub fn float(&self, key: &str) -> Option<f64> {
        match self.0.get(key) {
            Some(AttrValue::Float(value)) => Some(*value),
            Some(AttrValue::Int(value)) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(AttrValue::Bool(value)) => *value,
            _ => default,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_ignore_mismatched_kinds() {
        let attrs = Attributes::new()
            .with_int("dim", -1)
            .with_ints("perm", [1, 0])
            .with_float("min", 0.5);
        assert_eq!(attrs.int("dim"), Some(-1));
        assert_eq!(attrs.ints("perm"), Some(&[1, 0][..]));
        assert_eq!(attrs.int("perm"), None);
        assert_eq!(attrs.float("dim"), Some(-1.0));
        assert!(!attrs.bool_or("keepdim", false));
    }

    #[test]
    fn serialization_is_key_ordered() {
        let a = Attributes::new().with_int("b", 1).with_int("a", 2);
        let b = Attributes::new().with_int("a", 2).with_int("b", 1);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
