//! In-memory value tree for entity fields and query operands.
//!
//! `Value` is a superset of JSON: besides the JSON-native types it carries
//! dates, raw binary, regular expressions and entity references, which the
//! [`codec`](crate::codec) turns into tagged JSON objects on the wire.

use std::ops::{BitOr, BitOrAssign};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Number;

/// Insertion-ordered object map.
pub type Map = IndexMap<String, Value>;

/// Regex option bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegexOptions(u8);

impl RegexOptions {
    pub const NONE: RegexOptions = RegexOptions(0);
    pub const CASE_INSENSITIVE: RegexOptions = RegexOptions(1 << 0);
    pub const MULTILINE: RegexOptions = RegexOptions(1 << 1);
    pub const DOT_ALL: RegexOptions = RegexOptions(1 << 2);

    const ALL_BITS: u8 = 0x07;

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Builds options from a bitmask, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL_BITS != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    pub fn contains(self, other: RegexOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// MongoDB `$options` letters, in `ims` order.
    pub fn letters(self) -> String {
        let mut s = String::new();
        if self.contains(Self::CASE_INSENSITIVE) {
            s.push('i');
        }
        if self.contains(Self::MULTILINE) {
            s.push('m');
        }
        if self.contains(Self::DOT_ALL) {
            s.push('s');
        }
        s
    }
}

impl BitOr for RegexOptions {
    type Output = RegexOptions;

    fn bitor(self, rhs: Self) -> Self::Output {
        RegexOptions(self.0 | rhs.0)
    }
}

impl BitOrAssign for RegexOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A regular expression together with its option flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
    pub options: RegexOptions,
}

impl Regex {
    pub fn new(pattern: impl Into<String>, options: RegexOptions) -> Self {
        Self {
            pattern: pattern.into(),
            options,
        }
    }
}

/// Pointer to another entity, by collection name and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub entity_name: String,
    pub id: String,
}

impl Reference {
    pub fn new(entity_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            id: id.into(),
        }
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(Map),
    Date(DateTime<Utc>),
    Binary(Vec<u8>),
    Regex(Regex),
    Reference(Reference),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(data) => Some(data),
            _ => None,
        }
    }

    /// Looks up `key` when this value is an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }
}

/// Adds two numbers, staying integral when both sides are.
pub(crate) fn add_numbers(a: &Number, b: &Number) -> Number {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Number::from(sum);
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).unwrap_or_else(|| Number::from(0))
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::Number(Number::from(n))
                }
            }
        )*
    };
}

from_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::from(n as f64)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Object(map)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<Regex> for Value {
    fn from(r: Regex) -> Self {
        Value::Regex(r)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Reference(r)
    }
}

/// Plain structural conversion. Tagged objects are kept as objects; use
/// [`codec::decode`](crate::codec::decode) to reconstruct special values.
impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_regex_options_bits() {
        let opts = RegexOptions::CASE_INSENSITIVE | RegexOptions::DOT_ALL;
        assert_eq!(opts.bits(), 0x05);
        assert!(opts.contains(RegexOptions::DOT_ALL));
        assert!(!opts.contains(RegexOptions::MULTILINE));
        assert_eq!(opts.letters(), "is");
        assert_eq!(RegexOptions::from_bits(0x08), None);
        assert_eq!(RegexOptions::from_bits(0x02), Some(RegexOptions::MULTILINE));
    }

    #[test]
    fn test_add_numbers() {
        assert_eq!(add_numbers(&Number::from(3), &Number::from(-1)), Number::from(2));
        let mixed = add_numbers(&Number::from(1), &Number::from_f64(0.5).unwrap());
        assert_eq!(mixed.as_f64(), Some(1.5));
    }

    #[test]
    fn test_from_json_keeps_order() {
        let value = Value::from(json!({"b": 1, "a": [true, null]}));
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(value.get("a").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_non_finite_float_is_null() {
        assert!(Value::from(f64::NAN).is_null());
    }
}
