//! Ordered row identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a row in an ordered key space.
///
/// Ordering is total: all integer keys sort before all string keys, and
/// values of the same kind sort naturally. Connectors must iterate their key
/// space in this same order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    /// Parse a key from text, preferring the integer form.
    ///
    /// JSON object keys are always strings, so datasets keyed by numbers
    /// come through here. Only the canonical spelling of an integer becomes
    /// [`Key::Int`]; `"007"` or `"+7"` stay strings, so distinct ids never
    /// collapse into one and `to_string` gives back the original text.
    pub fn parse(s: &str) -> Self {
        match s.parse::<i64>() {
            Ok(v) if v.to_string() == s => Key::Int(v),
            _ => Key::Str(s.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(v) => Some(*v),
            Key::Str(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{}", v),
            Key::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Str(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Str(value)
    }
}
