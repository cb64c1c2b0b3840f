//! Typed capability arguments.
//!
//! Arguments arrive either from `key=value` pairs on the command line or from
//! scenario files. Both go through [`ArgValue::parse`], which tries bool, then
//! integer, then duration, and falls back to a plain string.

use crate::error::{ChaosError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Duration(Duration),
    Str(String),
}

impl ArgValue {
    /// Best-effort parse of a raw string value.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(n) = trimmed.parse::<i64>() {
            return Self::Int(n);
        }
        if let Ok(d) = humantime::parse_duration(trimmed) {
            return Self::Duration(d);
        }
        Self::Str(trimmed.to_string())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Duration(_) => "duration",
            Self::Str(_) => "string",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Durations, or non-negative integers read as whole seconds.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Duration(d) => Some(*d),
            Self::Int(n) if *n >= 0 => Some(Duration::from_secs(*n as u64)),
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Duration(d) => write!(f, "{}", humantime::format_duration(*d)),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Duration> for ArgValue {
    fn from(value: Duration) -> Self {
        Self::Duration(value)
    }
}

impl Serialize for ArgValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(n) => serializer.serialize_i64(*n),
            Self::Duration(_) => serializer.collect_str(self),
            Self::Str(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for ArgValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Int(i64),
            Float(f64),
            Str(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Bool(b) => Self::Bool(b),
            Raw::Int(n) => Self::Int(n),
            Raw::Float(f) => Self::Str(f.to_string()),
            Raw::Str(s) => Self::parse(&s),
        })
    }
}

/// Named arguments passed to an action or assertion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(BTreeMap<String, ArgValue>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` pairs as given on the command line.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ChaosError::invalid_argument(format!(
                    "{pair:?} must be key=value"
                )));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(ChaosError::invalid_argument(format!(
                    "{pair:?} has an empty key"
                )));
            }
            args.insert(key, ArgValue::parse(value));
        }
        Ok(args)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ArgValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.0.iter()
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            None => Err(ChaosError::invalid_argument(format!("{key} is required"))),
            Some(value) => value.as_str().ok_or_else(|| mismatch(key, "string", value)),
        }
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.as_str().ok_or_else(|| mismatch(key, "string", value)),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.as_bool().ok_or_else(|| mismatch(key, "bool", value)),
        }
    }

    pub fn int_or(&self, key: &str, default: i64) -> Result<i64> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.as_int().ok_or_else(|| mismatch(key, "integer", value)),
        }
    }

    pub fn duration_or(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_duration()
                .ok_or_else(|| mismatch(key, "duration", value)),
        }
    }
}

impl FromIterator<(String, ArgValue)> for Args {
    fn from_iter<T: IntoIterator<Item = (String, ArgValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn mismatch(key: &str, expected: &str, got: &ArgValue) -> ChaosError {
    ChaosError::invalid_argument(format!(
        "{key} must be a {expected}, got {} {got:?}",
        got.type_name()
    ))
}
