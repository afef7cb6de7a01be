//! Lenient field access for loosely-typed JSON payloads.
//!
//! Upstream services (the discovery server, the Home Assistant config sensor)
//! hand back partially filled objects. A [`FieldSchema`] names the keys that
//! must be present; everything else is read through [`Fields`], which coerces
//! missing or mistyped values to an empty string or zero instead of failing.

use serde_json::{Map, Value};

/// Required and recommended keys of a payload.
#[derive(Clone, Copy, Debug)]
pub struct FieldSchema {
    required: &'static [&'static str],
    recommended: &'static [&'static str],
}

/// Outcome of checking a payload against a [`FieldSchema`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SchemaReport {
    pub missing_required: Vec<&'static str>,
    pub missing_recommended: Vec<&'static str>,
}

impl SchemaReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.missing_required.is_empty()
    }
}

impl FieldSchema {
    #[must_use]
    pub const fn new(required: &'static [&'static str]) -> Self {
        Self {
            required,
            recommended: &[],
        }
    }

    /// Keys whose absence is tolerated, but worth a warning.
    #[must_use]
    pub const fn recommended(mut self, keys: &'static [&'static str]) -> Self {
        self.recommended = keys;
        self
    }

    #[must_use]
    pub fn check(&self, fields: &Fields) -> SchemaReport {
        let missing = |keys: &'static [&'static str]| {
            keys.iter()
                .copied()
                .filter(|key| !fields.is_set(key))
                .collect::<Vec<_>>()
        };

        SchemaReport {
            missing_required: missing(self.required),
            missing_recommended: missing(self.recommended),
        }
    }
}

/// Read-only view of a JSON object with coercing accessors.
#[derive(Clone, Debug, Default)]
pub struct Fields {
    map: Map<String, Value>,
}

impl Fields {
    /// Wraps an object. Any other JSON value yields `None`.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self { map }),
            _ => None,
        }
    }

    /// Present and not empty: non-empty string, non-zero number, `true`,
    /// or any array/object.
    #[must_use]
    pub fn is_set(&self, key: &str) -> bool {
        match self.map.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|x| x != 0.0),
            Some(Value::Array(_) | Value::Object(_)) => true,
        }
    }

    /// String value of `key`. Numbers and booleans are rendered, anything
    /// else becomes an empty string.
    #[must_use]
    pub fn string(&self, key: &str) -> String {
        match self.map.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    /// Nested object under `key`.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Self> {
        self.map.get(key).cloned().and_then(Self::from_value)
    }

    /// Port-sized number for `key`. Numeric strings are parsed, anything
    /// missing or out of range becomes zero.
    #[must_use]
    pub fn port(&self, key: &str) -> u16 {
        let number = match self.map.get(key) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        number.and_then(|x| u16::try_from(x).ok()).unwrap_or(0)
    }
}
