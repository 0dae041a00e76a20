//! Shared control variables with a one-generation backup.
//!
//! # Example
//!
//! ```
//! use labsync_core::{Value, VariableStore, Variables};
//!
//! let mut initial = Variables::new();
//! initial.insert("btn1".to_string(), Value::from(false));
//!
//! let mut store = VariableStore::new(initial);
//! store.set("btn1", true);
//! assert!(!store.is_confirmed());
//!
//! store.restore();
//! assert_eq!(store.get("btn1"), Some(&Value::from(false)));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A scalar variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl Value {
    /// Builds a number value; `None` for NaN and infinities.
    pub fn float(value: f64) -> Option<Self> {
        serde_json::Number::from_f64(value).map(Value::Number)
    }

    /// Parses operator input: `true`/`false`, a JSON number, otherwise text.
    pub fn parse(input: &str) -> Self {
        match input.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            other => match serde_json::from_str::<serde_json::Number>(other) {
                Ok(number) => Value::Number(number),
                Err(_) => Value::Text(other.to_string()),
            },
        }
    }
}

/// Variable name to value.
pub type Variables = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Inbound state as delivered by the relay or the device link.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundUpdate {
    /// A JSON document in text form
    Raw(String),
    /// An already decoded JSON value
    Structured(serde_json::Value),
}

impl InboundUpdate {
    /// Normalizes the update into a variables mapping.
    pub fn into_variables(self) -> Result<Variables, PayloadError> {
        let value = match self {
            InboundUpdate::Raw(text) => serde_json::from_str(&text)?,
            InboundUpdate::Structured(value) => value,
        };

        match value {
            serde_json::Value::Object(_) => Ok(serde_json::from_value(value)?),
            serde_json::Value::Null => Err(PayloadError::NotAnObject("null")),
            serde_json::Value::Bool(_) => Err(PayloadError::NotAnObject("boolean")),
            serde_json::Value::Number(_) => Err(PayloadError::NotAnObject("number")),
            serde_json::Value::String(_) => Err(PayloadError::NotAnObject("string")),
            serde_json::Value::Array(_) => Err(PayloadError::NotAnObject("array")),
        }
    }
}

impl From<serde_json::Value> for InboundUpdate {
    /// Strings are treated as encoded documents, everything else as structured.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => InboundUpdate::Raw(text),
            other => InboundUpdate::Structured(other),
        }
    }
}

/// Current variables, the last acknowledged snapshot, and the confirmation flag.
#[derive(Debug, Clone)]
pub struct VariableStore {
    current: Variables,
    backup: Variables,
    confirmed: bool,
    enabled: bool,
}

impl VariableStore {
    pub fn new(initial: Variables) -> Self {
        Self {
            backup: initial.clone(),
            current: initial,
            confirmed: false,
            enabled: true,
        }
    }

    pub fn current(&self) -> &Variables {
        &self.current
    }

    pub fn backup(&self) -> &Variables {
        &self.backup
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.current.get(key)
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Local change. The backup is left alone until the peer confirms.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.current.insert(key.into(), value.into());
        self.confirmed = false;
    }

    /// Merges state reported by the attached device. The device is the
    /// ground truth for what it reports, so the result is also the backup.
    pub fn report(&mut self, changes: Variables) {
        self.current.extend(changes);
        self.backup = self.current.clone();
        self.confirmed = false;
    }

    /// Replaces the state with one that came from the peer. It is trusted
    /// immediately, so it also becomes the backup.
    pub fn apply(&mut self, variables: Variables) {
        self.backup = variables.clone();
        self.current = variables;
    }

    /// The peer acknowledged `current`.
    pub fn confirm(&mut self) {
        self.confirmed = true;
        self.backup = self.current.clone();
    }

    /// Clears the confirmation flag for the next supervision window.
    pub fn reset_confirmation(&mut self) {
        self.confirmed = false;
    }

    /// Discards unconfirmed changes. Returns true if `current` changed.
    pub fn restore(&mut self) -> bool {
        if self.current == self.backup {
            return false;
        }
        self.current = self.backup.clone();
        true
    }

    pub fn snapshot(&self) -> Variables {
        self.current.clone()
    }

    /// Current variables as a JSON object string.
    pub fn to_json(&self) -> String {
        // A map of scalars always serializes.
        serde_json::to_string(&self.current).unwrap_or_else(|_| "{}".to_string())
    }
}
