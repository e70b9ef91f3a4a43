//! Control events carried on the data channel.
//!
//! Every message is a JSON object with a mandatory `type` string and any
//! number of additional fields. There is no envelope: ordering and
//! reliability come from the channel itself.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A tagged control record flowing in either direction over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    /// The `type` tag consumers dispatch on.
    #[serde(rename = "type")]
    pub kind: String,
    /// Every other field, uninterpreted.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ControlEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Adds a field, replacing any previous value under the same key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Parses one channel frame.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serializes for transmission on the channel.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
