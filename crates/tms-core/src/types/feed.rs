//! Feed status and record field maps shared by all subscriptions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// State of the server-side feed behind a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Connected,
    /// The call is dead. Also synthesized locally when the transport fails.
    Disconnected,
    /// The initial snapshot has been delivered; later events are live updates.
    InitialStateReceived,
    Reconnected,
}

/// Named fields of a record, split by value type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fields {
    #[serde(default)]
    pub numeric_fields: HashMap<String, f64>,
    #[serde(default)]
    pub string_fields: HashMap<String, String>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of a numeric field.
    pub fn with_numeric(mut self, name: &str, value: f64) -> Self {
        self.numeric_fields.insert(name.to_string(), value);
        self
    }

    /// Builder-style insert of a string field.
    pub fn with_string(mut self, name: &str, value: &str) -> Self {
        self.string_fields.insert(name.to_string(), value.to_string());
        self
    }

    #[inline]
    pub fn numeric(&self, name: &str) -> Option<f64> {
        self.numeric_fields.get(name).copied()
    }

    #[inline]
    pub fn string(&self, name: &str) -> Option<&str> {
        self.string_fields.get(name).map(String::as_str)
    }
}
