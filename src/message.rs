//! Broker message shapes.
//!
//! Bodies are opaque bytes. Application properties are an untyped string-keyed bag of JSON
//! values, which is how brokers expose them; typed access to the retry keys lives in
//! [`crate::codec`] and nowhere else.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Application property bag carried by every message.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// A message delivered to a receiver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub message_id: Option<String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    /// Broker-assigned token identifying this delivery; settlement is keyed on it.
    #[serde(default)]
    pub lock_token: Option<u64>,
}

impl ReceivedMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into(), ..Self::default() }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Id used in log lines; empty ids read as `<none>`.
    pub fn display_id(&self) -> &str {
        match self.message_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => "<none>",
        }
    }
}

/// A message handed to a sender.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: Option<String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl OutboundMessage {
    /// What a receiver sees once the broker delivers this message. The lock token is
    /// assigned at delivery time.
    pub fn into_received(self) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id,
            body: self.body,
            content_type: self.content_type,
            properties: self.properties,
            lock_token: None,
        }
    }
}
