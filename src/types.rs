//! The message envelope exchanged over the socket and helpers for building and inspecting it.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
pub use serde_json::Value;
use uuid::Uuid;

use crate::Result;

/// Subscription filter that matches every inbound message type.
pub const WILDCARD: &str = "*";

/// Type tag given to inbound frames that are not a valid envelope.
pub const RAW_TYPE: &str = "raw";

/// Type tag of the default heartbeat envelope.
pub const PING_TYPE: &str = "ping";

/// Milliseconds since [`std::time::UNIX_EPOCH`]
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`].
#[must_use]
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Generate a unique, time-ordered message identifier.
#[must_use]
pub fn generate_message_id() -> String {
    Uuid::now_v7().to_string()
}

/// The `{ type, data, timestamp?, id? }` envelope.
///
/// The connection engine only ever looks at [`Message::msg_type`]; the payload is opaque to it
/// and defaults to a [`serde_json::Value`]. Consumers pull typed payloads out with
/// [`Message::decode`].
///
/// ```
/// use resilient_ws::types::Message;
/// use serde_json::json;
///
/// let message = Message::new("chat", json!({ "text": "hi" }));
/// assert_eq!(message.msg_type, "chat");
/// assert!(message.id.is_some());
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<T = Value> {
    /// Type tag used for subscription dispatch
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Payload
    pub data: T,
    /// Sender-side creation time; any JSON number is accepted on the way in
    #[serde(
        default,
        deserialize_with = "crate::serde_helpers::lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<Timestamp>,
    #[serde(
        default,
        deserialize_with = "crate::serde_helpers::lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
}

impl<T> Message<T> {
    /// Create a message stamped with the current time and a freshly generated id.
    pub fn new<S: Into<String>>(msg_type: S, data: T) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            timestamp: Some(now_millis()),
            id: Some(generate_message_id()),
        }
    }

    /// Create a message with only a type and payload.
    pub fn bare<S: Into<String>>(msg_type: S, data: T) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            timestamp: None,
            id: None,
        }
    }

    #[must_use]
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl<T: Serialize> Message<T> {
    /// Erase the payload type, producing the form the engine queues and sends.
    pub fn to_value(&self) -> Result<Message<Value>> {
        Ok(Message {
            msg_type: self.msg_type.clone(),
            data: serde_json::to_value(&self.data)?,
            timestamp: self.timestamp,
            id: self.id.clone(),
        })
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Message<Value> {
    /// Wrap an inbound frame that could not be parsed as an envelope.
    #[must_use]
    pub fn raw(data: Value) -> Self {
        Self {
            msg_type: RAW_TYPE.to_owned(),
            data,
            timestamp: Some(now_millis()),
            id: None,
        }
    }

    /// The default heartbeat envelope, `{"type":"ping","data":{}}`.
    #[must_use]
    pub fn ping() -> Self {
        Self::bare(PING_TYPE, Value::Object(serde_json::Map::new()))
    }

    /// Parse an inbound text frame. Anything that is not a valid envelope is wrapped as a
    /// [`RAW_TYPE`] message carrying the original text.
    #[must_use]
    pub fn from_frame(text: &str) -> Self {
        serde_json::from_str::<Value>(text)
            .ok()
            .filter(Value::is_object)
            .and_then(|value| crate::serde_helpers::deserialize_envelope(value).ok())
            .unwrap_or_else(|| Self::raw(Value::String(text.to_owned())))
    }

    /// Parse an inbound binary frame. UTF-8 payloads go through [`from_frame`](Self::from_frame);
    /// anything else becomes a [`RAW_TYPE`] message carrying the bytes as a JSON array.
    #[must_use]
    pub fn from_binary(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::from_frame(text),
            Err(_) => Self::raw(Value::Array(bytes.iter().map(|&b| Value::from(b)).collect())),
        }
    }

    /// Decode the payload into a concrete type.
    pub fn decode<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Return the type tag of a serialized envelope without decoding the rest of it.
    #[must_use]
    pub fn peek_type(text: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct Tag {
            #[serde(rename = "type")]
            msg_type: String,
        }

        serde_json::from_str::<Tag>(text).ok().map(|tag| tag.msg_type)
    }

    /// Whether this message is selected by a subscription filter.
    #[must_use]
    pub fn matches(&self, filter: &str) -> bool {
        filter == WILDCARD || filter == self.msg_type
    }
}
