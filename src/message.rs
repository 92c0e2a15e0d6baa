//! Message envelope definitions
//!
//! A message carries a routing `name` and an arbitrary JSON `content`.
//! Only those two fields travel on the wire; sender and route are stamped
//! by the client handle and consumed by the broker.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::BrokerError;
use crate::types::{ClientId, RoomId};

/// Message content
///
/// Either a decoded JSON value, or raw bytes that could not be decoded
/// when the message was built. Raw bytes go on the wire as a base64 string.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Value(Value),
    Raw(Vec<u8>),
}

impl Content {
    /// Encode this content as JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(BrokerError::Encoding)
    }
}

impl Serialize for Content {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Content::Value(value) => value.serialize(serializer),
            Content::Raw(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
        }
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        Content::Value(value)
    }
}

/// Already-encoded bytes are decoded when possible and kept raw otherwise
impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Content::Value(value),
            Err(_) => Content::Raw(bytes),
        }
    }
}

impl From<&[u8]> for Content {
    fn from(bytes: &[u8]) -> Self {
        Content::from(bytes.to_vec())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Value(Value::String(text))
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Value(Value::String(text.to_string()))
    }
}

/// Where a message is headed
///
/// A message is unicast or broadcast, never both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Route {
    /// Freshly built, not yet submitted
    #[default]
    Unrouted,
    /// Delivered to one client
    Unicast(ClientId),
    /// Delivered to every distinct member of these rooms, in order
    Broadcast(Vec<RoomId>),
}

/// Application message
#[derive(Debug, Clone)]
pub struct Message {
    name: String,
    content: Content,
    sender: Option<ClientId>,
    route: Route,
}

/// Wire shape sent to clients
#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    name: &'a str,
    content: &'a Content,
}

/// Wire shape received from clients
#[derive(Deserialize)]
struct InboundEnvelope {
    name: String,
    #[serde(default)]
    content: Value,
}

impl Message {
    /// Create a new message
    ///
    /// Byte content is decoded as JSON on a best-effort basis.
    pub fn new(name: impl Into<String>, content: impl Into<Content>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            sender: None,
            route: Route::Unrouted,
        }
    }

    /// Create a message from any serializable value
    pub fn json<T: Serialize + ?Sized>(
        name: impl Into<String>,
        content: &T,
    ) -> Result<Self, BrokerError> {
        let value = serde_json::to_value(content).map_err(BrokerError::Encoding)?;
        Ok(Self::new(name, value))
    }

    /// Parse a received frame into a message
    pub fn from_frame(frame: &[u8]) -> Result<Self, BrokerError> {
        let envelope: InboundEnvelope =
            serde_json::from_slice(frame).map_err(BrokerError::Decoding)?;
        Ok(Self::new(envelope.name, envelope.content))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    /// The client that submitted this message, once routed
    pub fn sender(&self) -> Option<&ClientId> {
        self.sender.as_ref()
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Unicast recipient, if any
    pub fn recipient(&self) -> Option<&ClientId> {
        match &self.route {
            Route::Unicast(recipient) => Some(recipient),
            _ => None,
        }
    }

    /// Broadcast target rooms (empty unless broadcast)
    pub fn target_rooms(&self) -> &[RoomId] {
        match &self.route {
            Route::Broadcast(rooms) => rooms,
            _ => &[],
        }
    }

    /// Encode the content alone, as handed to message listeners
    pub fn serialize_payload(&self) -> Result<Vec<u8>, BrokerError> {
        self.content.to_bytes()
    }

    /// Encode the `{name, content}` envelope as a text frame
    pub fn to_frame(&self) -> Result<String, BrokerError> {
        let envelope = OutboundEnvelope {
            name: &self.name,
            content: &self.content,
        };
        serde_json::to_string(&envelope).map_err(BrokerError::Encoding)
    }

    pub(crate) fn into_unicast(mut self, sender: ClientId, recipient: ClientId) -> Self {
        self.sender = Some(sender);
        self.route = Route::Unicast(recipient);
        self
    }

    pub(crate) fn into_broadcast(mut self, sender: ClientId, rooms: Vec<RoomId>) -> Self {
        self.sender = Some(sender);
        self.route = Route::Broadcast(rooms);
        self
    }
}
