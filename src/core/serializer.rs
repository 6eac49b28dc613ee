use std::collections::HashMap;
use std::sync::Arc;

use crate::core::message::MessageBody;
use crate::helper::error_chain_fmt;

/// Encodes and decodes message bodies.
///
/// A serializer declares the content type it stamps on published messages and
/// whether its payloads are opaque bytes.
pub trait MessageSerializer: Send + Sync {
    fn content_type(&self) -> &'static str;

    /// True when the payload should be treated as raw bytes.
    fn binary(&self) -> bool;

    fn encode(&self, body: &MessageBody) -> Result<Vec<u8>, SerializationError>;

    fn decode(&self, payload: &[u8]) -> Result<MessageBody, SerializationError>;
}

/// `application/json` bodies via serde.
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn binary(&self) -> bool {
        false
    }

    fn encode(&self, body: &MessageBody) -> Result<Vec<u8>, SerializationError> {
        match body {
            MessageBody::Json(value) => {
                serde_json::to_vec(value).map_err(SerializationError::Encode)
            }
            MessageBody::Binary(_) => Err(SerializationError::UnsupportedBody {
                serializer: self.content_type(),
                body_kind: "binary",
            }),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<MessageBody, SerializationError> {
        serde_json::from_slice(payload)
            .map(MessageBody::Json)
            .map_err(SerializationError::Decode)
    }
}

/// Pass-through serializer for opaque payloads.
pub struct IdentitySerializer;

impl MessageSerializer for IdentitySerializer {
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    fn binary(&self) -> bool {
        true
    }

    fn encode(&self, body: &MessageBody) -> Result<Vec<u8>, SerializationError> {
        match body {
            MessageBody::Binary(bytes) => Ok(bytes.clone()),
            MessageBody::Json(_) => Err(SerializationError::UnsupportedBody {
                serializer: self.content_type(),
                body_kind: "json",
            }),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<MessageBody, SerializationError> {
        Ok(MessageBody::Binary(payload.to_vec()))
    }
}

/// Serializers known to the process, keyed by content type.
///
/// JSON is the default; the identity serializer is always registered so
/// opaque payloads can round-trip.
pub struct SerializerRegistry {
    default_serializer: Arc<dyn MessageSerializer>,
    by_content_type: HashMap<&'static str, Arc<dyn MessageSerializer>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        let json: Arc<dyn MessageSerializer> = Arc::new(JsonSerializer);
        let mut registry = Self {
            default_serializer: json.clone(),
            by_content_type: HashMap::new(),
        };
        registry.register(json);
        registry.register(Arc::new(IdentitySerializer));
        registry
    }

    pub fn with_default(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.register(serializer.clone());
        self.default_serializer = serializer;
        self
    }

    pub fn register(&mut self, serializer: Arc<dyn MessageSerializer>) {
        self.by_content_type
            .insert(serializer.content_type(), serializer);
    }

    pub fn default_serializer(&self) -> Arc<dyn MessageSerializer> {
        self.default_serializer.clone()
    }

    pub fn for_content_type(&self, content_type: &str) -> Option<Arc<dyn MessageSerializer>> {
        self.by_content_type.get(content_type).cloned()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(thiserror::Error)]
pub enum SerializationError {
    #[error("failed to encode message body")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message payload")]
    Decode(#[source] serde_json::Error),
    #[error("serializer {serializer} cannot handle {body_kind} bodies")]
    UnsupportedBody {
        serializer: &'static str,
        body_kind: &'static str,
    },
}

impl std::fmt::Debug for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
