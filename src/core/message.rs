use lapin::message::Delivery;
use lapin::BasicProperties;

/// The broker-side identity of a received message.
#[derive(Debug, Clone)]
pub struct DeliveryInfo {
    /// Monotonic within the channel the message arrived on.
    pub delivery_tag: u64,
    pub routing_key: String,
    pub exchange: String,
    pub redelivered: bool,
}

impl From<&Delivery> for DeliveryInfo {
    fn from(delivery: &Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key.to_string(),
            exchange: delivery.exchange.to_string(),
            redelivered: delivery.redelivered,
        }
    }
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl MessageBody {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            MessageBody::Json(value) => Some(value),
            MessageBody::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MessageBody::Binary(bytes) => Some(bytes),
            MessageBody::Json(_) => None,
        }
    }
}

/// What a handler receives: the delivery, its properties, the raw payload and
/// the body decoded by the consumer's serializer.
#[derive(Debug)]
pub struct Message {
    pub delivery: DeliveryInfo,
    pub properties: BasicProperties,
    pub payload: Vec<u8>,
    pub body: MessageBody,
}
