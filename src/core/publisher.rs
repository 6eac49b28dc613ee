use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lapin::options::BasicPublishOptions;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection};
use tracing::debug;
use uuid::Uuid;

use crate::configuration::AmqpSettings;
use crate::core::channel_state::{ChannelState, ChannelStateError};
use crate::core::message::MessageBody;
use crate::core::serializer::{MessageSerializer, SerializationError, SerializerRegistry};
use crate::helper::error_chain_fmt;

/// Publish-side message properties.
///
/// Unset fields are simply not sent; merging overlays later sources over
/// earlier ones field by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in stringified milliseconds; also selects the wait
    /// exchange on delayed publishes.
    pub expiration: Option<String>,
    pub timestamp: Option<u64>,
    pub persistent: Option<bool>,
    pub priority: Option<u8>,
    pub app_id: Option<String>,
    pub headers: Option<FieldTable>,
}

impl MessageProperties {
    /// Returns `self` with every field set on `overlay` taking precedence.
    pub fn overridden_by(mut self, overlay: &MessageProperties) -> MessageProperties {
        macro_rules! take {
            ($field:ident) => {
                if overlay.$field.is_some() {
                    self.$field = overlay.$field.clone();
                }
            };
        }
        take!(content_type);
        take!(message_id);
        take!(correlation_id);
        take!(reply_to);
        take!(expiration);
        take!(timestamp);
        take!(persistent);
        take!(priority);
        take!(app_id);
        take!(headers);
        self
    }

    fn into_basic(self) -> BasicProperties {
        let mut properties = BasicProperties::default();
        if let Some(content_type) = self.content_type {
            properties = properties.with_content_type(content_type.into());
        }
        if let Some(message_id) = self.message_id {
            properties = properties.with_message_id(message_id.into());
        }
        if let Some(correlation_id) = self.correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }
        if let Some(reply_to) = self.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }
        if let Some(expiration) = self.expiration {
            properties = properties.with_expiration(expiration.into());
        }
        if let Some(timestamp) = self.timestamp {
            properties = properties.with_timestamp(timestamp);
        }
        if let Some(persistent) = self.persistent {
            properties = properties.with_delivery_mode(if persistent { 2 } else { 1 });
        }
        if let Some(priority) = self.priority {
            properties = properties.with_priority(priority);
        }
        if let Some(app_id) = self.app_id {
            properties = properties.with_app_id(app_id.into());
        }
        if let Some(headers) = self.headers {
            properties = properties.with_headers(headers);
        }
        properties
    }
}

/// Properties stamped on every outgoing message, either a fixed set or a
/// closure evaluated at each publish.
#[derive(Clone)]
pub enum GlobalProperties {
    Static(MessageProperties),
    Dynamic(Arc<dyn Fn() -> MessageProperties + Send + Sync>),
}

impl GlobalProperties {
    fn evaluate(&self) -> MessageProperties {
        match self {
            GlobalProperties::Static(properties) => properties.clone(),
            GlobalProperties::Dynamic(produce) => produce(),
        }
    }
}

impl std::fmt::Debug for GlobalProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GlobalProperties::Static(properties) => {
                f.debug_tuple("Static").field(properties).finish()
            }
            GlobalProperties::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

#[derive(Default)]
pub struct PublishOptions {
    /// Overrides the configured default serializer for this call.
    pub serializer: Option<Arc<dyn MessageSerializer>>,
}

enum Target {
    Main,
    Wait,
}

/// Publishes to the main exchange, or to the wait exchange family for
/// delayed delivery. Callable from any task; channel acquisition is
/// internal.
pub struct Publisher {
    connection: Arc<Connection>,
    channel_state: ChannelState,
    serializers: SerializerRegistry,
    confirm_forced: bool,
    confirm_timeout: Duration,
    global_properties: Option<GlobalProperties>,
}

impl Publisher {
    pub fn new(
        connection: Arc<Connection>,
        settings: &AmqpSettings,
        serializers: SerializerRegistry,
        global_properties: Option<GlobalProperties>,
    ) -> Self {
        Self {
            channel_state: ChannelState::new(connection.clone(), settings, true),
            connection,
            serializers,
            confirm_forced: settings.force_publisher_confirms,
            confirm_timeout: Duration::from_millis(settings.confirm_timeout_ms),
            global_properties,
        }
    }

    /// Publishes `body` to the main exchange under `routing_key`.
    #[tracing::instrument(name = "Publishing message", skip(self, body, properties, options))]
    pub async fn publish(
        &self,
        routing_key: &str,
        body: &MessageBody,
        properties: MessageProperties,
        options: &PublishOptions,
    ) -> Result<(), PublishError> {
        self.publish_to(Target::Main, routing_key, body, properties, options)
            .await
    }

    /// Publishes to the wait exchange selected by the merged `expiration`
    /// property, declaring it on demand; without an expiration the default
    /// fanout wait exchange is used. The broker dead-letters the message back
    /// onto the main exchange once the TTL elapses.
    #[tracing::instrument(name = "Publishing delayed message", skip(self, body, properties, options))]
    pub async fn publish_wait(
        &self,
        routing_key: &str,
        body: &MessageBody,
        properties: MessageProperties,
        options: &PublishOptions,
    ) -> Result<(), PublishError> {
        self.publish_to(Target::Wait, routing_key, body, properties, options)
            .await
    }

    async fn publish_to(
        &self,
        target: Target,
        routing_key: &str,
        body: &MessageBody,
        properties: MessageProperties,
        options: &PublishOptions,
    ) -> Result<(), PublishError> {
        if !self.connection.status().connected() {
            return Err(PublishError::NotConnected);
        }

        let serializer = options
            .serializer
            .clone()
            .unwrap_or_else(|| self.serializers.default_serializer());
        let payload = serializer.encode(body)?;

        let merged = compose_properties(
            properties,
            self.global_properties.as_ref(),
            serializer.content_type(),
            Utc::now().timestamp() as u64,
        );

        let exchange = match target {
            Target::Main => self.channel_state.exchange_name().to_string(),
            Target::Wait => {
                self.channel_state
                    .wait_exchange_for(merged.expiration.as_deref())
                    .await?
            }
        };

        let channel = self.channel_state.channel().await?;
        let confirm = channel
            .basic_publish(
                &exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                merged.into_basic(),
            )
            .await?;

        if self.confirm_forced {
            let confirmation = tokio::time::timeout(self.confirm_timeout, confirm)
                .await
                .map_err(|_| PublishError::ConfirmTimeout {
                    elapsed_ms: self.confirm_timeout.as_millis() as u64,
                })??;
            if !confirmation.is_ack() {
                return Err(PublishError::Rejected);
            }
        }

        debug!(exchange = %exchange, routing_key = %routing_key, "message published");
        Ok(())
    }
}

/// Applies the fixed merge order: `{persistent: true}` → caller properties →
/// global properties → the non-overridable timestamp and content type.
/// `message_id` defaults to a fresh UUIDv4 when nothing set one.
fn compose_properties(
    caller: MessageProperties,
    global: Option<&GlobalProperties>,
    content_type: &str,
    timestamp: u64,
) -> MessageProperties {
    let mut merged = MessageProperties {
        persistent: Some(true),
        ..Default::default()
    }
    .overridden_by(&caller);

    if let Some(global) = global {
        merged = merged.overridden_by(&global.evaluate());
    }

    merged.timestamp = Some(timestamp);
    merged.content_type = Some(content_type.to_string());
    if merged.message_id.is_none() {
        merged.message_id = Some(Uuid::new_v4().to_string());
    }

    merged
}

#[derive(thiserror::Error)]
pub enum PublishError {
    #[error("cannot publish without an open connection")]
    NotConnected,
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Channel(#[from] ChannelStateError),
    #[error(transparent)]
    Protocol(#[from] lapin::Error),
    #[error("broker did not confirm the publish within {elapsed_ms}ms")]
    ConfirmTimeout { elapsed_ms: u64 },
    #[error("broker negatively confirmed the publish")]
    Rejected,
}

impl std::fmt::Debug for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
