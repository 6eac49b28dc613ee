use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use lapin::types::FieldTable;
use tracing::{error, info, info_span, Instrument};

use crate::core::message::Message;
use crate::core::serializer::MessageSerializer;
use crate::helper::error_chain_fmt;

/// User code invoked for each delivery.
///
/// A fresh handler is constructed per delivery by the descriptor's factory,
/// so handlers may hold per-message state. Handlers must be idempotent: after
/// a connection loss the broker redelivers anything unacknowledged.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), anyhow::Error>;
}

pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Wraps every handler invocation; the default implementation opens a span
/// and records the outcome and timing.
#[async_trait]
pub trait Tracer: Send + Sync {
    async fn call(
        &self,
        consumer: &str,
        handler: &dyn Handler,
        message: &Message,
    ) -> Result<(), anyhow::Error>;
}

pub struct LoggingTracer;

#[async_trait]
impl Tracer for LoggingTracer {
    async fn call(
        &self,
        consumer: &str,
        handler: &dyn Handler,
        message: &Message,
    ) -> Result<(), anyhow::Error> {
        let started = Instant::now();
        let result = handler
            .handle(message)
            .instrument(info_span!(
                "Handling consumed message",
                consumer = %consumer,
                routing_key = %message.delivery.routing_key,
                delivery_tag = message.delivery.delivery_tag,
            ))
            .await;

        match &result {
            Ok(()) => info!(
                consumer = %consumer,
                delivery_tag = message.delivery.delivery_tag,
                elapsed = ?started.elapsed(),
                "handler finished"
            ),
            Err(error) => error!(
                consumer = %consumer,
                delivery_tag = message.delivery.delivery_tag,
                elapsed = ?started.elapsed(),
                ?error,
                "handler failed"
            ),
        }
        result
    }
}

/// Invokes the handler with no wrapping at all.
pub struct NullTracer;

#[async_trait]
impl Tracer for NullTracer {
    async fn call(
        &self,
        _consumer: &str,
        handler: &dyn Handler,
        message: &Message,
    ) -> Result<(), anyhow::Error> {
        handler.handle(message).await
    }
}

/// Immutable description of one consumer, fixed at registration time.
#[derive(Clone)]
pub struct ConsumerDescriptor {
    /// Name used for logging and consumer-group filtering.
    pub name: String,
    /// Queue name before the namespace prefix is applied.
    pub queue_name: String,
    /// Topic patterns the queue is bound with, in registration order.
    pub routing_keys: Vec<String>,
    /// Overrides the content-type based serializer selection.
    pub serializer: Option<Arc<dyn MessageSerializer>>,
    /// Passed verbatim to the queue declaration (quorum queues, DLX, ...).
    pub queue_arguments: FieldTable,
    pub group: Option<String>,
    pub factory: HandlerFactory,
}

impl ConsumerDescriptor {
    pub fn new(
        name: impl Into<String>,
        queue_name: impl Into<String>,
        routing_keys: Vec<String>,
        factory: HandlerFactory,
    ) -> Self {
        Self {
            name: name.into(),
            queue_name: queue_name.into(),
            routing_keys,
            serializer: None,
            queue_arguments: FieldTable::default(),
            group: None,
            factory,
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn with_queue_arguments(mut self, arguments: FieldTable) -> Self {
        self.queue_arguments = arguments;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl std::fmt::Debug for ConsumerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerDescriptor")
            .field("name", &self.name)
            .field("queue_name", &self.queue_name)
            .field("routing_keys", &self.routing_keys)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// The process-wide list of consumers, built once before the worker runs.
pub struct ConsumerRegistry {
    descriptors: Vec<ConsumerDescriptor>,
}

impl ConsumerRegistry {
    pub fn builder() -> ConsumerRegistryBuilder {
        ConsumerRegistryBuilder {
            descriptors: Vec::new(),
        }
    }

    pub fn descriptors(&self) -> &[ConsumerDescriptor] {
        &self.descriptors
    }
}

pub struct ConsumerRegistryBuilder {
    descriptors: Vec<ConsumerDescriptor>,
}

impl ConsumerRegistryBuilder {
    pub fn register(mut self, descriptor: ConsumerDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Freezes the registration order into an immutable registry.
    pub fn build(self) -> Result<ConsumerRegistry, RegistryError> {
        let mut queue_names = std::collections::HashSet::new();
        for descriptor in &self.descriptors {
            if !queue_names.insert(descriptor.queue_name.clone()) {
                return Err(RegistryError::DuplicateQueue(descriptor.queue_name.clone()));
            }
        }
        Ok(ConsumerRegistry {
            descriptors: self.descriptors,
        })
    }
}

#[derive(thiserror::Error)]
pub enum RegistryError {
    #[error("queue {0} is registered by more than one consumer")]
    DuplicateQueue(String),
}

impl std::fmt::Debug for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
