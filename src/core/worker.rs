use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::{FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::configuration::{ConfigurationError, WorkerSettings, MAX_CONSUMER_TAG_BYTES};
use crate::core::acknowledgements::{
    AcknowledgementChain, AcknowledgementPolicy, NackOnAllFailures,
};
use crate::core::broker::{Broker, BrokerError};
use crate::core::channel_state::{ChannelState, ChannelStateError};
use crate::core::consumer::{
    ConsumerDescriptor, ConsumerRegistry, HandlerFactory, LoggingTracer, Tracer,
};
use crate::core::message::{DeliveryInfo, Message};
use crate::core::reporters::{
    report_handler_failure, ErrorReporter, HandlerFailure, LoggingReporter,
};
use crate::core::serializer::{MessageSerializer, SerializerRegistry};
use crate::core::waiter::{Action, ActionKind, InflightRegistry, ShutdownHandle, Waiter};
use crate::helper::error_chain_fmt;

const RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(1);

/// Invoked once, in registration order, after queues are declared and bound
/// but before any subscription starts.
pub type SetupCallback = Box<dyn FnOnce(&Broker) -> Result<(), anyhow::Error> + Send + Sync>;

/// Hosts the registered consumers against a connected broker.
///
/// `run` wires the signal handlers, declares and binds every enabled
/// consumer's queue, subscribes with manual acks, and then parks in the
/// waiter until a shutdown signal arrives. Dispatching happens on one task
/// per consumer; handler executions are pushed onto the runtime, bounded by
/// channel prefetch and the configured pool size.
pub struct Worker {
    broker: Arc<Broker>,
    consumers: Vec<ConsumerDescriptor>,
    settings: WorkerSettings,
    setup_callbacks: Vec<SetupCallback>,
    serializers: Arc<SerializerRegistry>,
    tracer: Arc<dyn Tracer>,
    reporters: Vec<Arc<dyn ErrorReporter>>,
    chain: AcknowledgementChain,
    waiter: Waiter,
    inflight: Arc<InflightRegistry>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl Worker {
    pub fn new(broker: Arc<Broker>, registry: ConsumerRegistry, settings: WorkerSettings) -> Self {
        let inflight = Arc::new(InflightRegistry::default());
        Self {
            broker,
            consumers: registry.descriptors().to_vec(),
            settings,
            setup_callbacks: Vec::new(),
            serializers: Arc::new(SerializerRegistry::new()),
            tracer: Arc::new(LoggingTracer),
            reporters: vec![Arc::new(LoggingReporter)],
            chain: AcknowledgementChain::default(),
            waiter: Waiter::new(inflight.clone()),
            inflight,
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Installs the failure policies, walked in order. A terminal
    /// `NackOnAllFailures` is appended so every failure gets answered.
    pub fn with_policies(mut self, mut policies: Vec<Arc<dyn AcknowledgementPolicy>>) -> Self {
        policies.push(Arc::new(NackOnAllFailures));
        self.chain = AcknowledgementChain::new(policies);
        self
    }

    pub fn with_reporters(mut self, reporters: Vec<Arc<dyn ErrorReporter>>) -> Self {
        self.reporters = reporters;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_serializers(mut self, serializers: SerializerRegistry) -> Self {
        self.serializers = Arc::new(serializers);
        self
    }

    pub fn add_setup_callback(mut self, callback: SetupCallback) -> Self {
        self.setup_callbacks.push(callback);
        self
    }

    /// Gracefully stops the worker without an OS signal.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.waiter.shutdown_handle()
    }

    /// Runs until a shutdown signal, then drains and disconnects. The
    /// connection is closed on every exit path.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let result = self.run_inner().await;
        self.broker.disconnect().await;
        result
    }

    async fn run_inner(&mut self) -> Result<(), WorkerError> {
        let signal_task = self.waiter.install_signal_handlers()?;

        let enabled = enabled_consumers(&self.settings, &self.consumers);
        if enabled.is_empty() {
            warn!("no consumers are enabled");
        }

        let mut prepared = Vec::with_capacity(enabled.len());
        for descriptor in enabled {
            prepared.push(self.prepare_consumer(descriptor).await?);
        }

        for callback in std::mem::take(&mut self.setup_callbacks) {
            callback(&self.broker).map_err(WorkerError::Setup)?;
        }

        for consumer in prepared {
            self.subscribe(consumer).await?;
        }

        let signal = self.waiter.wait(&self.chain).await;
        info!(signal, "worker leaving the wait loop");

        self.stop().await;
        signal_task.abort();
        Ok(())
    }

    /// Declares the namespaced queue and converges its bindings on this
    /// consumer's own channel.
    #[tracing::instrument(name = "Preparing consumer", skip(self, descriptor), fields(consumer = %descriptor.name))]
    async fn prepare_consumer(
        &self,
        descriptor: ConsumerDescriptor,
    ) -> Result<PreparedConsumer, WorkerError> {
        let consumer_tag = build_consumer_tag(&self.settings.consumer_tag_prefix)?;

        let channel_state = Arc::new(ChannelState::new(
            self.broker.connection(),
            self.broker.settings(),
            false,
        ));
        let channel = channel_state.channel().await?;

        let queue_name = self
            .broker
            .declare_queue(&channel, &descriptor.queue_name, descriptor.queue_arguments.clone())
            .await?;
        self.broker
            .bind_queue(&channel, &queue_name, &descriptor.routing_keys)
            .await?;

        Ok(PreparedConsumer {
            descriptor,
            channel_state,
            channel,
            queue_name,
            consumer_tag,
        })
    }

    async fn subscribe(&mut self, prepared: PreparedConsumer) -> Result<(), WorkerError> {
        // Manual acknowledgement always: no_ack stays false.
        let consumer = prepared
            .channel
            .basic_consume(
                &prepared.queue_name,
                &prepared.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            consumer = %prepared.descriptor.name,
            queue = %prepared.queue_name,
            consumer_tag = %prepared.consumer_tag,
            "consumer subscribed, waiting for messages"
        );

        let context = Arc::new(ConsumerContext {
            name: prepared.descriptor.name.clone(),
            queue_name: prepared.queue_name,
            consumer_tag: prepared.consumer_tag,
            serializer_override: prepared.descriptor.serializer.clone(),
            serializers: self.serializers.clone(),
            factory: prepared.descriptor.factory.clone(),
            tracer: self.tracer.clone(),
            reporters: self.reporters.clone(),
            actions: self.waiter.action_sender(),
            inflight: self.inflight.clone(),
            pool: Arc::new(Semaphore::new(self.settings.pool_size.max(1))),
            shutdown: self.shutdown.clone(),
            channel_state: prepared.channel_state,
        });

        self.tasks.spawn(dispatch_loop(context, consumer));
        Ok(())
    }

    /// Drains in-flight work: no new deliveries are dispatched, running
    /// handlers get up to the graceful-exit budget, stragglers are aborted,
    /// and acknowledgement actions already queued are flushed.
    async fn stop(&mut self) {
        self.shutdown.cancel();

        let grace = Duration::from_secs(self.settings.graceful_exit_timeout_secs);
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "graceful exit timeout reached, aborting remaining handlers"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        self.waiter.flush_actions(&self.chain).await;
    }
}

struct PreparedConsumer {
    descriptor: ConsumerDescriptor,
    channel_state: Arc<ChannelState>,
    channel: Channel,
    queue_name: String,
    consumer_tag: String,
}

struct ConsumerContext {
    name: String,
    queue_name: String,
    consumer_tag: String,
    serializer_override: Option<Arc<dyn MessageSerializer>>,
    serializers: Arc<SerializerRegistry>,
    factory: HandlerFactory,
    tracer: Arc<dyn Tracer>,
    reporters: Vec<Arc<dyn ErrorReporter>>,
    actions: mpsc::UnboundedSender<Action>,
    inflight: Arc<InflightRegistry>,
    pool: Arc<Semaphore>,
    shutdown: CancellationToken,
    channel_state: Arc<ChannelState>,
}

/// One loop per consumer: shutdown beats pending results beats new
/// deliveries, so no new work starts once a shutdown was requested.
async fn dispatch_loop(context: Arc<ConsumerContext>, mut consumer: lapin::Consumer) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = context.shutdown.cancelled() => break,

            Some(result) = handlers.join_next() => {
                if let Err(join_error) = result {
                    if join_error.is_panic() {
                        error!(consumer = %context.name, "handler task panicked");
                    }
                }
            }

            delivery = consumer.next() => match delivery {
                Some(Ok(delivery)) => {
                    let permit = match context.pool.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let context = context.clone();
                    handlers.spawn(async move {
                        let _permit = permit;
                        handle_delivery(context, delivery).await;
                    });
                }
                Some(Err(error)) => {
                    error!(?error, consumer = %context.name, "failed to receive delivery");
                }
                None => {
                    if context.shutdown.is_cancelled() {
                        break;
                    }
                    warn!(consumer = %context.name, "consumer stream ended, resubscribing");
                    tokio::time::sleep(RESUBSCRIBE_INTERVAL).await;
                    match resubscribe(&context).await {
                        Ok(renewed) => consumer = renewed,
                        Err(error) => {
                            error!(?error, consumer = %context.name, "failed to resubscribe");
                        }
                    }
                }
            }
        }
    }

    if context.channel_state.active().await {
        if let Ok(channel) = context.channel_state.channel().await {
            let _ = channel
                .basic_cancel(&context.consumer_tag, BasicCancelOptions::default())
                .await;
        }
    }

    if !handlers.is_empty() {
        info!(
            consumer = %context.name,
            in_flight = handlers.len(),
            "waiting for in-flight handlers"
        );
    }
    while let Some(result) = handlers.join_next().await {
        if let Err(join_error) = result {
            if join_error.is_panic() {
                error!(consumer = %context.name, "handler task panicked during drain");
            }
        }
    }
}

async fn resubscribe(context: &ConsumerContext) -> Result<lapin::Consumer, ChannelStateError> {
    let channel = context.channel_state.reconnect().await?;
    let consumer = channel
        .basic_consume(
            &context.queue_name,
            &context.consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(consumer)
}

/// Decodes, invokes the handler under the tracer, and enqueues exactly one
/// acknowledgement action for the delivery. The action goes onto the queue
/// before any reporter runs, so a misbehaving reporter cannot lose the
/// message.
async fn handle_delivery(context: Arc<ConsumerContext>, delivery: Delivery) {
    let delivery_info = DeliveryInfo::from(&delivery);
    let properties = delivery.properties.clone();
    let acker = delivery.acker.clone();

    let serializer = context.serializer_override.clone().unwrap_or_else(|| {
        properties
            .content_type()
            .as_ref()
            .and_then(|content_type| context.serializers.for_content_type(content_type.as_str()))
            .unwrap_or_else(|| context.serializers.default_serializer())
    });

    context.inflight.enter(&context.name);
    let (payload, result) = match serializer.decode(&delivery.data) {
        Ok(body) => {
            let message = Message {
                delivery: delivery_info.clone(),
                properties: properties.clone(),
                payload: delivery.data,
                body,
            };
            let handler = (context.factory)();
            let outcome =
                AssertUnwindSafe(context.tracer.call(&context.name, handler.as_ref(), &message))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("handler panicked")));
            (message.payload, outcome)
        }
        // A payload the serializer cannot read is a handler-level failure.
        Err(error) => (delivery.data, Err(anyhow::Error::new(error))),
    };
    context.inflight.exit(&context.name);

    match result {
        Ok(()) => {
            enqueue_action(
                &context,
                Action {
                    consumer: context.name.clone(),
                    delivery: delivery_info,
                    properties,
                    acker,
                    kind: ActionKind::Ack,
                },
            );
        }
        Err(error) => {
            let error = Arc::new(error);
            enqueue_action(
                &context,
                Action {
                    consumer: context.name.clone(),
                    delivery: delivery_info,
                    properties: properties.clone(),
                    acker,
                    kind: ActionKind::Nack(error.clone()),
                },
            );
            report_handler_failure(
                &context.reporters,
                &HandlerFailure {
                    consumer: &context.name,
                    properties: &properties,
                    payload: &payload,
                    error: error.as_ref(),
                },
            );
        }
    }
}

fn enqueue_action(context: &ConsumerContext, action: Action) {
    if context.actions.send(action).is_err() {
        error!(
            consumer = %context.name,
            "action channel closed, delivery left unacknowledged"
        );
    }
}

/// Unique subscription tag. The AMQP field is capped at 255 bytes, so an
/// over-long prefix is refused before any subscription is attempted.
fn build_consumer_tag(prefix: &str) -> Result<String, ConfigurationError> {
    let tag = format!("{}-{}", prefix, Uuid::new_v4());
    if tag.len() > MAX_CONSUMER_TAG_BYTES {
        return Err(ConfigurationError::ConsumerTagTooLong {
            tag_length: tag.len(),
        });
    }
    Ok(tag)
}

/// Applies consumer-group filtering.
///
/// With no group configured every consumer runs. A configured group enables
/// the consumers named in its `consumer_groups` entry or tagged with the
/// group; a group known to neither enables nothing.
fn enabled_consumers(
    settings: &WorkerSettings,
    descriptors: &[ConsumerDescriptor],
) -> Vec<ConsumerDescriptor> {
    let Some(group) = &settings.consumer_group else {
        return descriptors.to_vec();
    };

    let members = settings.consumer_groups.get(group);
    let tagged = descriptors
        .iter()
        .any(|descriptor| descriptor.group.as_deref() == Some(group.as_str()));
    if members.is_none() && !tagged {
        warn!(group = %group, "unknown consumer group, enabling no consumers");
        return Vec::new();
    }

    let members = members.cloned().unwrap_or_default();
    descriptors
        .iter()
        .filter(|descriptor| {
            members.contains(&descriptor.name)
                || descriptor.group.as_deref() == Some(group.as_str())
        })
        .cloned()
        .collect()
}

#[derive(thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Channel(#[from] ChannelStateError),
    #[error(transparent)]
    Protocol(#[from] lapin::Error),
    #[error("failed to install signal handlers")]
    Signals(#[from] std::io::Error),
    #[error("setup callback failed")]
    Setup(#[source] anyhow::Error),
}

impl std::fmt::Debug for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
