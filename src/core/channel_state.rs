use std::collections::HashSet;
use std::sync::Arc;

use lapin::options::{
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ExchangeKind};
use tokio::sync::RwLock;
use tracing::info;

use crate::configuration::{AmqpSettings, ConfigurationError};
use crate::helper::error_chain_fmt;

const PRECONDITION_FAILED: u16 = 406;

/// The per-task channel holder.
///
/// Each consumer owns one, and the publisher owns one; a channel is never
/// shared between them. Opening a channel sets prefetch, switches on confirm
/// mode when configured, and declares the main topic exchange (plus the wait
/// exchanges when this holder is the publishing side). A lost channel is
/// reopened and redeclared transparently by the accessors.
pub struct ChannelState {
    connection: Arc<Connection>,
    exchange_name: String,
    exchange_options: ExchangeDeclareOptions,
    prefetch_count: u16,
    confirm_mode: bool,
    wait: Option<WaitScheme>,
    channel: RwLock<Option<Channel>>,
    declared_wait: RwLock<HashSet<String>>,
}

/// Naming of the delayed-delivery exchange family.
struct WaitScheme {
    exchange_base: String,
    queue_base: String,
    eager_suffixes: Vec<String>,
}

impl WaitScheme {
    fn exchange_name(&self, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}-{}", self.exchange_base, suffix),
            None => self.exchange_base.clone(),
        }
    }

    fn queue_name(&self, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}-{}", self.queue_base, suffix),
            None => self.queue_base.clone(),
        }
    }
}

impl ChannelState {
    /// `declare_wait` is set on the publishing channel only; consumer
    /// channels have no business declaring the wait family.
    pub fn new(connection: Arc<Connection>, settings: &AmqpSettings, declare_wait: bool) -> Self {
        let wait = if declare_wait {
            settings
                .wait_exchange_name
                .as_ref()
                .map(|exchange_base| WaitScheme {
                    exchange_base: exchange_base.clone(),
                    queue_base: settings
                        .wait_queue_name
                        .clone()
                        .unwrap_or_else(|| format!("{}-queue", exchange_base)),
                    eager_suffixes: settings.wait_expiration_suffixes.clone(),
                })
        } else {
            None
        };

        Self {
            connection,
            exchange_name: settings.exchange_name.clone(),
            exchange_options: ExchangeDeclareOptions {
                durable: true,
                auto_delete: settings.exchange_options.auto_delete,
                internal: settings.exchange_options.internal,
                ..Default::default()
            },
            prefetch_count: settings.prefetch_count,
            confirm_mode: settings.confirms_enabled(),
            wait,
            channel: RwLock::new(None),
            declared_wait: RwLock::new(HashSet::new()),
        }
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// True iff a channel is held and the adapter reports it open.
    pub async fn active(&self) -> bool {
        match self.channel.read().await.as_ref() {
            Some(channel) => channel.status().connected(),
            None => false,
        }
    }

    /// The held channel, reopening it first if it was lost.
    pub async fn channel(&self) -> Result<Channel, ChannelStateError> {
        if let Some(channel) = self.channel.read().await.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        self.reconnect().await
    }

    /// Closes the held channel if still active, drops every cached handle and
    /// reopens + redeclares.
    pub async fn reconnect(&self) -> Result<Channel, ChannelStateError> {
        let mut guard = self.channel.write().await;
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        if let Some(stale) = guard.take() {
            // The channel may already be gone server-side.
            let _ = stale.close(200, "reopening channel").await;
        }
        self.declared_wait.write().await.clear();

        let channel = self.open().await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    #[tracing::instrument(name = "Opening AMQP channel", skip(self), fields(exchange = %self.exchange_name))]
    async fn open(&self) -> Result<Channel, ChannelStateError> {
        let channel = self.connection.create_channel().await?;

        // 0 means unlimited prefetch.
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await?;

        if self.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }

        channel
            .exchange_declare(
                &self.exchange_name,
                ExchangeKind::Topic,
                self.exchange_options,
                FieldTable::default(),
            )
            .await
            .map_err(|error| declare_error(error, format!("exchange {}", self.exchange_name)))?;

        if let Some(wait) = &self.wait {
            self.declare_wait_pair(&channel, None).await?;
            for suffix in &wait.eager_suffixes {
                self.declare_wait_pair(&channel, Some(suffix)).await?;
            }
        }

        info!(exchange = %self.exchange_name, "channel open, exchange declared");
        Ok(channel)
    }

    /// Resolves the wait exchange for an expiration value, declaring it on
    /// demand the first time that expiration is seen.
    pub async fn wait_exchange_for(
        &self,
        expiration: Option<&str>,
    ) -> Result<String, ChannelStateError> {
        let wait = self
            .wait
            .as_ref()
            .ok_or(ConfigurationError::WaitExchangeNotConfigured)?;

        let key = expiration.unwrap_or_default().to_string();
        if !self.declared_wait.read().await.contains(&key) {
            let channel = self.channel().await?;
            self.declare_wait_pair(&channel, expiration).await?;
        }

        Ok(wait.exchange_name(expiration))
    }

    /// Declares one fanout wait exchange and its single bound queue, which
    /// dead-letters expired messages back onto the main exchange with their
    /// original routing key.
    async fn declare_wait_pair(
        &self,
        channel: &Channel,
        suffix: Option<&str>,
    ) -> Result<(), ChannelStateError> {
        let wait = self
            .wait
            .as_ref()
            .ok_or(ConfigurationError::WaitExchangeNotConfigured)?;

        let exchange = wait.exchange_name(suffix);
        let queue = wait.queue_name(suffix);

        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|error| declare_error(error, format!("wait exchange {}", exchange)))?;

        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.exchange_name.as_str().into()),
        );
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|error| declare_error(error, format!("wait queue {}", queue)))?;

        channel
            .queue_bind(
                &queue,
                &exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        self.declared_wait
            .write()
            .await
            .insert(suffix.unwrap_or_default().to_string());

        info!(exchange = %exchange, queue = %queue, "wait exchange declared");
        Ok(())
    }
}

/// Re-declaring with incompatible arguments closes the channel with a 406;
/// that is a deployment mismatch and is surfaced, never retried.
pub(crate) fn is_precondition_failed(error: &lapin::Error) -> bool {
    matches!(error, lapin::Error::ProtocolError(e) if e.get_id() == PRECONDITION_FAILED)
}

fn declare_error(error: lapin::Error, subject: String) -> ChannelStateError {
    if is_precondition_failed(&error) {
        ChannelStateError::Precondition {
            subject,
            source: error,
        }
    } else {
        ChannelStateError::Protocol(error)
    }
}

#[derive(thiserror::Error)]
pub enum ChannelStateError {
    #[error("{subject} is already declared with incompatible arguments")]
    Precondition {
        subject: String,
        #[source]
        source: lapin::Error,
    },
    #[error(transparent)]
    Protocol(#[from] lapin::Error),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl std::fmt::Debug for ChannelStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
