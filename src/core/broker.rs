use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lapin::options::{QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::configuration::{AmqpSettings, ConfigurationError};
use crate::core::channel_state::{is_precondition_failed, ChannelStateError};
use crate::core::management::{ManagementClient, ManagementError};
use crate::core::publisher::{GlobalProperties, Publisher};
use crate::core::reporters::{report_connection_error, ErrorReporter};
use crate::core::serializer::SerializerRegistry;
use crate::helper::error_chain_fmt;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Everything optional about opening the broker.
#[derive(Default)]
pub struct BrokerOptions {
    pub reporters: Vec<Arc<dyn ErrorReporter>>,
    pub global_properties: Option<GlobalProperties>,
    pub serializers: Option<SerializerRegistry>,
}

/// Owner of the process-wide AMQP connection.
///
/// Declares namespaced queues, converges their bindings, and hands out the
/// publisher. At most one connection is open per process; connecting retries
/// at a fixed one-second interval.
pub struct Broker {
    connection: Arc<Connection>,
    settings: AmqpSettings,
    management: Option<ManagementClient>,
    publisher: Arc<Publisher>,
    namespace_prefix: Option<String>,
    declared_queues: Mutex<HashSet<String>>,
}

impl Broker {
    /// Opens the connection, optionally checks the management API
    /// credentials, and builds the publisher.
    #[tracing::instrument(name = "Connecting to AMQP broker", skip(settings, options))]
    pub async fn connect(
        settings: &AmqpSettings,
        options: BrokerOptions,
    ) -> Result<Arc<Broker>, ConnectionError> {
        let uri = settings.amqp_uri()?;

        let mut attempt: u32 = 0;
        let connection = loop {
            match Connection::connect_uri(uri.clone(), settings.connection_properties()).await {
                Ok(connection) => break connection,
                Err(error) => {
                    attempt += 1;
                    if attempt >= settings.connection_retries {
                        return Err(ConnectionError::Unreachable {
                            attempts: attempt,
                            source: error,
                        });
                    }
                    warn!(
                        attempt,
                        max_attempts = settings.connection_retries,
                        error = %error,
                        "failed to connect to broker, retrying"
                    );
                    sleep(RECONNECT_INTERVAL).await;
                }
            }
        };
        info!(host = %uri.authority.host, vhost = %uri.vhost, "connected to broker");

        let reporters = options.reporters;
        if !reporters.is_empty() {
            let hook_reporters = reporters.clone();
            connection.on_error(move |error| {
                report_connection_error(&hook_reporters, &error);
            });
        }

        let management = match &settings.management_api {
            Some(api) => {
                let client = ManagementClient::new(api, &uri.vhost);
                client.verify_credentials().await?;
                Some(client)
            }
            None => None,
        };

        let connection = Arc::new(connection);
        let publisher = Arc::new(Publisher::new(
            connection.clone(),
            settings,
            options.serializers.unwrap_or_default(),
            options.global_properties,
        ));

        Ok(Arc::new(Broker {
            connection,
            settings: settings.clone(),
            management,
            publisher,
            namespace_prefix: settings.namespace_prefix(),
            declared_queues: Mutex::new(HashSet::new()),
        }))
    }

    /// Runs `scope` against a freshly connected broker and disconnects on
    /// every exit path.
    pub async fn with_connection<F, Fut, T, E>(
        settings: &AmqpSettings,
        options: BrokerOptions,
        scope: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Arc<Broker>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ConnectionError>,
    {
        let broker = Broker::connect(settings, options).await?;
        let result = scope(broker.clone()).await;
        broker.disconnect().await;
        result
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.connection.clone()
    }

    pub fn settings(&self) -> &AmqpSettings {
        &self.settings
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn exchange_name(&self) -> &str {
        &self.settings.exchange_name
    }

    /// Applies the namespace prefix to a queue name.
    pub fn queue_name(&self, name: &str) -> String {
        match &self.namespace_prefix {
            Some(prefix) => format!("{}:{}", prefix, name),
            None => name.to_string(),
        }
    }

    /// Declares a durable queue under its namespaced name, passing the
    /// caller's arguments through verbatim. Registering the same queue twice
    /// is a configuration error.
    #[tracing::instrument(name = "Declaring queue", skip(self, channel, arguments))]
    pub async fn declare_queue(
        &self,
        channel: &Channel,
        name: &str,
        arguments: FieldTable,
    ) -> Result<String, BrokerError> {
        let queue_name = self.queue_name(name);

        {
            let mut declared = self
                .declared_queues
                .lock()
                .expect("declared queue set poisoned");
            if !declared.insert(queue_name.clone()) {
                return Err(ConfigurationError::DuplicateQueue(queue_name).into());
            }
        }

        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|error| {
                if is_precondition_failed(&error) {
                    BrokerError::Channel(ChannelStateError::Precondition {
                        subject: format!("queue {}", queue_name),
                        source: error,
                    })
                } else {
                    BrokerError::Protocol(error)
                }
            })?;

        info!(queue = %queue_name, "queue declared");
        Ok(queue_name)
    }

    /// Converges the queue's bindings on the main exchange to exactly
    /// `routing_keys`: stale keys found through the management API are
    /// unbound first, then every desired key is bound. Without the API the
    /// operation is additive only.
    #[tracing::instrument(name = "Binding queue", skip(self, channel))]
    pub async fn bind_queue(
        &self,
        channel: &Channel,
        queue_name: &str,
        routing_keys: &[String],
    ) -> Result<(), BrokerError> {
        if let Some(management) = &self.management {
            let existing = management.queue_bindings(queue_name).await?;
            for stale in stale_routing_keys(&existing, routing_keys, self.exchange_name()) {
                warn!(queue = %queue_name, routing_key = %stale, "unbinding stale routing key");
                channel
                    .queue_unbind(
                        queue_name,
                        self.exchange_name(),
                        &stale,
                        FieldTable::default(),
                    )
                    .await?;
            }
        }

        for routing_key in routing_keys {
            channel
                .queue_bind(
                    queue_name,
                    self.exchange_name(),
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        info!(queue = %queue_name, routing_keys = ?routing_keys, "queue bound");
        Ok(())
    }

    /// Closes the connection. Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.connection.status().connected() {
            if let Err(error) = self.connection.close(200, "worker shutdown").await {
                error!(?error, "failed to close AMQP connection");
            } else {
                info!("AMQP connection closed");
            }
        }
    }
}

/// Routing keys bound to the queue on the main exchange that are no longer
/// wanted.
fn stale_routing_keys(
    existing: &[crate::core::management::BindingInfo],
    desired: &[String],
    exchange: &str,
) -> Vec<String> {
    existing
        .iter()
        .filter(|binding| binding.source == exchange)
        .filter(|binding| !desired.contains(&binding.routing_key))
        .map(|binding| binding.routing_key.clone())
        .collect()
}

#[derive(thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("could not reach the broker after {attempts} attempts")]
    Unreachable {
        attempts: u32,
        #[source]
        source: lapin::Error,
    },
    #[error(transparent)]
    Management(#[from] ManagementError),
}

impl std::fmt::Debug for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Channel(#[from] ChannelStateError),
    #[error(transparent)]
    Protocol(#[from] lapin::Error),
    #[error(transparent)]
    Management(#[from] ManagementError),
}

impl std::fmt::Debug for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
