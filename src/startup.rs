use std::sync::Arc;

use tracing::info;

use crate::configuration::Settings;
use crate::core::broker::{Broker, BrokerOptions, ConnectionError};
use crate::core::consumer::ConsumerRegistry;
use crate::core::waiter::ShutdownHandle;
use crate::core::worker::{Worker, WorkerError};
use crate::helper::error_chain_fmt;

/// Holds the connected broker and the worker hosting the registered
/// consumers.
pub struct Application {
    broker: Arc<Broker>,
    worker: Worker,
}

impl Application {
    #[tracing::instrument(name = "Building worker application", skip(settings, registry, options))]
    pub async fn build(
        settings: Settings,
        registry: ConsumerRegistry,
        options: BrokerOptions,
    ) -> Result<Self, ApplicationError> {
        let broker = Broker::connect(&settings.amqp, options).await?;
        let worker = Worker::new(broker.clone(), registry, settings.worker);
        Ok(Self { broker, worker })
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.worker.shutdown_handle()
    }

    /// Maps over the worker so callers can attach policies, reporters, a
    /// tracer or setup callbacks before running.
    pub fn configure_worker(mut self, configure: impl FnOnce(Worker) -> Worker) -> Self {
        self.worker = configure(self.worker);
        self
    }

    /// Runs the worker until a shutdown signal; the connection is closed on
    /// every exit path.
    ///
    /// self is moved so the application cannot be reused after it stopped.
    pub async fn run_until_stopped(self) -> Result<(), ApplicationError> {
        self.worker.run().await?;
        info!("👋 Bye!");
        Ok(())
    }
}

#[derive(thiserror::Error)]
pub enum ApplicationError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl std::fmt::Debug for ApplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
