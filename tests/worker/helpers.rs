use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use secrecy::Secret;
use tokio::task::JoinHandle;
use uuid::Uuid;

use amqp_worker::configuration::{
    AmqpSettings, ExchangeOptions, ManagementApiSettings, Settings, WorkerSettings,
};
use amqp_worker::core::broker::{Broker, BrokerOptions};
use amqp_worker::core::consumer::ConsumerRegistry;
use amqp_worker::core::waiter::ShutdownHandle;
use amqp_worker::core::worker::Worker;
use amqp_worker::startup::{Application, ApplicationError};
use amqp_worker::telemetry::{get_tracing_subscriber, init_tracing_subscriber};

// Ensures that the `tracing` stack is only initialized once
static TRACING: Lazy<()> = Lazy::new(|| {
    let default_filter_level = "info".to_string();
    let subscriber_name = "worker_tests".to_string();

    if std::env::var("TEST_LOG").is_ok() {
        let subscriber =
            get_tracing_subscriber(subscriber_name, default_filter_level, std::io::stdout);
        init_tracing_subscriber(subscriber);
    } else {
        let subscriber =
            get_tracing_subscriber(subscriber_name, default_filter_level, std::io::sink);
        init_tracing_subscriber(subscriber);
    };
});

/// Checks whether a RabbitMQ broker is reachable on localhost.
///
/// Tests call this first and skip themselves when no broker is around, so
/// the suite stays green on machines without the docker setup.
pub async fn rabbitmq_available() -> bool {
    tokio::time::timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect("127.0.0.1:5672"),
    )
    .await
    .map(|result| result.is_ok())
    .unwrap_or(false)
}

/// The management API needs the management plugin; probe it separately.
pub async fn management_api_available() -> bool {
    let client = reqwest::Client::new();
    let result = client
        .get("http://localhost:15672/api/overview")
        .basic_auth("guest", Some("guest"))
        .timeout(Duration::from_secs(2))
        .send()
        .await;

    match result {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Randomized settings so every test works against its own exchange family
/// and queue namespace.
pub fn test_settings(with_management_api: bool) -> Settings {
    let run_id = Uuid::new_v4().simple().to_string();

    Settings {
        worker: WorkerSettings {
            consumer_tag_prefix: format!("test-{}", &run_id[..8]),
            pool_size: 4,
            graceful_exit_timeout_secs: 5,
            consumer_group: None,
            consumer_groups: HashMap::new(),
        },
        amqp: AmqpSettings {
            uri: None,
            host: "localhost".into(),
            port: None,
            username: "guest".into(),
            password: Secret::new("guest".into()),
            vhost: "/".into(),
            tls: false,
            exchange_name: format!("test_worker_{}", run_id),
            exchange_options: ExchangeOptions {
                auto_delete: true,
                internal: false,
            },
            wait_exchange_name: Some(format!("test_worker_{}-wait", run_id)),
            wait_queue_name: Some(format!("test_worker_{}-wait-queue", run_id)),
            wait_expiration_suffixes: vec![],
            prefetch_count: 10,
            publisher_confirms: false,
            force_publisher_confirms: false,
            confirm_timeout_ms: 5_000,
            namespace: Some(format!("test_{}", &run_id[..8])),
            connection_retries: 3,
            heartbeat_secs: None,
            connection_timeout_ms: Some(5_000),
            management_api: with_management_api.then(|| ManagementApiSettings {
                base_url: "http://localhost:15672/api".into(),
                username: "guest".into(),
                password: Secret::new("guest".into()),
            }),
        },
    }
}

/// The running application plus the handles a test needs to drive it.
pub struct TestApp {
    pub broker: Arc<Broker>,
    pub shutdown: ShutdownHandle,
    pub run_handle: JoinHandle<Result<(), ApplicationError>>,
}

impl TestApp {
    /// Stops the worker and waits for a clean exit.
    pub async fn stop(self) {
        self.shutdown.shutdown();
        self.run_handle
            .await
            .expect("worker task panicked")
            .expect("worker exited with an error");
    }
}

/// Builds and spawns the application with the given consumers.
pub async fn spawn_app(
    settings: Settings,
    registry: ConsumerRegistry,
    configure: impl FnOnce(Worker) -> Worker,
) -> TestApp {
    Lazy::force(&TRACING);

    let application = Application::build(settings, registry, BrokerOptions::default())
        .await
        .expect("Failed to build application.")
        .configure_worker(configure);

    let broker = application.broker();
    let shutdown = application.shutdown_handle();
    let run_handle = tokio::spawn(application.run_until_stopped());

    // Give the subscriptions a moment to settle before tests publish.
    tokio::time::sleep(Duration::from_millis(800)).await;

    TestApp {
        broker,
        shutdown,
        run_handle,
    }
}

/// Polls `condition` until it returns true or the deadline passes.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

/// Lists the routing keys bound to a queue on the given exchange, via the
/// management API.
pub async fn bound_routing_keys(vhost_encoded: &str, queue: &str, exchange: &str) -> Vec<String> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!(
            "http://localhost:15672/api/queues/{}/{}/bindings",
            vhost_encoded, queue
        ))
        .basic_auth("guest", Some("guest"))
        .send()
        .await
        .expect("could not reach the management API");

    let bindings: serde_json::Value = response.json().await.expect("unexpected bindings payload");
    let mut keys: Vec<String> = bindings
        .as_array()
        .expect("bindings response is not an array")
        .iter()
        .filter(|binding| binding["source"].as_str() == Some(exchange))
        .filter_map(|binding| binding["routing_key"].as_str().map(String::from))
        .collect();
    keys.sort();
    keys
}
