use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use amqp_worker::core::broker::{Broker, BrokerOptions};
use amqp_worker::core::consumer::{ConsumerDescriptor, ConsumerRegistry, Handler};
use amqp_worker::core::message::{Message, MessageBody};
use amqp_worker::core::publisher::{MessageProperties, PublishOptions};
use amqp_worker::startup::ApplicationError;

use crate::helpers::{rabbitmq_available, spawn_app, test_settings, wait_until};

struct ArrivalHandler {
    received_at_ms: Arc<AtomicU64>,
    routing_key: Arc<Mutex<String>>,
    published_at: Instant,
}

#[async_trait]
impl Handler for ArrivalHandler {
    async fn handle(&self, message: &Message) -> Result<(), anyhow::Error> {
        *self.routing_key.lock().unwrap() = message.delivery.routing_key.clone();
        self.received_at_ms.store(
            self.published_at.elapsed().as_millis() as u64,
            Ordering::SeqCst,
        );
        Ok(())
    }
}

#[tokio::test]
async fn publish_wait_delivers_after_the_expiration_with_the_original_routing_key() {
    if !rabbitmq_available().await {
        eprintln!("Skipping test - RabbitMQ not available");
        return;
    }

    let received_at_ms = Arc::new(AtomicU64::new(0));
    let routing_key = Arc::new(Mutex::new(String::new()));
    let published_at = Instant::now();

    let registry = {
        let received_at_ms = received_at_ms.clone();
        let routing_key = routing_key.clone();
        ConsumerRegistry::builder()
            .register(ConsumerDescriptor::new(
                "delayed",
                "delayed_delivery",
                vec!["a.b".into()],
                Arc::new(move || {
                    Box::new(ArrivalHandler {
                        received_at_ms: received_at_ms.clone(),
                        routing_key: routing_key.clone(),
                        published_at,
                    })
                }),
            ))
            .build()
            .unwrap()
    };

    let app = spawn_app(test_settings(false), registry, |worker| worker).await;

    app.broker
        .publisher()
        .publish_wait(
            "a.b",
            &MessageBody::Json(json!({ "delayed": true })),
            MessageProperties {
                expiration: Some("600".into()),
                ..Default::default()
            },
            &PublishOptions::default(),
        )
        .await
        .expect("publish_wait failed");
    let publish_elapsed_ms = published_at.elapsed().as_millis() as u64;

    assert!(
        wait_until(Duration::from_secs(10), || {
            received_at_ms.load(Ordering::SeqCst) > 0
        })
        .await,
        "delayed message never arrived"
    );

    let arrival_ms = received_at_ms.load(Ordering::SeqCst);
    assert!(
        arrival_ms >= publish_elapsed_ms + 500,
        "message arrived after {}ms, before the 600ms TTL",
        arrival_ms
    );
    assert_eq!(*routing_key.lock().unwrap(), "a.b");

    app.stop().await;
}

#[tokio::test]
async fn scoped_connections_always_disconnect_and_further_publishes_fail_fast() {
    if !rabbitmq_available().await {
        eprintln!("Skipping test - RabbitMQ not available");
        return;
    }

    let mut settings = test_settings(false);
    settings.amqp.force_publisher_confirms = true;

    let escaped: Arc<Mutex<Option<Arc<Broker>>>> = Arc::new(Mutex::new(None));
    let keep = escaped.clone();

    Broker::with_connection::<_, _, _, ApplicationError>(
        &settings.amqp,
        BrokerOptions::default(),
        |broker| async move {
            *keep.lock().unwrap() = Some(broker.clone());

            // With confirms forced, a successful publish means the broker
            // positively confirmed it.
            broker
                .publisher()
                .publish(
                    "a.b",
                    &MessageBody::Json(json!({ "confirmed": true })),
                    MessageProperties::default(),
                    &PublishOptions::default(),
                )
                .await
                .expect("confirmed publish failed");
            Ok(())
        },
    )
    .await
    .expect("scoped connection failed");

    let broker = escaped.lock().unwrap().take().unwrap();
    let after_scope = broker
        .publisher()
        .publish(
            "a.b",
            &MessageBody::Json(json!({})),
            MessageProperties::default(),
            &PublishOptions::default(),
        )
        .await;

    assert!(
        after_scope.is_err(),
        "publishing on a disconnected broker must fail fast"
    );
}
