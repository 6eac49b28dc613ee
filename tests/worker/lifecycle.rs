use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fake::faker::lorem::en::Word;
use fake::Fake;
use serde_json::json;

use amqp_worker::core::acknowledgements::RequeueOnce;
use amqp_worker::core::consumer::{ConsumerDescriptor, ConsumerRegistry, Handler};
use amqp_worker::core::message::{Message, MessageBody};
use amqp_worker::core::publisher::{MessageProperties, PublishOptions};
use amqp_worker::core::reporters::{ErrorReporter, HandlerFailure};

use crate::helpers::{rabbitmq_available, spawn_app, test_settings, wait_until};

struct RecordingHandler {
    hits: Arc<AtomicUsize>,
    last_body: Arc<Mutex<Option<serde_json::Value>>>,
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, message: &Message) -> Result<(), anyhow::Error> {
        *self.last_body.lock().unwrap() = message.body.as_json().cloned();
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn a_published_message_reaches_the_handler_exactly_once() {
    if !rabbitmq_available().await {
        eprintln!("Skipping test - RabbitMQ not available");
        return;
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let last_body = Arc::new(Mutex::new(None));
    let registry = {
        let hits = hits.clone();
        let last_body = last_body.clone();
        ConsumerRegistry::builder()
            .register(ConsumerDescriptor::new(
                "recording",
                "happy_path",
                vec!["a.b".into()],
                Arc::new(move || {
                    Box::new(RecordingHandler {
                        hits: hits.clone(),
                        last_body: last_body.clone(),
                    })
                }),
            ))
            .build()
            .unwrap()
    };

    let app = spawn_app(test_settings(false), registry, |worker| worker).await;

    app.broker
        .publisher()
        .publish(
            "a.b",
            &MessageBody::Json(json!({ "x": 1 })),
            MessageProperties::default(),
            &PublishOptions::default(),
        )
        .await
        .expect("publish failed");

    assert!(
        wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) == 1).await,
        "handler was not invoked"
    );
    assert_eq!(*last_body.lock().unwrap(), Some(json!({ "x": 1 })));

    // No redelivery: the ack must have settled the message.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    app.stop().await;
}

struct FailingHandler {
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for FailingHandler {
    async fn handle(&self, _message: &Message) -> Result<(), anyhow::Error> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("schema mismatch"))
    }
}

struct CapturingReporter {
    calls: Arc<AtomicUsize>,
    last_payload: Arc<Mutex<Vec<u8>>>,
}

impl ErrorReporter for CapturingReporter {
    fn handler_error(&self, failure: &HandlerFailure<'_>) -> Result<(), anyhow::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_payload.lock().unwrap() = failure.payload.to_vec();
        Ok(())
    }
}

#[tokio::test]
async fn a_failing_handler_is_nacked_and_every_reporter_hears_about_it() {
    if !rabbitmq_available().await {
        eprintln!("Skipping test - RabbitMQ not available");
        return;
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let registry = {
        let hits = hits.clone();
        ConsumerRegistry::builder()
            .register(ConsumerDescriptor::new(
                "failing",
                "default_nack",
                vec!["a.b".into()],
                Arc::new(move || Box::new(FailingHandler { hits: hits.clone() })),
            ))
            .build()
            .unwrap()
    };

    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));
    let last_payload = Arc::new(Mutex::new(Vec::new()));
    let reporters: Vec<Arc<dyn ErrorReporter>> = vec![
        Arc::new(CapturingReporter {
            calls: first_calls.clone(),
            last_payload: last_payload.clone(),
        }),
        Arc::new(CapturingReporter {
            calls: second_calls.clone(),
            last_payload: Arc::new(Mutex::new(Vec::new())),
        }),
    ];

    let app = spawn_app(test_settings(false), registry, |worker| {
        worker.with_reporters(reporters)
    })
    .await;

    let word: String = Word().fake();
    let payload = json!({ "word": word });
    app.broker
        .publisher()
        .publish(
            "a.b",
            &MessageBody::Json(payload.clone()),
            MessageProperties::default(),
            &PublishOptions::default(),
        )
        .await
        .expect("publish failed");

    assert!(
        wait_until(Duration::from_secs(5), || {
            first_calls.load(Ordering::SeqCst) == 1 && second_calls.load(Ordering::SeqCst) == 1
        })
        .await,
        "reporters were not both invoked"
    );
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&last_payload.lock().unwrap()).unwrap(),
        payload
    );

    // Default chain nacks without requeue: the handler must not run again.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    app.stop().await;
}

#[tokio::test]
async fn a_requeue_policy_gives_the_message_a_second_chance() {
    if !rabbitmq_available().await {
        eprintln!("Skipping test - RabbitMQ not available");
        return;
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let registry = {
        let hits = hits.clone();
        ConsumerRegistry::builder()
            .register(ConsumerDescriptor::new(
                "flaky",
                "requeue_policy",
                vec!["a.b".into()],
                Arc::new(move || Box::new(FailingHandler { hits: hits.clone() })),
            ))
            .build()
            .unwrap()
    };

    let app = spawn_app(test_settings(false), registry, |worker| {
        worker.with_policies(vec![Arc::new(RequeueOnce)])
    })
    .await;

    app.broker
        .publisher()
        .publish(
            "a.b",
            &MessageBody::Json(json!({ "attempt": 0 })),
            MessageProperties::default(),
            &PublishOptions::default(),
        )
        .await
        .expect("publish failed");

    // Delivered once, requeued by the policy, redelivered once, then nacked.
    assert!(
        wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) == 2).await,
        "message was not redelivered exactly once"
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    app.stop().await;
}

struct SleepyHandler {
    started: Arc<AtomicBool>,
    completed: Arc<AtomicBool>,
}

#[async_trait]
impl Handler for SleepyHandler {
    async fn handle(&self, _message: &Message) -> Result<(), anyhow::Error> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.completed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_during_work_lets_the_handler_finish_within_the_budget() {
    if !rabbitmq_available().await {
        eprintln!("Skipping test - RabbitMQ not available");
        return;
    }

    let started = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicBool::new(false));
    let registry = {
        let started = started.clone();
        let completed = completed.clone();
        ConsumerRegistry::builder()
            .register(ConsumerDescriptor::new(
                "sleepy",
                "graceful_exit",
                vec!["a.b".into()],
                Arc::new(move || {
                    Box::new(SleepyHandler {
                        started: started.clone(),
                        completed: completed.clone(),
                    })
                }),
            ))
            .build()
            .unwrap()
    };

    let app = spawn_app(test_settings(false), registry, |worker| worker).await;

    app.broker
        .publisher()
        .publish(
            "a.b",
            &MessageBody::Json(json!({})),
            MessageProperties::default(),
            &PublishOptions::default(),
        )
        .await
        .expect("publish failed");

    assert!(
        wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst)).await,
        "handler never started"
    );

    let shutdown_started = Instant::now();
    app.shutdown.shutdown();
    app.run_handle
        .await
        .expect("worker task panicked")
        .expect("worker exited with an error");

    // Well within graceful_exit_timeout_secs (5s in the test settings).
    assert!(shutdown_started.elapsed() < Duration::from_secs(4));
    assert!(completed.load(Ordering::SeqCst), "in-flight handler was cut off");
}
