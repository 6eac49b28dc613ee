use amqp_worker::configuration::get_configuration;
use amqp_worker::core::broker::BrokerOptions;
use amqp_worker::core::consumer::ConsumerRegistry;
use amqp_worker::startup::Application;
use amqp_worker::telemetry::{get_tracing_subscriber, init_tracing_subscriber};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let tracing_subscriber =
        get_tracing_subscriber("amqp_worker".into(), "info".into(), std::io::stdout);
    init_tracing_subscriber(tracing_subscriber);

    // Panics if the configuration can't be read
    let configuration = get_configuration().expect("Failed to read configuration.");

    // The daemon hosts whatever consumers the deployment registers; a bare
    // start still declares the exchange topology and serves delayed
    // deliveries.
    let registry = ConsumerRegistry::builder()
        .build()
        .expect("Failed to build the consumer registry.");

    let application =
        match Application::build(configuration, registry, BrokerOptions::default()).await {
            Ok(application) => application,
            Err(error) => panic!("Failed to build application: {:?}", error),
        };

    application.run_until_stopped().await.unwrap();

    Ok(())
}
