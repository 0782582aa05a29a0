//! Consume an SQS queue, logging and acknowledging every message.
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use queue_consumer::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use queue_consumer::{LogErrors, SqsTransport, Subscriber, Worker, WorkerConfig};
use queue_worker::config::Config;
use queue_worker::error::ServiceError;

async fn shutdown() -> std::io::Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;

    let liveness = HealthRegistry::new("liveness");
    let transport = SqsTransport::from_env(
        config
            .sqs_endpoint_url
            .as_ref()
            .map(|endpoint| endpoint.as_str()),
    )
    .await;
    let subscriber = Subscriber::new(
        config.subscriber_config().liveness(liveness.clone()),
        transport,
    );

    let mut worker_config: WorkerConfig = WorkerConfig::new(subscriber);
    if !config.fail_on_transport_error {
        worker_config = worker_config.error_handler(LogErrors);
    }
    if let Some(limit) = config.max_concurrent_handlers() {
        worker_config = worker_config.max_concurrent_handlers(limit);
    }
    let worker = Worker::new(worker_config);

    let recorder_handle = setup_metrics_recorder()?;
    let router = setup_metrics_router(recorder_handle, liveness);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(err) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, err);
        }
    });

    tokio::task::spawn({
        let worker = worker.clone();
        async move {
            if let Err(err) = shutdown().await {
                error!("failed to listen for shutdown signals: {}", err);
                return;
            }
            if let Err(err) = worker.stop().await {
                error!("failed to stop worker: {}", err);
            }
        }
    });

    info!("consuming from {}", config.queue_url.as_str());
    let reason = worker.start(()).await;
    if reason.is_closed() {
        info!("worker stopped");
        return Ok(());
    }

    error!("worker terminated: {}", reason);
    if let Err(err) = worker.stop().await {
        error!("failed to stop subscriber: {}", err);
    }
    Err(reason.into())
}
