use metrics_exporter_prometheus::BuildError;
use queue_consumer::WorkerError;
use thiserror::Error;

/// Errors that end the `queue-worker` process with a failure status.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] BuildError),
    #[error("worker terminated: {0}")]
    Worker(#[from] WorkerError),
}
