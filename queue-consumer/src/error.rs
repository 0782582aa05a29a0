use std::fmt;
use std::time;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Lifecycle errors returned by `Subscriber::consume` and `Subscriber::stop`.
/// These are usage errors: they are never retried and never sent on the error channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    #[error("subscriber is already running")]
    AlreadyRunning,
    #[error("subscriber is already stopped")]
    AlreadyStopped,
    #[error("consumer exited abnormally: {0}")]
    ConsumerFailed(String),
}

/// The transport call that produced a `TransportError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Receive,
    Delete,
    ChangeVisibility,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Receive => write!(f, "receive"),
            Operation::Delete => write!(f, "delete"),
            Operation::ChangeVisibility => write!(f, "change visibility"),
        }
    }
}

/// A failed call to the queue transport.
#[derive(Error, Debug)]
#[error("{operation} request failed: {source}")]
pub struct TransportError {
    pub operation: Operation,
    #[source]
    pub source: BoxError,
}

impl TransportError {
    pub fn new(operation: Operation, source: impl Into<BoxError>) -> Self {
        Self {
            operation,
            source: source.into(),
        }
    }
}

/// Input rejected locally, before any transport call is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("receipt handle must not be empty")]
    EmptyReceiptHandle,
    #[error("visibility timeout {requested:?} exceeds the maximum of {maximum:?}")]
    VisibilityTimeoutTooLong {
        requested: time::Duration,
        maximum: time::Duration,
    },
}

/// Errors from operations on a single `Message`.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The reason a `Worker` stopped running.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Returned by `Worker::start` after a call to `Worker::stop`.
    #[error("worker closed")]
    Closed,
    #[error(transparent)]
    Subscriber(#[from] SubscriberError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl WorkerError {
    /// True when the worker was stopped on purpose rather than by a failure.
    pub fn is_closed(&self) -> bool {
        matches!(self, WorkerError::Closed)
    }
}
