//! Consume messages from a pull-based queue.
//!
//! A `Subscriber` runs a pool of consumer loops that fetch batches through a
//! `Transport` and fan them into one bounded channel. A `Worker` drives a
//! subscriber and hands every message and every fetch error to pluggable handlers.

pub mod backoff;
pub mod config;
pub mod envelope;
pub mod error;
pub mod message;
pub mod metrics;
pub mod sqs;
pub mod subscriber;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod worker;

pub use backoff::{Backoff, BackoffConfig};
pub use config::SubscriberConfig;
pub use envelope::SnsEnvelope;
pub use error::{
    MessageError, Operation, SubscriberError, TransportError, ValidationError, WorkerError,
};
pub use message::Message;
pub use sqs::SqsTransport;
pub use subscriber::{Consumption, State, Subscriber};
pub use transport::{FetchRequest, MessageAttribute, RawMessage, Transport};
pub use worker::{
    ErrorHandler, FailFast, LogAndAcknowledge, LogErrors, MessageHandler, Worker, WorkerConfig,
};
