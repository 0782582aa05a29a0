use std::time;

use health::HealthRegistry;
use tracing::Span;

use crate::backoff::BackoffConfig;

/// Number of messages a consumer asks for on each fetch.
pub const DEFAULT_MAX_MESSAGES_PER_BATCH: u32 = 10;

/// How long a fetch waits for messages to arrive before returning an empty batch.
pub const DEFAULT_WAIT_TIME: time::Duration = time::Duration::from_secs(10);

/// How long fetched messages stay hidden from other fetches.
/// Should be longer than the time needed to process a message.
pub const DEFAULT_VISIBILITY_TIMEOUT: time::Duration = time::Duration::from_secs(30);

/// Number of concurrent consumer loops per subscriber.
pub const DEFAULT_NUM_CONSUMERS: usize = 3;

/// Settings of a `Subscriber`. Zero values are replaced with the defaults above.
#[derive(Clone)]
pub struct SubscriberConfig {
    /// Identity of the queue to consume from.
    pub queue_url: String,
    pub max_messages_per_batch: u32,
    pub wait_time: time::Duration,
    pub visibility_timeout: time::Duration,
    pub num_consumers: usize,
    /// Delay policy applied by each consumer after a failed fetch.
    pub backoff: BackoffConfig,
    /// Span all subscriber logs are recorded under. Defaults to a `subscriber` span naming the queue.
    pub span: Option<Span>,
    /// When set, every consumer loop registers here and reports after each fetch.
    pub liveness: Option<HealthRegistry>,
}

impl SubscriberConfig {
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            max_messages_per_batch: DEFAULT_MAX_MESSAGES_PER_BATCH,
            wait_time: DEFAULT_WAIT_TIME,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            num_consumers: DEFAULT_NUM_CONSUMERS,
            backoff: BackoffConfig::default(),
            span: None,
            liveness: None,
        }
    }

    pub fn max_messages_per_batch(mut self, max_messages_per_batch: u32) -> Self {
        self.max_messages_per_batch = max_messages_per_batch;
        self
    }

    pub fn wait_time(mut self, wait_time: time::Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn visibility_timeout(mut self, visibility_timeout: time::Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn num_consumers(mut self, num_consumers: usize) -> Self {
        self.num_consumers = num_consumers;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn liveness(mut self, liveness: HealthRegistry) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Replace every zero value with its default.
    pub fn with_defaults(mut self) -> Self {
        if self.max_messages_per_batch == 0 {
            self.max_messages_per_batch = DEFAULT_MAX_MESSAGES_PER_BATCH;
        }
        if self.wait_time.is_zero() {
            self.wait_time = DEFAULT_WAIT_TIME;
        }
        if self.visibility_timeout.is_zero() {
            self.visibility_timeout = DEFAULT_VISIBILITY_TIMEOUT;
        }
        if self.num_consumers == 0 {
            self.num_consumers = DEFAULT_NUM_CONSUMERS;
        }
        self
    }

    /// Capacity of the message channel: one full batch in flight per consumer.
    pub fn message_buffer(&self) -> usize {
        (self.max_messages_per_batch as usize)
            .saturating_mul(self.num_consumers)
            .max(1)
    }

    /// Capacity of the error channel: one pending error per consumer.
    pub fn error_buffer(&self) -> usize {
        self.num_consumers.max(1)
    }

    /// How long a consumer may go without reporting before it is considered stalled.
    pub fn liveness_deadline(&self) -> time::Duration {
        self.wait_time + self.backoff.max.max(self.backoff.min) + time::Duration::from_secs(10)
    }
}
