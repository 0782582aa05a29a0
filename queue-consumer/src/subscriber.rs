use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::backoff::Backoff;
use crate::config::SubscriberConfig;
use crate::error::{SubscriberError, TransportError};
use crate::message::Message;
use crate::transport::{FetchRequest, Transport};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Lifecycle of a `Subscriber`. Transitions only go forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed, not consuming yet.
    Idle,
    /// Consumer loops are active.
    Running,
    /// Terminal. A stopped subscriber cannot be restarted.
    Stopped,
}

/// Outcome of the consumer pool, published once every consumer loop has exited.
type Drained = Option<Result<(), SubscriberError>>;

/// State shared by the subscriber handle, its consumer loops and every message it produced.
pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: SubscriberConfig,
    span: Span,
    state: AtomicU8,
    /// Flipped to true by `stop`, wakes consumers sleeping in backoff.
    stopping: watch::Sender<bool>,
    drained: watch::Sender<Drained>,
}

impl Shared {
    fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    fn fetch_request(&self) -> FetchRequest {
        FetchRequest {
            queue_url: self.config.queue_url.clone(),
            max_messages: self.config.max_messages_per_batch,
            wait_time: self.config.wait_time,
            visibility_timeout: self.config.visibility_timeout,
        }
    }
}

/// Receiving half of a running subscriber: fetched messages and fetch errors.
///
/// Both channels close once every consumer loop has exited.
pub type Consumption = (mpsc::Receiver<Message>, mpsc::Receiver<TransportError>);

/// A pool of consumer loops fetching batches from one queue and fanning them
/// into a single message channel.
///
/// `consume` may succeed at most once. Once `stop` has been called the
/// subscriber cannot be reused: further calls to `consume` or `stop` fail with
/// `SubscriberError::AlreadyStopped`.
#[derive(Clone)]
pub struct Subscriber {
    shared: Arc<Shared>,
}

impl Subscriber {
    /// Create a subscriber. Zero values in `config` are replaced with defaults.
    pub fn new(config: SubscriberConfig, transport: impl Transport) -> Self {
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(config: SubscriberConfig, transport: Arc<dyn Transport>) -> Self {
        let config = config.with_defaults();
        let span = config
            .span
            .clone()
            .unwrap_or_else(|| info_span!("subscriber", queue = %config.queue_url));
        let (stopping, _) = watch::channel(false);
        let (drained, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                span,
                state: AtomicU8::new(IDLE),
                stopping,
                drained,
            }),
        }
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.shared.config
    }

    pub fn state(&self) -> State {
        match self.shared.state.load(Ordering::Acquire) {
            IDLE => State::Idle,
            RUNNING => State::Running,
            _ => State::Stopped,
        }
    }

    /// Watch that flips to true once `stop` has been called.
    pub(crate) fn stopping(&self) -> watch::Receiver<bool> {
        self.shared.stopping.subscribe()
    }

    /// Start the consumer loops.
    ///
    /// Returns the message and error channels. Errors sent on the error channel
    /// are informational: the consumer that hit them keeps retrying after a
    /// backoff. Must be called from within a tokio runtime.
    pub fn consume(&self) -> Result<Consumption, SubscriberError> {
        match self.shared.state.compare_exchange(
            IDLE,
            RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(RUNNING) => return Err(SubscriberError::AlreadyRunning),
            Err(_) => return Err(SubscriberError::AlreadyStopped),
        }

        let config = &self.shared.config;
        let (messages_tx, messages_rx) = mpsc::channel(config.message_buffer());
        let (errors_tx, errors_rx) = mpsc::channel(config.error_buffer());

        let mut consumers = JoinSet::new();
        for consumer_id in 1..=config.num_consumers {
            let consumer = consume_loop(
                self.shared.clone(),
                consumer_id,
                messages_tx.clone(),
                errors_tx.clone(),
            )
            .instrument(info_span!(parent: &self.shared.span, "consumer", consumer_id));
            consumers.spawn(async move {
                let panicked = AssertUnwindSafe(consumer).catch_unwind().await.err();
                (consumer_id, panicked.map(panic_reason))
            });
        }
        // Consumer loops hold the only senders left, so both channels close when the last loop exits.
        drop(messages_tx);
        drop(errors_tx);

        let shared = self.shared.clone();
        tokio::spawn(
            async move {
                let mut outcome = Ok(());
                while let Some(joined) = consumers.join_next().await {
                    let failure = match joined {
                        Ok((_, None)) => continue,
                        Ok((consumer_id, Some(reason))) => {
                            format!("consumer {} panicked: {}", consumer_id, reason)
                        }
                        Err(join_error) => join_error.to_string(),
                    };
                    error!("consumer exited abnormally: {}", failure);
                    if outcome.is_ok() {
                        outcome = Err(SubscriberError::ConsumerFailed(failure));
                    }
                }
                info!("all consumers exited");
                drop(shared.drained.send_replace(Some(outcome)));
            }
            .instrument(self.shared.span.clone()),
        );

        self.shared.span.in_scope(|| {
            info!(
                consumers = config.num_consumers,
                "subscriber listening for messages"
            )
        });
        Ok((messages_rx, errors_rx))
    }

    /// Stop the consumer loops and wait until all of them have exited.
    ///
    /// In-flight fetches are not cancelled: this returns once the current fetch
    /// of every consumer has completed and its messages have been handed over.
    /// A subscriber that never consumed can be stopped too.
    pub async fn stop(&self) -> Result<(), SubscriberError> {
        let previous = self
            .shared
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state != STOPPED).then_some(STOPPED)
            })
            .map_err(|_| SubscriberError::AlreadyStopped)?;

        _ = self.shared.stopping.send_replace(true);

        if previous == IDLE {
            self.shared
                .span
                .in_scope(|| info!("subscriber stopped before consuming"));
            return Ok(());
        }

        let mut drained = self.shared.drained.subscribe();
        let outcome = drained
            .wait_for(Option::is_some)
            .await
            .map(|drained| drained.clone());
        // The sender lives in `shared`, so waiting cannot fail while we hold it.
        let outcome = outcome.ok().flatten().unwrap_or(Ok(()));

        self.shared.span.in_scope(|| info!("subscriber stopped"));
        outcome
    }

    /// Wrap a raw item as a message bound to this subscriber.
    #[cfg(test)]
    pub(crate) fn wrap(&self, raw: crate::transport::RawMessage) -> Message {
        Message::new(self.shared.clone(), raw)
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        reason.to_string()
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Resolves once the subscriber has been stopped.
pub(crate) async fn stopped(stopping: &mut watch::Receiver<bool>) {
    if stopping.wait_for(|stopping| *stopping).await.is_err() {
        // The sender is gone with the subscriber, nothing will wake us anymore.
        futures::future::pending::<()>().await;
    }
}

/// Fetch batches until the subscriber is stopped.
///
/// A failed fetch is reported on the error channel and retried after a
/// backoff. The stop flag is only checked between fetches.
async fn consume_loop(
    shared: Arc<Shared>,
    consumer_id: usize,
    messages: mpsc::Sender<Message>,
    errors: mpsc::Sender<TransportError>,
) {
    let config = &shared.config;
    let labels = [("queue", config.queue_url.clone())];
    let request = shared.fetch_request();
    let mut backoff = Backoff::new(config.backoff);
    let mut stopping = shared.stopping.subscribe();

    let liveness = match &config.liveness {
        Some(registry) => Some(
            registry
                .register(
                    format!("{}/consumer-{}", config.queue_url, consumer_id),
                    time::Duration::try_from(config.liveness_deadline())
                        .unwrap_or(time::Duration::MAX),
                )
                .await,
        ),
        None => None,
    };

    info!("consumer listening for messages");

    while !shared.is_stopped() {
        let started = tokio::time::Instant::now();
        let result = shared.transport.fetch_batch(&request).await;
        metrics::histogram!("queue_consumer_fetch_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());

        if let Some(handle) = &liveness {
            handle.report_healthy().await;
        }

        match result {
            Err(err) => {
                metrics::counter!("queue_consumer_fetch_errors_total", &labels).increment(1);
                warn!("failed to fetch messages: {}", err);

                if errors.send(err).await.is_err() {
                    debug!("error receiver dropped, fetch error only logged");
                }

                let delay = backoff.next_delay();
                debug!(?delay, "backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = stopped(&mut stopping) => {},
                }
            }
            Ok(batch) => {
                backoff.reset();
                debug!("found {} messages", batch.len());
                metrics::counter!("queue_consumer_messages_received_total", &labels)
                    .increment(batch.len() as u64);

                for raw in batch {
                    if messages
                        .send(Message::new(shared.clone(), raw))
                        .await
                        .is_err()
                    {
                        warn!("message receiver dropped, consumer exiting");
                        return;
                    }
                }
            }
        }
    }

    info!("consumer stopped");
}
