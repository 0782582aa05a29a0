use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{self, mpsc, watch};
use tracing::{debug, error, info, info_span, Instrument, Span};

use crate::error::{TransportError, WorkerError};
use crate::message::Message;
use crate::subscriber::{stopped, Subscriber};

/// Handles one message fetched by the worker's subscriber.
///
/// Each message is handled on its own task. The handler owns the message and
/// decides whether to acknowledge it.
#[async_trait]
pub trait MessageHandler<C: Send + Sync + 'static>: Send + Sync + 'static {
    async fn handle(&self, ctx: &C, worker: &Worker<C>, message: Message);
}

/// Handles errors reported by the subscriber's consumers, one at a time.
#[async_trait]
pub trait ErrorHandler<C: Send + Sync + 'static>: Send + Sync + 'static {
    async fn handle(&self, ctx: &C, worker: &Worker<C>, error: TransportError);
}

/// Default message handler: log the body, then acknowledge the message.
/// A failed acknowledgement is logged, the message will be redelivered.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAndAcknowledge;

#[async_trait]
impl<C: Send + Sync + 'static> MessageHandler<C> for LogAndAcknowledge {
    async fn handle(&self, _ctx: &C, _worker: &Worker<C>, message: Message) {
        info!("message received: '{}'", String::from_utf8_lossy(message.body()));
        if let Err(err) = message.acknowledge().await {
            error!("failed to acknowledge message: {}", err);
        }
    }
}

/// Default error handler: log the error and terminate the worker with it.
///
/// The first receive error from any consumer ends `Worker::start`, even though
/// the subscriber itself would keep retrying. Use `LogErrors` for a worker that
/// tolerates transient errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

#[async_trait]
impl<C: Send + Sync + 'static> ErrorHandler<C> for FailFast {
    async fn handle(&self, _ctx: &C, worker: &Worker<C>, error: TransportError) {
        error!("error when receiving messages: {}", error);
        if !worker.terminate(error.into()) {
            debug!("worker already terminating, error dropped");
        }
    }
}

/// Error handler that only logs. The worker keeps running through receive errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrors;

#[async_trait]
impl<C: Send + Sync + 'static> ErrorHandler<C> for LogErrors {
    async fn handle(&self, _ctx: &C, _worker: &Worker<C>, error: TransportError) {
        error!("error when receiving messages: {}", error);
    }
}

/// Startup configuration of a `Worker`.
pub struct WorkerConfig<C: Send + Sync + 'static = ()> {
    subscriber: Subscriber,
    message_handler: Option<Arc<dyn MessageHandler<C>>>,
    error_handler: Option<Arc<dyn ErrorHandler<C>>>,
    max_concurrent_handlers: Option<usize>,
}

impl<C: Send + Sync + 'static> WorkerConfig<C> {
    pub fn new(subscriber: Subscriber) -> Self {
        Self {
            subscriber,
            message_handler: None,
            error_handler: None,
            max_concurrent_handlers: None,
        }
    }

    pub fn message_handler(mut self, handler: impl MessageHandler<C>) -> Self {
        self.message_handler = Some(Arc::new(handler));
        self
    }

    pub fn error_handler(mut self, handler: impl ErrorHandler<C>) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Cap the number of message handlers running at once. Unbounded by default.
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = Some(limit.max(1));
        self
    }
}

/// Outcome of waiting for a handler slot.
enum Admission {
    /// Holds a permit, or runs unbounded.
    Admitted(Option<sync::OwnedSemaphorePermit>),
    /// The subscriber is stopping, the handler task waits for its own permit.
    Deferred(Arc<sync::Semaphore>),
}

struct Inner<C: Send + Sync + 'static> {
    subscriber: Subscriber,
    message_handler: Arc<dyn MessageHandler<C>>,
    error_handler: Arc<dyn ErrorHandler<C>>,
    /// Bounds concurrent handlers when configured.
    semaphore: Option<(Arc<sync::Semaphore>, usize)>,
    span: Span,
    /// Single slot holding the reason the worker terminates. Taken and closed by `stop`.
    terminal_tx: Mutex<Option<mpsc::Sender<WorkerError>>>,
    terminal_rx: sync::Mutex<mpsc::Receiver<WorkerError>>,
}

/// Runs a `Subscriber`, dispatching every message and error to the configured handlers.
///
/// Cloning a worker is cheap and yields a handle to the same worker.
pub struct Worker<C: Send + Sync + 'static = ()> {
    inner: Arc<Inner<C>>,
}

impl<C: Send + Sync + 'static> Clone for Worker<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> Worker<C> {
    pub fn new(config: WorkerConfig<C>) -> Self {
        let (terminal_tx, terminal_rx) = mpsc::channel(1);
        let span = info_span!("worker", queue = %config.subscriber.config().queue_url);

        Self {
            inner: Arc::new(Inner {
                subscriber: config.subscriber,
                message_handler: config
                    .message_handler
                    .unwrap_or_else(|| Arc::new(LogAndAcknowledge)),
                error_handler: config.error_handler.unwrap_or_else(|| Arc::new(FailFast)),
                semaphore: config
                    .max_concurrent_handlers
                    .map(|limit| (Arc::new(sync::Semaphore::new(limit)), limit)),
                span,
                terminal_tx: Mutex::new(Some(terminal_tx)),
                terminal_rx: sync::Mutex::new(terminal_rx),
            }),
        }
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.inner.subscriber
    }

    fn terminal_tx(&self) -> MutexGuard<'_, Option<mpsc::Sender<WorkerError>>> {
        self.inner
            .terminal_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start consuming and dispatching messages.
    ///
    /// Blocks until the worker terminates and returns the reason: the first
    /// value offered through `terminate`, or `WorkerError::Closed` after `stop`.
    /// If the subscriber cannot start, its error is returned immediately.
    /// Handler tasks still running are not waited for.
    pub async fn start(&self, ctx: C) -> WorkerError {
        let (mut messages, mut errors) = match self.inner.subscriber.consume() {
            Ok(consumption) => consumption,
            Err(err) => return err.into(),
        };
        let ctx = Arc::new(ctx);

        let worker = self.clone();
        let error_ctx = ctx.clone();
        tokio::spawn(
            async move {
                while let Some(err) = errors.recv().await {
                    worker
                        .inner
                        .error_handler
                        .handle(&error_ctx, &worker, err)
                        .await;
                }
            }
            .instrument(self.inner.span.clone()),
        );

        let mut stopping = self.inner.subscriber.stopping();
        let mut terminal = self.inner.terminal_rx.lock().await;
        let mut draining = true;
        loop {
            tokio::select! {
                biased;

                message = messages.recv(), if draining => match message {
                    Some(message) => self.dispatch(ctx.clone(), message, &mut stopping).await,
                    None => {
                        debug!(parent: &self.inner.span, "message channel closed");
                        draining = false;
                    }
                },
                reason = terminal.recv() => {
                    return reason.unwrap_or(WorkerError::Closed);
                }
            }
        }
    }

    /// Spawn a task running the message handler, once a permit is available if bounded.
    ///
    /// After the subscriber is told to stop, permits are awaited on the handler
    /// task instead, so the message channel keeps draining while handlers finish
    /// and the consumers can exit.
    async fn dispatch(
        &self,
        ctx: Arc<C>,
        message: Message,
        stopping: &mut watch::Receiver<bool>,
    ) {
        let admission = match &self.inner.semaphore {
            Some((semaphore, limit)) => {
                let admission = tokio::select! {
                    biased;

                    permit = semaphore.clone().acquire_owned() => {
                        Admission::Admitted(permit.ok())
                    }
                    _ = stopped(stopping) => Admission::Deferred(semaphore.clone()),
                };
                metrics::gauge!("queue_worker_saturation_percent")
                    .set(1f64 - semaphore.available_permits() as f64 / *limit as f64);
                admission
            }
            None => Admission::Admitted(None),
        };

        metrics::counter!("queue_worker_messages_dispatched_total").increment(1);

        let worker = self.clone();
        tokio::spawn(
            async move {
                let permit = match admission {
                    Admission::Admitted(permit) => permit,
                    Admission::Deferred(semaphore) => semaphore.acquire_owned().await.ok(),
                };
                worker
                    .inner
                    .message_handler
                    .handle(&ctx, &worker, message)
                    .await;
                drop(permit);
            }
            .instrument(self.inner.span.clone()),
        );
    }

    /// Offer `reason` as the value `start` returns.
    ///
    /// Only the first value is kept. Returns false if the worker already has a
    /// termination reason or has been stopped.
    pub fn terminate(&self, reason: WorkerError) -> bool {
        match self.terminal_tx().as_ref() {
            Some(sender) => sender.try_send(reason).is_ok(),
            None => false,
        }
    }

    /// Stop the subscriber and unblock `start` with `WorkerError::Closed`.
    ///
    /// If the subscriber fails to stop, its error is returned and `start` keeps blocking.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        self.inner.subscriber.stop().await?;

        if let Some(sender) = self.terminal_tx().take() {
            if sender.try_send(WorkerError::Closed).is_err() {
                debug!(parent: &self.inner.span, "worker already terminating");
            }
        }
        self.inner.span.in_scope(|| info!("worker stopped"));
        Ok(())
    }
}
