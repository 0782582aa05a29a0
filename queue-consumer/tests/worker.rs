use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use queue_consumer::test_utils::MockTransport;
use queue_consumer::{
    BackoffConfig, ErrorHandler, LogErrors, Message, MessageHandler, Operation, Subscriber,
    SubscriberConfig, SubscriberError, TransportError, Worker, WorkerConfig, WorkerError,
};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

const PATIENCE: Duration = Duration::from_secs(5);

fn subscriber(transport: &MockTransport) -> Subscriber {
    let config = SubscriberConfig::new("jobs")
        .num_consumers(2)
        .backoff(BackoffConfig {
            min: Duration::from_millis(1),
            max: Duration::from_millis(5),
            factor: 2.0,
            jitter: false,
        });
    Subscriber::new(config, transport.clone())
}

async fn wait_for_acknowledged(transport: &MockTransport, count: usize) {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while transport.acknowledged().len() < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {} of {} messages acknowledged",
            transport.acknowledged().len(),
            count
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_default_handlers_acknowledge_until_stopped() {
    let transport = MockTransport::new();
    transport.push_bodies((0..10).map(|i| format!("Message: {}", i)));
    let worker: Worker = Worker::new(WorkerConfig::new(subscriber(&transport)));

    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.start(()).await }
    });

    wait_for_acknowledged(&transport, 10).await;
    worker.stop().await.unwrap();

    let reason = timeout(PATIENCE, running).await.unwrap().unwrap();
    assert!(reason.is_closed(), "{}", reason);
    assert_eq!(reason.to_string(), "worker closed");
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let transport = MockTransport::new();
    let worker: Worker = Worker::new(WorkerConfig::new(subscriber(&transport)));

    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.start(()).await }
    });
    while transport.fetches() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(matches!(
        worker.start(()).await,
        WorkerError::Subscriber(SubscriberError::AlreadyRunning)
    ));

    worker.stop().await.unwrap();
    assert!(timeout(PATIENCE, running).await.unwrap().unwrap().is_closed());
}

#[tokio::test]
async fn test_stopped_worker_cannot_start() {
    let transport = MockTransport::new();
    let worker: Worker = Worker::new(WorkerConfig::new(subscriber(&transport)));

    worker.stop().await.unwrap();

    assert!(matches!(
        worker.start(()).await,
        WorkerError::Subscriber(SubscriberError::AlreadyStopped)
    ));
    assert!(matches!(
        worker.stop().await,
        Err(WorkerError::Subscriber(SubscriberError::AlreadyStopped))
    ));
}

#[tokio::test]
async fn test_first_fetch_error_terminates_by_default() {
    let transport = MockTransport::new();
    transport.push_error("access denied");
    let worker: Worker = Worker::new(WorkerConfig::new(subscriber(&transport)));

    let reason = timeout(PATIENCE, worker.start(())).await.unwrap();

    match reason {
        WorkerError::Transport(err) => {
            assert_eq!(err.operation, Operation::Receive);
            assert!(err.to_string().contains("access denied"));
        }
        other => panic!("unexpected termination: {}", other),
    }
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_log_errors_keeps_running() {
    let transport = MockTransport::new();
    transport.push_error("throttled");
    transport.push_error("throttled");
    transport.push_bodies(["survived"]);
    let worker: Worker =
        Worker::new(WorkerConfig::new(subscriber(&transport)).error_handler(LogErrors));

    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.start(()).await }
    });

    wait_for_acknowledged(&transport, 1).await;
    assert!(!running.is_finished());

    worker.stop().await.unwrap();
    assert!(timeout(PATIENCE, running).await.unwrap().unwrap().is_closed());
}

/// Forwards the error through `terminate`, then tells the test it did.
struct ForwardThenNotify;

#[async_trait]
impl ErrorHandler<Arc<Notify>> for ForwardThenNotify {
    async fn handle(&self, ctx: &Arc<Notify>, worker: &Worker<Arc<Notify>>, error: TransportError) {
        assert!(worker.terminate(error.into()));
        ctx.notify_one();
    }
}

#[tokio::test]
async fn test_error_forwarded_before_stop_wins() {
    let transport = MockTransport::new();
    transport.push_error("queue deleted");
    let worker = Worker::new(WorkerConfig::new(subscriber(&transport)).error_handler(ForwardThenNotify));
    let forwarded = Arc::new(Notify::new());

    let running = tokio::spawn({
        let worker = worker.clone();
        let forwarded = forwarded.clone();
        async move { worker.start(forwarded).await }
    });

    timeout(PATIENCE, forwarded.notified()).await.unwrap();
    worker.stop().await.unwrap();

    let reason = timeout(PATIENCE, running).await.unwrap().unwrap();
    assert!(matches!(reason, WorkerError::Transport(_)), "{}", reason);
}

/// Error handler that holds the error until the test releases it.
struct Gate {
    entered: Notify,
    release: Notify,
    accepted: mpsc::UnboundedSender<bool>,
}

struct ForwardWhenReleased;

#[async_trait]
impl ErrorHandler<Arc<Gate>> for ForwardWhenReleased {
    async fn handle(&self, gate: &Arc<Gate>, worker: &Worker<Arc<Gate>>, error: TransportError) {
        gate.entered.notify_one();
        gate.release.notified().await;
        _ = gate.accepted.send(worker.terminate(error.into()));
    }
}

#[tokio::test]
async fn test_stop_before_error_is_forwarded_closes() {
    let transport = MockTransport::new();
    transport.push_error("queue deleted");
    let worker =
        Worker::new(WorkerConfig::new(subscriber(&transport)).error_handler(ForwardWhenReleased));
    let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Gate {
        entered: Notify::new(),
        release: Notify::new(),
        accepted: accepted_tx,
    });

    let running = tokio::spawn({
        let worker = worker.clone();
        let gate = gate.clone();
        async move { worker.start(gate).await }
    });

    timeout(PATIENCE, gate.entered.notified()).await.unwrap();
    worker.stop().await.unwrap();
    let reason = timeout(PATIENCE, running).await.unwrap().unwrap();
    assert!(reason.is_closed(), "{}", reason);

    gate.release.notify_one();
    let accepted = timeout(PATIENCE, accepted_rx.recv()).await.unwrap();
    assert_eq!(accepted, Some(false));
}

#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct SlowAcknowledge;

#[async_trait]
impl MessageHandler<Arc<Concurrency>> for SlowAcknowledge {
    async fn handle(
        &self,
        ctx: &Arc<Concurrency>,
        _worker: &Worker<Arc<Concurrency>>,
        message: Message,
    ) {
        let running = ctx.current.fetch_add(1, Ordering::SeqCst) + 1;
        _ = ctx.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        _ = ctx.current.fetch_sub(1, Ordering::SeqCst);
        message.acknowledge().await.unwrap();
    }
}

#[tokio::test]
async fn test_concurrent_handlers_are_bounded() {
    let transport = MockTransport::new();
    transport.push_bodies((0..10).map(|i| format!("job {}", i)));
    let worker = Worker::new(
        WorkerConfig::new(subscriber(&transport))
            .message_handler(SlowAcknowledge)
            .max_concurrent_handlers(2),
    );
    let concurrency = Arc::new(Concurrency::default());

    let running = tokio::spawn({
        let worker = worker.clone();
        let concurrency = concurrency.clone();
        async move { worker.start(concurrency).await }
    });

    wait_for_acknowledged(&transport, 10).await;
    worker.stop().await.unwrap();
    assert!(timeout(PATIENCE, running).await.unwrap().unwrap().is_closed());

    let peak = concurrency.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {}", peak);
}

/// Acknowledges every message and stops the worker when it reads "stop".
struct StopOnCommand;

#[async_trait]
impl MessageHandler<()> for StopOnCommand {
    async fn handle(&self, _ctx: &(), worker: &Worker, message: Message) {
        message.acknowledge().await.unwrap();
        if message.body() == b"stop" {
            worker.stop().await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_handler_can_stop_the_worker() {
    let transport = MockTransport::new();
    transport.push_bodies(["work", "stop"]);
    let worker = Worker::new(WorkerConfig::new(subscriber(&transport)).message_handler(StopOnCommand));

    let reason = timeout(PATIENCE, worker.start(())).await.unwrap();

    assert!(reason.is_closed(), "{}", reason);
    assert_eq!(transport.acknowledged().len(), 2);
}

/// Holds its slot for a while, then stops the worker.
struct SlowStop;

#[async_trait]
impl MessageHandler<()> for SlowStop {
    async fn handle(&self, _ctx: &(), worker: &Worker, message: Message) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        message.acknowledge().await.unwrap();
        if let Err(err) = worker.stop().await {
            assert!(
                matches!(err, WorkerError::Subscriber(SubscriberError::AlreadyStopped)),
                "{}",
                err
            );
        }
    }
}

#[tokio::test]
async fn test_bounded_handler_can_stop_the_worker() {
    let transport = MockTransport::new();
    for batch in 0..10 {
        transport.push_bodies([format!("{}-a", batch), format!("{}-b", batch)]);
    }
    let subscriber = Subscriber::new(
        SubscriberConfig::new("jobs")
            .num_consumers(1)
            .max_messages_per_batch(2),
        transport.clone(),
    );
    let worker = Worker::new(
        WorkerConfig::new(subscriber)
            .message_handler(SlowStop)
            .max_concurrent_handlers(1),
    );

    let reason = timeout(PATIENCE, worker.start(()))
        .await
        .expect("start never returned after a handler stopped the worker");

    assert!(reason.is_closed(), "{}", reason);
    assert_eq!(worker.subscriber().state(), queue_consumer::State::Stopped);
}
