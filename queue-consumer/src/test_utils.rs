use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use async_trait::async_trait;

use crate::error::{Operation, TransportError};
use crate::transport::{FetchRequest, RawMessage, Transport};

enum Step {
    Batch(Vec<RawMessage>),
    Error(String),
    Panic(String),
}

#[derive(Default)]
struct MockState {
    script: VecDeque<Step>,
    fetches: usize,
    delivered: usize,
    in_flight: HashSet<String>,
    acknowledged: Vec<(String, String)>,
    visibility_changes: usize,
    requests: Vec<FetchRequest>,
}

/// An in-memory `Transport` playing back a script of fetch results.
///
/// Once the script is exhausted every fetch waits `idle_wait` and returns an
/// empty batch, like a long poll on an empty queue. Deletes are idempotent
/// unless `strict_delete` is set, in which case deleting a receipt handle that
/// is not in flight fails.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    idle_wait: time::Duration,
    strict_delete: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Default::default(),
            idle_wait: time::Duration::from_millis(5),
            strict_delete: false,
        }
    }

    pub fn idle_wait(mut self, idle_wait: time::Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn strict_delete(mut self) -> Self {
        self.strict_delete = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a batch. Items without a receipt handle get one derived from their position.
    pub fn push_batch(&self, batch: Vec<RawMessage>) {
        self.state().script.push_back(Step::Batch(batch));
    }

    /// Queue one batch holding one message per body.
    pub fn push_bodies<I, B>(&self, bodies: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<bytes::Bytes>,
    {
        let batch = bodies
            .into_iter()
            .map(|body| RawMessage::new(String::new(), body))
            .collect();
        self.push_batch(batch);
    }

    /// Queue a failed fetch.
    pub fn push_error(&self, message: impl Into<String>) {
        self.state().script.push_back(Step::Error(message.into()));
    }

    /// Queue a fetch that panics the consumer calling it.
    pub fn push_panic(&self, message: impl Into<String>) {
        self.state().script.push_back(Step::Panic(message.into()));
    }

    pub fn fetches(&self) -> usize {
        self.state().fetches
    }

    /// Number of messages handed out by successful fetches.
    pub fn delivered(&self) -> usize {
        self.state().delivered
    }

    pub fn pending_steps(&self) -> usize {
        self.state().script.len()
    }

    /// Every successful delete as (queue, receipt handle).
    pub fn acknowledged(&self) -> Vec<(String, String)> {
        self.state().acknowledged.clone()
    }

    pub fn visibility_changes(&self) -> usize {
        self.state().visibility_changes
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.state().requests.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch_batch(&self, request: &FetchRequest) -> Result<Vec<RawMessage>, TransportError> {
        let step = {
            let mut state = self.state();
            state.fetches += 1;
            state.requests.push(request.clone());
            state.script.pop_front()
        };

        match step {
            Some(Step::Batch(mut batch)) => {
                let mut state = self.state();
                for raw in batch.iter_mut() {
                    if raw.receipt_handle.is_empty() {
                        raw.receipt_handle = format!("receipt-{}", state.delivered);
                    }
                    state.delivered += 1;
                    _ = state.in_flight.insert(raw.receipt_handle.clone());
                }
                Ok(batch)
            }
            Some(Step::Error(message)) => Err(TransportError::new(Operation::Receive, message)),
            Some(Step::Panic(message)) => panic!("{}", message),
            None => {
                tokio::time::sleep(self.idle_wait).await;
                Ok(Vec::new())
            }
        }
    }

    async fn acknowledge(&self, queue_url: &str, receipt_handle: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.in_flight.remove(receipt_handle) && self.strict_delete {
            return Err(TransportError::new(
                Operation::Delete,
                format!("receipt handle {} is not valid", receipt_handle),
            ));
        }
        state
            .acknowledged
            .push((queue_url.to_owned(), receipt_handle.to_owned()));
        Ok(())
    }

    async fn extend_visibility(
        &self,
        _queue_url: &str,
        _receipt_handle: &str,
        _timeout: time::Duration,
    ) -> Result<(), TransportError> {
        self.state().visibility_changes += 1;
        Ok(())
    }
}
