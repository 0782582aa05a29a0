use std::collections::HashMap;
use std::time;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{TransportError, ValidationError};

/// Longest visibility timeout SQS accepts: 12 hours.
pub const MAX_VISIBILITY_TIMEOUT: time::Duration = time::Duration::from_secs(12 * 60 * 60);

/// A message attribute value as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageAttribute {
    String(String),
    Binary(Bytes),
}

/// One item of a fetched batch, in transport-native form.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub message_id: Option<String>,
    /// Opaque handle used to acknowledge or extend this particular delivery.
    pub receipt_handle: String,
    pub body: Bytes,
    pub attributes: HashMap<String, MessageAttribute>,
}

impl RawMessage {
    pub fn new(receipt_handle: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            ..Default::default()
        }
    }
}

/// Parameters of a single batch fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub queue_url: String,
    /// Upper bound on the number of items returned.
    pub max_messages: u32,
    /// How long the transport may wait for items before returning an empty batch.
    pub wait_time: time::Duration,
    /// How long fetched items stay hidden from other fetches.
    pub visibility_timeout: time::Duration,
}

/// The remote pull-based queue, as seen by the subscriber.
///
/// Implementations only issue network calls; retries, backoff and fan-out are
/// handled by the `Subscriber`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fetch up to `request.max_messages` items. An empty batch is a success.
    async fn fetch_batch(&self, request: &FetchRequest) -> Result<Vec<RawMessage>, TransportError>;

    /// Permanently remove a delivered item from the queue.
    async fn acknowledge(&self, queue_url: &str, receipt_handle: &str) -> Result<(), TransportError>;

    /// Postpone redelivery of a delivered item.
    async fn extend_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: time::Duration,
    ) -> Result<(), TransportError>;

    /// Check `extend_visibility` arguments against the limits the transport accepts.
    fn validate_visibility(
        &self,
        receipt_handle: &str,
        timeout: time::Duration,
    ) -> Result<(), ValidationError> {
        if receipt_handle.is_empty() {
            return Err(ValidationError::EmptyReceiptHandle);
        }
        if timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(ValidationError::VisibilityTimeoutTooLong {
                requested: timeout,
                maximum: MAX_VISIBILITY_TIMEOUT,
            });
        }
        Ok(())
    }
}
