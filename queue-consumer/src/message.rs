use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::envelope::SnsEnvelope;
use crate::error::{MessageError, TransportError};
use crate::subscriber::Shared;
use crate::transport::{MessageAttribute, RawMessage};

/// A message fetched by a `Subscriber`.
///
/// Acknowledging or extending visibility goes through the transport and queue
/// of the subscriber that fetched it. Once the receipt handle has expired on
/// the queue side, both operations fail with a `TransportError`.
pub struct Message {
    subscriber: Arc<Shared>,
    raw: RawMessage,
}

impl Message {
    pub(crate) fn new(subscriber: Arc<Shared>, raw: RawMessage) -> Self {
        Self { subscriber, raw }
    }

    /// The raw payload.
    pub fn body(&self) -> &[u8] {
        &self.raw.body
    }

    /// The payload as a cheaply cloneable buffer.
    pub fn bytes(&self) -> Bytes {
        self.raw.body.clone()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.raw.message_id.as_deref()
    }

    pub fn receipt_handle(&self) -> &str {
        &self.raw.receipt_handle
    }

    pub fn attributes(&self) -> &HashMap<String, MessageAttribute> {
        &self.raw.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&MessageAttribute> {
        self.raw.attributes.get(name)
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.raw.body)
    }

    /// Decode the payload as a notification delivered through an SNS subscription.
    pub fn sns_envelope(&self) -> Result<SnsEnvelope, serde_json::Error> {
        self.json()
    }

    /// Delete the message from the queue.
    ///
    /// Repeating the call is harmless only if the transport treats a repeated
    /// delete as a no-op.
    pub async fn acknowledge(&self) -> Result<(), TransportError> {
        self.subscriber
            .transport
            .acknowledge(&self.subscriber.config.queue_url, &self.raw.receipt_handle)
            .await
    }

    /// Hide the message from other consumers for `timeout`, counted from now.
    ///
    /// Useful when processing takes longer than the subscriber's visibility
    /// timeout. Arguments the transport would reject fail locally without a
    /// network call.
    pub async fn extend_visibility(&self, timeout: time::Duration) -> Result<(), MessageError> {
        let transport = &self.subscriber.transport;
        transport.validate_visibility(&self.raw.receipt_handle, timeout)?;
        transport
            .extend_visibility(
                &self.subscriber.config.queue_url,
                &self.raw.receipt_handle,
                timeout,
            )
            .await?;
        Ok(())
    }

    pub fn into_raw(self) -> RawMessage {
        self.raw
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("queue_url", &self.subscriber.config.queue_url)
            .field("raw", &self.raw)
            .finish()
    }
}
