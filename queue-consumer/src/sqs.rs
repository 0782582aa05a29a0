use std::collections::HashMap;
use std::time;

use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message, MessageAttributeValue};
use aws_sdk_sqs::Client;
use bytes::Bytes;

use crate::error::{Operation, TransportError};
use crate::transport::{FetchRequest, MessageAttribute, RawMessage, Transport};

/// Request every message attribute on receive.
const ALL_ATTRIBUTES: &str = "All";

/// `Transport` backed by Amazon SQS.
#[derive(Clone, Debug)]
pub struct SqsTransport {
    client: Client,
}

impl SqsTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the default AWS environment (region, credentials, profile).
    /// `endpoint_url` overrides the SQS endpoint, e.g. to target a local emulator.
    pub async fn from_env(endpoint_url: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint_url) = endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config))
    }
}

/// SQS takes whole seconds as i32.
fn seconds(duration: time::Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

fn attribute(value: &MessageAttributeValue) -> Option<MessageAttribute> {
    if let Some(string) = value.string_value() {
        return Some(MessageAttribute::String(string.to_owned()));
    }
    value
        .binary_value()
        .map(|blob| MessageAttribute::Binary(Bytes::copy_from_slice(blob.as_ref())))
}

fn raw_message(message: &Message) -> RawMessage {
    let attributes = message
        .message_attributes()
        .map(|attributes| {
            attributes
                .iter()
                .filter_map(|(name, value)| Some((name.clone(), attribute(value)?)))
                .collect()
        })
        .unwrap_or_else(HashMap::new);

    RawMessage {
        message_id: message.message_id().map(str::to_owned),
        receipt_handle: message.receipt_handle().unwrap_or_default().to_owned(),
        body: Bytes::copy_from_slice(message.body().unwrap_or_default().as_bytes()),
        attributes,
    }
}

#[async_trait]
impl Transport for SqsTransport {
    async fn fetch_batch(&self, request: &FetchRequest) -> Result<Vec<RawMessage>, TransportError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&request.queue_url)
            .max_number_of_messages(i32::try_from(request.max_messages).unwrap_or(i32::MAX))
            .wait_time_seconds(seconds(request.wait_time))
            .visibility_timeout(seconds(request.visibility_timeout))
            .message_attribute_names(ALL_ATTRIBUTES)
            .send()
            .await
            .map_err(|err| {
                TransportError::new(Operation::Receive, DisplayErrorContext(err).to_string())
            })?;

        Ok(output.messages().iter().map(raw_message).collect())
    }

    async fn acknowledge(&self, queue_url: &str, receipt_handle: &str) -> Result<(), TransportError> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|err| {
                TransportError::new(Operation::Delete, DisplayErrorContext(err).to_string())
            })?;
        Ok(())
    }

    async fn extend_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: time::Duration,
    ) -> Result<(), TransportError> {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds(timeout))
            .send()
            .await
            .map_err(|err| {
                TransportError::new(
                    Operation::ChangeVisibility,
                    DisplayErrorContext(err).to_string(),
                )
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_sqs::primitives::Blob;

    #[test]
    fn test_converts_sqs_message() {
        let message = Message::builder()
            .message_id("id-1")
            .receipt_handle("handle-1")
            .body("Message: 0")
            .message_attributes(
                "kind",
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value("order")
                    .build()
                    .unwrap(),
            )
            .message_attributes(
                "blob",
                MessageAttributeValue::builder()
                    .data_type("Binary")
                    .binary_value(Blob::new(vec![1u8, 2, 3]))
                    .build()
                    .unwrap(),
            )
            .build();

        let raw = raw_message(&message);

        assert_eq!(raw.message_id.as_deref(), Some("id-1"));
        assert_eq!(raw.receipt_handle, "handle-1");
        assert_eq!(raw.body, Bytes::from_static(b"Message: 0"));
        assert_eq!(
            raw.attributes.get("kind"),
            Some(&MessageAttribute::String("order".to_string()))
        );
        assert_eq!(
            raw.attributes.get("blob"),
            Some(&MessageAttribute::Binary(Bytes::from_static(&[1, 2, 3])))
        );
    }

    #[test]
    fn test_durations_are_whole_seconds() {
        assert_eq!(seconds(time::Duration::from_millis(10_900)), 10);
        assert_eq!(seconds(time::Duration::from_secs(u64::MAX)), i32::MAX);
    }
}
