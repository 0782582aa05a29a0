use serde::de::DeserializeOwned;
use serde::Deserialize;
use time::OffsetDateTime;

/// Notification wrapper SNS puts around messages it delivers to an SQS subscription.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SnsEnvelope {
    pub message_id: String,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// The published payload, still encoded.
    pub message: String,
    pub topic_arn: String,
}

impl SnsEnvelope {
    /// Decode the published payload as JSON.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use time::macros::datetime;

    #[test]
    fn test_decodes_notification() {
        let body = json!({
            "MessageId": "f1f3a9a2-0c1e-5d6b-9d54-2b0f6cc8f6a1",
            "Type": "Notification",
            "Timestamp": "2023-05-04T10:11:12.345Z",
            "Message": "{\"order_id\":42,\"status\":\"paid\"}",
            "TopicArn": "arn:aws:sns:eu-west-1:123456789012:orders",
            "SignatureVersion": "1"
        })
        .to_string();

        let envelope: SnsEnvelope = serde_json::from_str(&body).unwrap();

        assert_eq!(envelope.kind, "Notification");
        assert_eq!(envelope.timestamp, datetime!(2023-05-04 10:11:12.345 UTC));
        assert_eq!(envelope.topic_arn, "arn:aws:sns:eu-west-1:123456789012:orders");
        assert_eq!(
            envelope.payload::<Value>().unwrap(),
            json!({"order_id": 42, "status": "paid"})
        );
    }

    #[test]
    fn test_rejects_non_json_payload() {
        let envelope = SnsEnvelope {
            message_id: "id".to_string(),
            kind: "Notification".to_string(),
            timestamp: datetime!(2023-05-04 10:11:12 UTC),
            message: "plain text".to_string(),
            topic_arn: "arn".to_string(),
        };

        assert!(envelope.payload::<Value>().is_err());
    }
}
