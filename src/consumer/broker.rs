//! Broker abstraction: the four stream commands the consumer depends on

use crate::consumer::error::{BrokerError, HandlerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Read only entries never delivered to this group
pub const NEW_ENTRIES_ID: &str = ">";

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Broker-assigned entry id, e.g. `1718000000000-0`
    pub id: String,
    /// Stream the entry was read from
    pub stream: String,
    /// Field/value pairs as appended by the producer
    pub fields: BTreeMap<String, String>,
    /// Local time the consumer received the entry
    pub received_at: DateTime<Utc>,
}

impl StreamMessage {
    /// Build a message received now
    pub fn new(
        stream: impl Into<String>,
        id: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            stream: stream.into(),
            fields,
            received_at: Utc::now(),
        }
    }

    /// Value of a field, if present
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Fail with [`HandlerError::Malformed`] listing every absent field.
    pub fn require_fields<S: AsRef<str>>(&self, names: &[S]) -> Result<(), HandlerError> {
        let missing: Vec<String> = names
            .iter()
            .map(|name| name.as_ref())
            .filter(|name| !self.fields.contains_key(*name))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(HandlerError::Malformed {
                message_id: self.id.clone(),
                missing,
            })
        }
    }
}

/// Parameters of a consumer-group read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroupRequest {
    /// Stream to read
    pub stream: String,
    /// Consumer group name
    pub group: String,
    /// Consumer name within the group
    pub consumer: String,
    /// Maximum entries returned
    pub count: usize,
    /// How long the broker may hold the request open when idle
    pub block: Duration,
}

/// The stream commands used by the consumer.
///
/// Implementations own one connection; the consumer never shares it between tasks.
#[async_trait]
pub trait StreamBroker: Send + 'static {
    /// Liveness probe
    async fn ping(&mut self) -> Result<(), BrokerError>;

    /// Create `group` on `stream` at `start_id`, creating the stream if missing.
    ///
    /// Reports an existing group as [`BrokerError::GroupAlreadyExists`].
    async fn create_group(
        &mut self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BrokerError>;

    /// Fetch new entries for a consumer, in delivery order.
    ///
    /// Returns an empty batch when nothing arrives within `request.block`.
    async fn read_group(
        &mut self,
        request: &ReadGroupRequest,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Acknowledge one entry; returns how many entries the broker removed
    /// from the pending list.
    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<u64, BrokerError>;
}

/// Opens broker connections for the [`Connector`](crate::consumer::Connector).
#[async_trait]
pub trait BrokerFactory: Send + Sync {
    /// Connection type produced
    type Broker: StreamBroker;

    /// Open a connection; liveness is checked separately by the caller.
    async fn open(&self) -> Result<Self::Broker, BrokerError>;

    /// Human-readable broker address for logs
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(fields: &[(&str, &str)]) -> StreamMessage {
        StreamMessage::new(
            "message_stream",
            "1-0",
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_field_lookup() {
        let msg = message(&[("content", "hello"), ("sender", "nodejs-app")]);
        assert_eq!(msg.field("content"), Some("hello"));
        assert_eq!(msg.field("missing"), None);
    }

    #[test]
    fn test_require_fields_reports_all_missing() {
        let msg = message(&[("id", "1")]);
        let err = msg
            .require_fields(&["id", "content", "sender"])
            .unwrap_err();
        assert_eq!(
            err,
            HandlerError::Malformed {
                message_id: "1-0".into(),
                missing: vec!["content".into(), "sender".into()],
            }
        );
        assert!(msg.require_fields(&["id"]).is_ok());
        assert!(msg.require_fields::<&str>(&[]).is_ok());
    }
}
