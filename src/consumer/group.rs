//! Idempotent consumer-group creation

use crate::consumer::broker::StreamBroker;
use crate::consumer::error::BrokerError;
use tracing::{error, info};

/// Result of [`ensure_group`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// This call created the group
    Created,
    /// Another initializer got there first
    AlreadyExisted,
}

/// Make sure `group` exists on `stream`, creating the stream if needed.
///
/// An existing group counts as success so any number of instances can race
/// through startup. Every other broker error is returned.
pub async fn ensure_group<B: StreamBroker + ?Sized>(
    broker: &mut B,
    stream: &str,
    group: &str,
    start_id: &str,
) -> Result<GroupStatus, BrokerError> {
    match broker.create_group(stream, group, start_id).await {
        Ok(()) => {
            info!(stream, group, start_id, "Created consumer group");
            Ok(GroupStatus::Created)
        }
        Err(BrokerError::GroupAlreadyExists(_)) => {
            info!(stream, group, "Consumer group already exists");
            Ok(GroupStatus::AlreadyExisted)
        }
        Err(e) => {
            error!(
                stream,
                group,
                error = %e,
                error.kind = e.kind(),
                "Failed to create consumer group"
            );
            Err(e)
        }
    }
}
