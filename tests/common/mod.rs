//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stream_consumer::consumer::memory::{BrokerCall, MemoryBroker};
use stream_consumer::consumer::{
    ensure_group, ConsumerConfig, ConsumerIdentity, HandlerError, MessageHandler, RetryPolicy,
    ShutdownState, StreamConsumer, StreamMessage,
};

pub const STREAM: &str = "message_stream";
pub const GROUP: &str = "processors";

/// Short timings so paused-clock tests stay readable
pub fn test_config() -> ConsumerConfig {
    ConsumerConfig::builder()
        .host("localhost")
        .stream(STREAM)
        .group(GROUP)
        .block_timeout(Duration::from_millis(100))
        .error_pause(Duration::from_millis(50))
        .processing_delay(Duration::from_millis(5))
        .retry_policy(RetryPolicy::exponential(
            3,
            Duration::from_millis(10),
            Duration::from_millis(40),
        ))
        .build()
}

/// A well-formed entry with every default required field
pub fn append_valid(broker: &MemoryBroker, content: &str) -> String {
    broker.append(
        STREAM,
        &[
            ("id", "42"),
            ("content", content),
            ("timestamp", "2024-01-01T00:00:00Z"),
            ("sender", "tests"),
        ],
    )
}

/// Handler that journals a note per entry and fails or panics on chosen ids
#[derive(Default)]
pub struct ScriptedHandler {
    broker: MemoryBroker,
    fail_on: HashSet<String>,
    panic_on: HashSet<String>,
    shutdown_on: Option<(String, Arc<ShutdownState>)>,
}

impl ScriptedHandler {
    pub fn new(broker: &MemoryBroker) -> Self {
        Self {
            broker: broker.clone(),
            ..Default::default()
        }
    }

    pub fn fail_on(mut self, id: &str) -> Self {
        self.fail_on.insert(id.to_string());
        self
    }

    pub fn panic_on(mut self, id: &str) -> Self {
        self.panic_on.insert(id.to_string());
        self
    }

    /// Request shutdown while handling `id`
    pub fn shutdown_on(mut self, id: &str, state: Arc<ShutdownState>) -> Self {
        self.shutdown_on = Some((id.to_string(), state));
        self
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, message: &StreamMessage) -> Result<(), HandlerError> {
        self.broker.note(format!("handled {}", message.id));

        if let Some((id, state)) = &self.shutdown_on {
            if *id == message.id {
                state.begin_shutdown("test");
            }
        }
        if self.panic_on.contains(&message.id) {
            panic!("scripted panic on {}", message.id);
        }
        if self.fail_on.contains(&message.id) {
            return Err(HandlerError::Processing(format!("scripted failure on {}", message.id)));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "ScriptedHandler"
    }
}

/// Consumer over `broker` with the group already created from the start of the stream
pub async fn consumer_for<H: MessageHandler>(
    broker: &MemoryBroker,
    handler: H,
    config: ConsumerConfig,
    shutdown: Arc<ShutdownState>,
) -> StreamConsumer<MemoryBroker, H> {
    let mut conn = broker.clone();
    ensure_group(&mut conn, &config.stream, &config.group, &config.group_start_id)
        .await
        .expect("group setup");
    StreamConsumer::new(conn, handler, config, ConsumerIdentity::from("consumer-test"), shutdown)
}

/// Poll `condition` on the paused clock until it holds
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Handled notes and acks, in the order the broker saw them
pub fn handle_and_ack_trace(broker: &MemoryBroker) -> Vec<String> {
    broker
        .journal()
        .into_iter()
        .filter_map(|call| match call {
            BrokerCall::Note(note) => Some(note),
            BrokerCall::Ack { id, .. } => Some(format!("ack {}", id)),
            _ => None,
        })
        .collect()
}
