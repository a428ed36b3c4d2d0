//! Message handler trait and implementations

use crate::consumer::broker::StreamMessage;
use crate::consumer::error::HandlerError;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::info;

/// Unit of work applied to every fetched entry
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process a single message
    async fn handle(&self, message: &StreamMessage) -> Result<(), HandlerError>;

    /// Get handler name for logs
    fn name(&self) -> &str {
        "MessageHandler"
    }
}

/// Outcome of one isolated handler invocation
#[derive(Debug)]
pub struct HandlerOutcome {
    /// What the handler reported, panics included
    pub result: Result<(), HandlerError>,
    /// Wall time spent in the handler
    pub duration: Duration,
}

/// Run the handler, turning a panic into [`HandlerError::Panicked`].
pub async fn invoke_isolated<H: MessageHandler + ?Sized>(
    handler: &H,
    message: &StreamMessage,
) -> HandlerOutcome {
    let start = Instant::now();
    let result = match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
    };
    HandlerOutcome {
        result,
        duration: start.elapsed(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Logs the well-known fields of each entry and simulates work with a fixed delay.
pub struct LoggingHandler {
    required_fields: Vec<String>,
    processing_delay: Duration,
}

impl LoggingHandler {
    /// Create a handler checking `required_fields` and sleeping `processing_delay` per entry
    pub fn new(required_fields: Vec<String>, processing_delay: Duration) -> Self {
        Self {
            required_fields,
            processing_delay,
        }
    }
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &StreamMessage) -> Result<(), HandlerError> {
        message.require_fields(&self.required_fields)?;

        info!(
            message_id = %message.id,
            stream = %message.stream,
            id = message.field("id").unwrap_or_default(),
            content = message.field("content").unwrap_or_default(),
            timestamp = message.field("timestamp").unwrap_or_default(),
            sender = message.field("sender").unwrap_or_default(),
            received_at = %message.received_at.to_rfc3339(),
            "Processing message"
        );

        tokio::time::sleep(self.processing_delay).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "LoggingHandler"
    }
}
