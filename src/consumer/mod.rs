//! Redis Streams consumer-group worker
//!
//! This module provides an at-least-once consumer with:
//! - Startup connection retry with capped exponential backoff
//! - Idempotent consumer-group creation
//! - A sequential fetch / handle / acknowledge loop that never exits on errors
//! - Panic isolation around the message handler
//! - Graceful shutdown on interrupt
//!
//! # Example
//!
//! ```no_run
//! use stream_consumer::consumer::{
//!     create_consumer, ConsumerConfig, HandlerError, MessageHandler, RedisBrokerFactory,
//!     ShutdownCoordinator, ShutdownState, StreamMessage,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl MessageHandler for PrintHandler {
//!     async fn handle(&self, message: &StreamMessage) -> Result<(), HandlerError> {
//!         println!("{} {:?}", message.id, message.field("content"));
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ConsumerConfig::builder()
//!     .host("localhost")
//!     .stream("message_stream")
//!     .group("processors")
//!     .build();
//!
//! let shutdown = Arc::new(ShutdownState::new());
//! ShutdownCoordinator::new(shutdown.clone()).install_signal_handler();
//!
//! let factory = RedisBrokerFactory::new(&config)?;
//! let consumer = create_consumer(factory, PrintHandler, config, shutdown).await?;
//! consumer.run().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod error;
pub mod group;
pub mod identity;
pub mod memory;
pub mod metrics;
pub mod processor;
#[cfg(feature = "redis")]
pub mod redis_broker;
pub mod retry;
pub mod shutdown;

pub use broker::{BrokerFactory, ReadGroupRequest, StreamBroker, StreamMessage};
pub use config::{ConsumerConfig, ConsumerConfigBuilder, MalformedPolicy};
pub use connector::Connector;
pub use consumer::{IterationOutcome, RunSummary, StreamConsumer};
pub use error::{
    BrokerError, ConnectionError, ConsumerError, ConsumerResult, ErrorSeverity, HandlerError,
};
pub use group::{ensure_group, GroupStatus};
pub use identity::ConsumerIdentity;
pub use metrics::{ConsumerMetrics, MetricsSnapshot};
pub use processor::{LoggingHandler, MessageHandler};
#[cfg(feature = "redis")]
pub use redis_broker::{RedisBroker, RedisBrokerFactory};
pub use retry::{RetryPolicy, RetryState};
pub use shutdown::{ShutdownCoordinator, ShutdownState};

use std::sync::Arc;
use tracing::info;

/// Connect, ensure the group exists and build a consumer under a fresh identity.
///
/// Fails on invalid configuration, exhausted connection retries, or a group
/// creation error other than "already exists". A shutdown request during
/// startup yields an error for which [`ConsumerError::is_shutdown`] holds.
pub async fn create_consumer<F, H>(
    factory: F,
    handler: H,
    config: ConsumerConfig,
    shutdown_state: Arc<ShutdownState>,
) -> ConsumerResult<StreamConsumer<F::Broker, H>>
where
    F: BrokerFactory,
    H: MessageHandler,
{
    config.validate().map_err(ConsumerError::ConfigError)?;
    info!("Creating consumer with config: {:?}", config);

    let token = shutdown_state.token();
    let mut connector = Connector::new(factory, config.retry_policy.clone());
    let mut broker = connector.connect(&token).await?;

    tokio::select! {
        biased;
        _ = token.cancelled() => return Err(ConsumerError::ShutdownRequested),
        result = ensure_group(
            &mut broker,
            &config.stream,
            &config.group,
            &config.group_start_id,
        ) => {
            result?;
        }
    }

    let identity = ConsumerIdentity::generate(&config.consumer_prefix);
    info!(consumer = %identity, "Starting consumer");

    Ok(StreamConsumer::new(
        broker,
        handler,
        config,
        identity,
        shutdown_state,
    ))
}
