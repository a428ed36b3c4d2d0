//! At-least-once consumer for Redis Streams consumer groups
//!
//! The crate drains a stream through a consumer group: it connects with
//! bounded exponential backoff, creates the group idempotently, then loops
//! over blocking fetches, handing each entry to a [`MessageHandler`] and
//! acknowledging it only after the handler succeeds. Steady-state failures
//! are logged and absorbed; only startup failures are fatal.
//!
//! # Example
//!
//! ```no_run
//! use stream_consumer::consumer::{
//!     create_consumer, ConsumerConfig, LoggingHandler, RedisBrokerFactory, ShutdownCoordinator,
//!     ShutdownState,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ConsumerConfig::from_env().map_err(anyhow::Error::msg)?;
//! let handler = LoggingHandler::new(config.required_fields.clone(), config.processing_delay);
//!
//! let shutdown = Arc::new(ShutdownState::new());
//! ShutdownCoordinator::new(shutdown.clone()).install_signal_handler();
//!
//! let factory = RedisBrokerFactory::new(&config)?;
//! let summary = create_consumer(factory, handler, config, shutdown)
//!     .await?
//!     .run()
//!     .await;
//! tracing::info!("acknowledged {} messages", summary.acknowledged);
//! # Ok(())
//! # }
//! ```
//!
//! [`MessageHandler`]: consumer::MessageHandler

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

/// Consumer-group worker: connection, group setup, consumption loop
pub mod consumer;

/// Logging initialisation
pub mod telemetry;

pub use consumer::{
    ConsumerConfig, ConsumerError, ConsumerResult, MessageHandler, StreamConsumer, StreamMessage,
};
