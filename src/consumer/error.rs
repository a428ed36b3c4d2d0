//! Consumer error types

use thiserror::Error;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors raised by the broker during a single command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The transport failed: refused, dropped, or reset connection
    #[error("Broker I/O error: {0}")]
    Io(String),

    /// The broker did not answer within the response timeout
    #[error("Broker timeout: {0}")]
    Timeout(String),

    /// The consumer group already exists (BUSYGROUP)
    #[error("Consumer group already exists: {0}")]
    GroupAlreadyExists(String),

    /// The broker rejected the command
    #[error("Broker command failed: {0}")]
    Command(String),

    /// The broker answered with something we could not decode
    #[error("Unexpected broker response: {0}")]
    Response(String),
}

impl BrokerError {
    /// Whether the failure is expected to clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Io(_) | BrokerError::Timeout(_))
    }

    /// Short label used in the `error.kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Io(_) => "broker_io",
            BrokerError::Timeout(_) => "broker_timeout",
            BrokerError::GroupAlreadyExists(_) => "group_exists",
            BrokerError::Command(_) => "broker_command",
            BrokerError::Response(_) => "broker_response",
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        if is_busygroup(&err) {
            BrokerError::GroupAlreadyExists(err.to_string())
        } else if err.is_timeout() {
            BrokerError::Timeout(err.to_string())
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            BrokerError::Io(err.to_string())
        } else if err.kind() == redis::ErrorKind::TypeError {
            BrokerError::Response(err.to_string())
        } else {
            BrokerError::Command(err.to_string())
        }
    }
}

/// Parsed replies carry the code; hand-built errors only carry it in the text.
#[cfg(feature = "redis")]
fn is_busygroup(err: &redis::RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
        || (err.kind() == redis::ErrorKind::ExtensionError
            && err.to_string().contains("BUSYGROUP"))
}

/// Startup connection failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Every attempt failed; carries the last broker error
    #[error("Failed to connect after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error of the final attempt
        last_error: BrokerError,
    },

    /// Shutdown was requested while waiting to retry
    #[error("Connection cancelled after {attempts} attempts")]
    Cancelled {
        /// Number of attempts made before cancellation
        attempts: u32,
    },
}

/// Failures produced by a [`MessageHandler`](crate::consumer::MessageHandler).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Required fields are absent from the entry
    #[error("Malformed message {message_id}: missing fields {missing:?}")]
    Malformed {
        /// Broker-assigned id of the entry
        message_id: String,
        /// Names of the missing fields
        missing: Vec<String>,
    },

    /// The handler ran and reported a failure
    #[error("Processing error: {0}")]
    Processing(String),

    /// The handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// True for entries that redelivery cannot repair.
    pub fn is_malformed(&self) -> bool {
        matches!(self, HandlerError::Malformed { .. })
    }

    /// Short label used in the `error.kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Malformed { .. } => "malformed_message",
            HandlerError::Processing(_) => "handler_error",
            HandlerError::Panicked(_) => "handler_panic",
        }
    }
}

/// Consumer error types
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Startup connection errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Broker errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Handler errors
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Shutdown was requested before startup finished
    #[error("Shutdown requested during startup")]
    ShutdownRequested,
}

impl ConsumerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsumerError::ConfigError(_) => false,
            ConsumerError::Connection(ConnectionError::Exhausted { .. }) => false,
            ConsumerError::Connection(ConnectionError::Cancelled { .. }) => false,
            ConsumerError::Broker(e) => e.is_transient(),
            ConsumerError::Handler(e) => !e.is_malformed(),
            ConsumerError::ShutdownRequested => false,
        }
    }

    /// True when startup ended because shutdown was requested, not because it failed.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            ConsumerError::ShutdownRequested
                | ConsumerError::Connection(ConnectionError::Cancelled { .. })
        )
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ConsumerError::ConfigError(_) => ErrorSeverity::Fatal,
            ConsumerError::Connection(_) => ErrorSeverity::Fatal,
            ConsumerError::Broker(BrokerError::GroupAlreadyExists(_)) => ErrorSeverity::Warning,
            ConsumerError::Broker(_) => ErrorSeverity::Error,
            ConsumerError::Handler(HandlerError::Malformed { .. }) => ErrorSeverity::Warning,
            ConsumerError::Handler(_) => ErrorSeverity::Error,
            ConsumerError::ShutdownRequested => ErrorSeverity::Warning,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Warnings that don't stop processing
    Warning,
    /// Errors that are logged and absorbed
    Error,
    /// Fatal errors that stop the consumer
    Fatal,
}
