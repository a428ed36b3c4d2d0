//! Startup connection establishment with capped exponential backoff

use crate::consumer::broker::{BrokerFactory, StreamBroker};
use crate::consumer::error::{BrokerError, ConnectionError};
use crate::consumer::retry::{RetryPolicy, RetryState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Opens a broker connection, retrying failed attempts with backoff.
pub struct Connector<F: BrokerFactory> {
    factory: F,
    state: RetryState,
}

impl<F: BrokerFactory> Connector<F> {
    /// Create a connector for a factory and policy
    pub fn new(factory: F, policy: RetryPolicy) -> Self {
        Self {
            factory,
            state: RetryState::new(policy),
        }
    }

    /// Current retry bookkeeping
    pub fn retry_state(&self) -> &RetryState {
        &self.state
    }

    /// Connect and probe liveness.
    ///
    /// Sleeps `min(initial * 2^n, max)` after the n-th failure (zero-based) and
    /// gives up with the last error after `max_attempts` failures. No sleep
    /// follows the final attempt. Cancellation during a backoff sleep returns
    /// [`ConnectionError::Cancelled`].
    pub async fn connect(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<F::Broker, ConnectionError> {
        let max_attempts = self.state.policy().max_attempts;
        let address = self.factory.describe();

        loop {
            if cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled {
                    attempts: self.state.attempt(),
                });
            }

            let attempt = self.state.attempt() + 1;
            let error = match self.try_connect().await {
                Ok(broker) => {
                    info!(attempt, address = %address, "Connected to broker");
                    self.state.reset();
                    return Ok(broker);
                }
                Err(e) => e,
            };

            match self.state.record_failure() {
                Some(delay) => {
                    warn!(
                        attempt,
                        max_attempts,
                        address = %address,
                        error = %error,
                        error.kind = "startup_connection",
                        "Failed to connect to broker, retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(attempt, "Connection retry cancelled");
                            return Err(ConnectionError::Cancelled { attempts: attempt });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    error!(
                        attempts = attempt,
                        address = %address,
                        error = %error,
                        error.kind = "startup_connection",
                        "Giving up connecting to broker"
                    );
                    return Err(ConnectionError::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<F::Broker, BrokerError> {
        let mut broker = self.factory.open().await?;
        broker.ping().await?;
        Ok(broker)
    }
}
