//! Main consumption loop: fetch, handle, acknowledge

use crate::consumer::{
    broker::{ReadGroupRequest, StreamBroker, StreamMessage},
    config::{ConsumerConfig, MalformedPolicy},
    identity::ConsumerIdentity,
    metrics::ConsumerMetrics,
    processor::{invoke_isolated, MessageHandler},
    shutdown::ShutdownState,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Totals reported when the loop exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Loop iterations started
    pub iterations: u64,
    /// Entries returned by fetches
    pub fetched: u64,
    /// Entries the handler accepted
    pub processed: u64,
    /// Entries the handler rejected, malformed ones included
    pub failed: u64,
    /// Successful XACKs
    pub acknowledged: u64,
    /// Entries deliberately or accidentally left pending
    pub left_pending: u64,
    /// Fetches that failed
    pub fetch_errors: u64,
}

/// What a single iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The fetch timed out with no entries
    Idle,
    /// `handled` entries went through handle/ack; `skipped` were left for shutdown
    Batch { handled: usize, skipped: usize },
    /// The fetch failed and the loop paused
    FetchFailed,
}

/// Sequential consumer-group worker.
///
/// Owns its broker connection. Entries are handled and acknowledged strictly
/// in delivery order.
pub struct StreamConsumer<B: StreamBroker, H: MessageHandler> {
    broker: B,
    handler: H,
    config: ConsumerConfig,
    identity: ConsumerIdentity,
    metrics: ConsumerMetrics,
    shutdown_state: Arc<ShutdownState>,
}

impl<B: StreamBroker, H: MessageHandler> StreamConsumer<B, H> {
    /// Create a consumer over an already connected broker
    pub fn new(
        broker: B,
        handler: H,
        config: ConsumerConfig,
        identity: ConsumerIdentity,
        shutdown_state: Arc<ShutdownState>,
    ) -> Self {
        Self {
            broker,
            handler,
            config,
            identity,
            metrics: ConsumerMetrics::new(),
            shutdown_state,
        }
    }

    /// Name this consumer reads under
    pub fn identity(&self) -> &ConsumerIdentity {
        &self.identity
    }

    /// Shared handle to the counters
    pub fn metrics(&self) -> ConsumerMetrics {
        self.metrics.clone()
    }

    /// Run until shutdown is requested.
    ///
    /// No error, however often repeated, ends the loop; only cancellation does.
    pub async fn run(mut self) -> RunSummary {
        let token = self.shutdown_state.token();
        let reporter = spawn_metrics_reporter(
            self.metrics.clone(),
            self.config.metrics_interval,
            token.clone(),
        );

        info!(
            consumer = %self.identity,
            stream = %self.config.stream,
            group = %self.config.group,
            handler = self.handler.name(),
            "Consumer started, waiting for messages"
        );

        let mut summary = RunSummary::default();
        while !token.is_cancelled() {
            summary.iterations += 1;
            self.poll_once(&token, &mut summary).await;
        }

        if let Err(e) = reporter.await {
            warn!("Metrics reporter ended abnormally: {}", e);
        }

        let snapshot = self.metrics.snapshot();
        info!(
            consumer = %self.identity,
            iterations = summary.iterations,
            processed = snapshot.processed,
            failed = snapshot.failed,
            acknowledged = snapshot.acknowledged,
            left_pending = summary.left_pending,
            "Consumer stopped"
        );
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(metrics = %json, "Final consumer metrics"),
            Err(e) => warn!("Failed to serialize final metrics: {}", e),
        }
        self.shutdown_state.complete_shutdown();
        summary
    }

    /// One fetch and the handling of whatever it returned.
    pub async fn poll_once(
        &mut self,
        token: &CancellationToken,
        summary: &mut RunSummary,
    ) -> IterationOutcome {
        let request = self.read_request();

        match self.broker.read_group(&request).await {
            Ok(batch) if batch.is_empty() => {
                self.metrics.increment_empty_polls();
                debug!("No new messages within block timeout");
                IterationOutcome::Idle
            }
            Ok(batch) => {
                self.metrics.add_fetched(batch.len());
                summary.fetched += batch.len() as u64;
                self.process_batch(batch, token, summary).await
            }
            Err(e) => {
                self.metrics.increment_fetch_errors();
                summary.fetch_errors += 1;
                warn!(
                    error = %e,
                    error.kind = e.kind(),
                    transient = e.is_transient(),
                    "Failed to fetch messages, pausing for {:?}",
                    self.config.error_pause
                );
                pause(self.config.error_pause, token).await;
                IterationOutcome::FetchFailed
            }
        }
    }

    async fn process_batch(
        &mut self,
        batch: Vec<StreamMessage>,
        token: &CancellationToken,
        summary: &mut RunSummary,
    ) -> IterationOutcome {
        let total = batch.len();
        let mut handled = 0;

        for message in batch {
            // The message in progress always finishes; the rest stay pending.
            if token.is_cancelled() {
                let skipped = total - handled;
                summary.left_pending += skipped as u64;
                info!(
                    skipped,
                    "Shutdown requested, leaving remaining fetched messages pending"
                );
                return IterationOutcome::Batch { handled, skipped };
            }

            self.process_message(&message, summary).await;
            handled += 1;
        }

        IterationOutcome::Batch {
            handled,
            skipped: 0,
        }
    }

    async fn process_message(&mut self, message: &StreamMessage, summary: &mut RunSummary) {
        self.shutdown_state.add_inflight_message();
        debug!(message_id = %message.id, stream = %message.stream, "Handling message");

        let outcome = invoke_isolated(&self.handler, message).await;
        self.metrics.record_handler_duration(outcome.duration);

        let should_ack = match outcome.result {
            Ok(()) => {
                self.metrics.increment_processed();
                summary.processed += 1;
                true
            }
            Err(e) if e.is_malformed() => {
                self.metrics.increment_malformed();
                self.metrics.increment_failed();
                summary.failed += 1;
                let acknowledge = self.config.malformed_policy == MalformedPolicy::Acknowledge;
                warn!(
                    message_id = %message.id,
                    error = %e,
                    error.kind = e.kind(),
                    acknowledge,
                    "Malformed message"
                );
                acknowledge
            }
            Err(e) => {
                self.metrics.increment_failed();
                summary.failed += 1;
                error!(
                    message_id = %message.id,
                    error = %e,
                    error.kind = e.kind(),
                    "Handler failed, leaving message pending for redelivery"
                );
                false
            }
        };

        if should_ack && self.acknowledge(message).await {
            summary.acknowledged += 1;
        } else {
            summary.left_pending += 1;
        }

        self.shutdown_state.remove_inflight_message();
    }

    /// XACK one entry; failures are logged and leave the entry pending.
    async fn acknowledge(&mut self, message: &StreamMessage) -> bool {
        match self
            .broker
            .ack(&self.config.stream, &self.config.group, &message.id)
            .await
        {
            Ok(removed) => {
                if removed == 0 {
                    warn!(message_id = %message.id, "Acknowledged message was not pending");
                }
                self.metrics.increment_acknowledged();
                info!(message_id = %message.id, "Acknowledged message");
                true
            }
            Err(e) => {
                self.metrics.increment_ack_failures();
                error!(
                    message_id = %message.id,
                    error = %e,
                    error.kind = "ack_failed",
                    "Failed to acknowledge message, it remains pending"
                );
                false
            }
        }
    }

    fn read_request(&self) -> ReadGroupRequest {
        ReadGroupRequest {
            stream: self.config.stream.clone(),
            group: self.config.group.clone(),
            consumer: self.identity.as_str().to_string(),
            count: self.config.batch_size,
            block: self.config.block_timeout,
        }
    }
}

/// Sleep, returning early on cancellation
async fn pause(duration: Duration, token: &CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Spawn metrics reporter
fn spawn_metrics_reporter(
    metrics: ConsumerMetrics,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = metrics.snapshot();
                    let stats = metrics.processing_stats();
                    info!(
                        fetched = snapshot.fetched,
                        processed = snapshot.processed,
                        failed = snapshot.failed,
                        acknowledged = snapshot.acknowledged,
                        ack_failures = snapshot.ack_failures,
                        fetch_errors = snapshot.fetch_errors,
                        "Consumer stats - Success rate: {:.2}%, P99 latency: {:?}",
                        metrics.success_rate() * 100.0,
                        stats.p99
                    );
                }
                _ = token.cancelled() => {
                    break;
                }
            }
        }
    })
}
