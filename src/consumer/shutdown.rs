//! Graceful shutdown management for the consumer

use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Shared shutdown state observed by the consumption loop
#[derive(Debug)]
pub struct ShutdownState {
    /// Cancelled once shutdown begins
    token: CancellationToken,
    /// Whether shutdown is complete
    shutdown_complete: AtomicBool,
    /// Messages between fetch and acknowledgment
    inflight_messages: AtomicUsize,
    /// Shutdown initiated timestamp
    shutdown_start: RwLock<Option<Instant>>,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            shutdown_complete: AtomicBool::new(false),
            inflight_messages: AtomicUsize::new(0),
            shutdown_start: RwLock::new(None),
        }
    }

    /// Token cancelled when shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Begin the shutdown process; later calls are no-ops
    pub fn begin_shutdown(&self, reason: &str) {
        {
            let mut start = self.shutdown_start.write();
            if start.is_some() {
                return;
            }
            *start = Some(Instant::now());
        }
        info!(reason, inflight = self.inflight_count(), "Shutdown initiated");
        self.token.cancel();
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Complete the shutdown process
    pub fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::Relaxed);
        if let Some(duration) = self.shutdown_duration() {
            info!("Shutdown completed in {:?}", duration);
        }
    }

    /// Check if shutdown is complete
    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Relaxed)
    }

    /// Add an in-flight message
    pub fn add_inflight_message(&self) {
        let count = self.inflight_messages.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("In-flight messages: {}", count);
    }

    /// Remove an in-flight message
    pub fn remove_inflight_message(&self) {
        let count = self.inflight_messages.fetch_sub(1, Ordering::Relaxed);
        if count > 0 {
            debug!("In-flight messages: {}", count - 1);
        }
    }

    /// Get the count of in-flight messages
    pub fn inflight_count(&self) -> usize {
        self.inflight_messages.load(Ordering::Relaxed)
    }

    /// Get the duration since shutdown started
    pub fn shutdown_duration(&self) -> Option<Duration> {
        self.shutdown_start.read().map(|start| start.elapsed())
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns an external signal into cancellation of the shared [`ShutdownState`].
pub struct ShutdownCoordinator {
    state: Arc<ShutdownState>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(state: Arc<ShutdownState>) -> Self {
        Self { state }
    }

    /// The state this coordinator cancels
    pub fn state(&self) -> Arc<ShutdownState> {
        self.state.clone()
    }

    /// Begin shutdown on Ctrl-C / SIGINT
    pub fn install_signal_handler(&self) -> JoinHandle<()> {
        self.watch(tokio::signal::ctrl_c(), "interrupt signal")
    }

    /// Begin shutdown when `signal` resolves successfully.
    ///
    /// The watcher exits quietly if shutdown starts some other way first.
    pub fn watch<F>(&self, signal: F, reason: &'static str) -> JoinHandle<()>
    where
        F: Future<Output = std::io::Result<()>> + Send + 'static,
    {
        let state = self.state.clone();
        let token = state.token();

        tokio::spawn(async move {
            tokio::select! {
                result = signal => match result {
                    Ok(()) => state.begin_shutdown(reason),
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                },
                _ = token.cancelled() => {}
            }
        })
    }

    /// Begin shutdown programmatically
    pub fn trigger(&self, reason: &str) {
        self.state.begin_shutdown(reason);
    }
}
