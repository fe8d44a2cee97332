//! Periodic resync driving the controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::controller::Controller;

/// Configuration for the resync loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Interval between resync passes.
    pub interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Handle for stopping a running [`ResyncLoop`].
pub struct LoopStopper {
    tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop after its current pass.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Periodically re-observes every stored object, so a missed watch event
/// cannot leave drift unreconciled.
pub struct ResyncLoop {
    controller: Arc<Controller>,
    config: LoopConfig,
    stop: watch::Receiver<bool>,
}

impl ResyncLoop {
    /// Create a new loop and its stopper.
    pub fn new(controller: Arc<Controller>, config: LoopConfig) -> (Self, LoopStopper) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                controller,
                config,
                stop: rx,
            },
            LoopStopper { tx },
        )
    }

    /// Run until stopped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        info!(interval_ms = self.config.interval.as_millis() as u64, "resync loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.controller.resync().await {
                        warn!(error = %e, "resync pass failed");
                    }
                }
                _ = self.stop.changed() => {
                    if *self.stop.borrow() {
                        info!("resync loop stopped");
                        return;
                    }
                }
            }
        }
    }
}
