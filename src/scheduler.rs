//! Periodic trigger.
//!
//! Runs [`SyncEngine::run_once`] on a fixed interval until shutdown is
//! requested. Ticks that fall behind are skipped rather than bunched up. A tick
//! overlapping an HTTP-triggered invocation is harmless: claims are lock-based.

use crate::engine::SyncEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval: interval.max(Duration::from_millis(1)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle that stops the loop after its current tick
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "Sync scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.engine.run_once(None).await {
                        Ok(summary) if summary.processed > 0 => info!(
                            processed = summary.processed,
                            completed = summary.completed,
                            failed = summary.failed,
                            dead_lettered = summary.dead_lettered,
                            "Scheduled sync tick"
                        ),
                        Ok(_) => debug!("Scheduled sync tick found no work"),
                        Err(e) => error!("Scheduled sync tick failed: {}", e),
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Sync scheduler shutting down");
                    break;
                }
            }
        }
    }
}
