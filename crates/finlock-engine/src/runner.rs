use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Engine;

/// Periodic reconciliation sweep.
pub struct SweepRunner {
    engine: Arc<Engine>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl SweepRunner {
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the sweep loop. Blocks until shutdown.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "sweep runner started");
        tokio::select! {
            () = self.sweep_loop() => {}
            () = self.shutdown.cancelled() => {
                info!("sweep runner shutting down");
            }
        }
    }

    async fn sweep_loop(&self) {
        if self.interval.is_zero() {
            // Disabled -- park forever
            std::future::pending::<()>().await;
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; startup recovery already swept
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let result = self.engine.sweep().await;
            if !result.errors.is_empty() {
                warn!(errors = ?result.errors, "sweep errors");
            }
        }
    }
}
