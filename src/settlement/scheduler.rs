// Payout Scheduler - drives the payout engine on a fixed cadence
//
// - First cycle runs one full period after startup, so the poller has had a
//   chance to bring the ledger up to date
// - Cycles never overlap: the next tick waits for the current cycle
// - Shutdown is only observed between cycles, never mid-send

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{error, info};

use super::payout::PayoutEngine;

/// Payout scheduler - runs [`PayoutEngine::run_cycle`] every `frequency`
pub struct PayoutScheduler {
    engine: Arc<PayoutEngine>,
    frequency: Duration,
}

impl PayoutScheduler {
    pub fn new(engine: Arc<PayoutEngine>, frequency: Duration) -> Self {
        Self { engine, frequency }
    }

    /// Start the payout loop (runs in background)
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let frequency = self.frequency;

        tokio::spawn(async move {
            info!(
                "⏰ Payout scheduler started (every {:?}, threshold {} wei)",
                frequency,
                engine.threshold()
            );

            let mut ticker = interval_at(Instant::now() + frequency, frequency);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                info!("🔄 Starting payout cycle");
                match engine.run_cycle().await {
                    Ok(report) => info!(
                        "✓ Payout cycle completed: {} workers scanned, {} paid",
                        report.scanned,
                        report.paid_count()
                    ),
                    Err(e) => error!("❌ Payout cycle failed: {}", e),
                }
            }

            info!("Payout scheduler stopped");
        })
    }
}
