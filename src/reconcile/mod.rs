//! Fill reconciliation against venue order history.
//!
//! One engine per (venue, subaccount, instrument), run on an independent
//! schedule. The engines only communicate with the rest of the system through
//! the durable store and the per-subaccount summary's trust flag.

mod engine;

pub use engine::{
    OrderHistorySource, ReconSummary, ReconcileEngine, ReconcileError, ReconcileReport,
};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Drive an engine on a fixed interval until shutdown.
///
/// Fetch failures are logged and absorbed; the schedule simply waits for the
/// next tick rather than escalating.
pub async fn run_schedule(
    engine: Arc<ReconcileEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Reconciliation schedule stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = engine.run_once(Utc::now()).await {
                    error!(error = %e, "Reconciliation pass failed; will retry next tick");
                }
            }
        }
    }
}
