//! Background ticker driving periodic scheduler passes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::dispatch::dispatcher::Dispatcher;

/// Spawn the scheduler ticker background task.
///
/// The interval is an operational parameter, not a core design constant;
/// the pass itself is stateless, so overlapping or concurrent invocations
/// are safe.
pub fn spawn_ticker(dispatcher: Arc<Dispatcher>, interval: Duration) -> tokio::task::JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Scheduler ticker started");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            dispatcher.run_pass(Utc::now()).await;
        }
    })
}
