use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use slotbook_booking::RefundCoordinator;

const REFUND_BATCH: i64 = 50;

/// Retries PENDING refunds whose backoff has elapsed, forever.
pub async fn start_refund_worker(refunds: Arc<RefundCoordinator>, poll_every: Duration) {
    let mut ticker = interval(poll_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Refund worker started, polling every {:?}", poll_every);

    loop {
        ticker.tick().await;
        match refunds.retry_due(REFUND_BATCH).await {
            Ok(summary) if summary.attempted == 0 => {}
            Ok(summary) if summary.still_pending > 0 => warn!(
                attempted = summary.attempted,
                issued = summary.issued,
                still_pending = summary.still_pending,
                "Refund retry pass left refunds pending"
            ),
            Ok(summary) => info!(
                attempted = summary.attempted,
                issued = summary.issued,
                "Refund retry pass complete"
            ),
            Err(e) => error!("Refund retry pass failed: {}", e),
        }
    }
}
