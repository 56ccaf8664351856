//! Background housekeeping for staged transfer requests.
//!
//! Expiry is enforced on every read, so the sweeper only keeps the table
//! honest for reporting and for the partial unique index on pending rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use sea_orm::DatabaseConnection;
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::error::SlotError;
use crate::repositories::TransferRequestRepository;

#[derive(Debug, Clone)]
pub struct TransferRequestSweeper {
    db: Arc<DatabaseConnection>,
    interval: TokioDuration,
}

impl TransferRequestSweeper {
    pub fn new(db: Arc<DatabaseConnection>, interval_seconds: u64) -> Self {
        Self {
            db,
            interval: TokioDuration::from_secs(interval_seconds.max(1)),
        }
    }

    /// Run the sweep loop until the provided shutdown token fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_seconds = self.interval.as_secs(),
            "Starting transfer request sweeper"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Transfer request sweeper shutdown requested");
                    break;
                }
                _ = sleep(self.next_delay()) => {
                    if let Err(err) = self.sweep_once(Utc::now()).await {
                        error!(error = %err, "Transfer request sweep failed");
                    }
                }
            }
        }

        info!("Transfer request sweeper stopped");
    }

    /// Flips every overdue pending request to expired
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<u64, SlotError> {
        let expired = TransferRequestRepository::expire_overdue(&*self.db, now, None).await?;
        if expired > 0 {
            counter!("slot_transfer_requests_expired_total").increment(expired);
            info!(expired, "Expired overdue transfer requests");
        } else {
            debug!("No overdue transfer requests");
        }
        Ok(expired)
    }

    /// Base interval plus up to 10% jitter
    fn next_delay(&self) -> TokioDuration {
        let max_jitter_ms = (self.interval.as_millis() / 10) as u64;
        let jitter_ms = if max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter_ms)
        };
        self.interval + TokioDuration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_window() {
        let sweeper = TransferRequestSweeper::new(
            Arc::new(DatabaseConnection::Disconnected),
            60,
        );
        for _ in 0..50 {
            let delay = sweeper.next_delay();
            assert!(delay >= TokioDuration::from_secs(60));
            assert!(delay <= TokioDuration::from_secs(66));
        }
    }

    #[tokio::test]
    async fn run_returns_once_cancelled() {
        let sweeper = TransferRequestSweeper::new(
            Arc::new(DatabaseConnection::Disconnected),
            3600,
        );
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        sweeper.run(shutdown).await;
    }
}
