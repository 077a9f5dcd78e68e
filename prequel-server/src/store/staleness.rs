//! Stale pull request classification.

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, TransactionBehavior};
use tracing::info;

use super::{to_epoch, Database, StoreError};

/// Result of one classification run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalenessReport {
    pub newly_stale: u64,
    pub cleared: u64,
}

impl StalenessReport {
    /// Rows whose `is_stale` flag changed.
    pub fn updated(&self) -> u64 {
        self.newly_stale + self.cleared
    }
}

/// Recomputes `is_stale` for every pull request.
///
/// A pull request is stale iff it is open and its last activity is more than
/// `threshold_days` old. Each run fully recomputes the flag, so missed runs
/// are corrected by the next one and repeating a run changes nothing.
#[derive(Clone)]
pub struct StalenessEngine {
    db: Database,
}

impl StalenessEngine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn mark_stale_prs(&self, threshold_days: u32) -> Result<StalenessReport, StoreError> {
        self.mark_stale_prs_at(threshold_days, Utc::now()).await
    }

    /// [`Self::mark_stale_prs`] evaluated at a fixed `now`.
    pub async fn mark_stale_prs_at(
        &self,
        threshold_days: u32,
        now: DateTime<Utc>,
    ) -> Result<StalenessReport, StoreError> {
        let cutoff = staleness_cutoff(now, threshold_days)?;

        let report = self
            .db
            .run("mark stale pull requests", move |conn| {
                // One write transaction; only rows whose flag flips are touched.
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| StoreError::storage("begin transaction", e.to_string()))?;

                let newly_stale = tx
                    .execute(
                        r#"
                        UPDATE pull_requests SET is_stale = 1
                        WHERE state = 'open' AND last_activity_at < ?1 AND is_stale = 0
                        "#,
                        params![cutoff],
                    )
                    .map_err(|e| StoreError::storage("mark stale", e.to_string()))?;

                let cleared = tx
                    .execute(
                        r#"
                        UPDATE pull_requests SET is_stale = 0
                        WHERE is_stale = 1 AND (state != 'open' OR last_activity_at >= ?1)
                        "#,
                        params![cutoff],
                    )
                    .map_err(|e| StoreError::storage("clear stale", e.to_string()))?;

                tx.commit()
                    .map_err(|e| StoreError::storage("commit transaction", e.to_string()))?;

                Ok(StalenessReport {
                    newly_stale: newly_stale as u64,
                    cleared: cleared as u64,
                })
            })
            .await?;

        info!(
            "Staleness run (threshold {} days): {} newly stale, {} cleared",
            threshold_days, report.newly_stale, report.cleared
        );
        Ok(report)
    }
}

/// Epoch seconds before which an open pull request's activity counts as stale.
fn staleness_cutoff(now: DateTime<Utc>, threshold_days: u32) -> Result<i64, StoreError> {
    TimeDelta::try_days(i64::from(threshold_days))
        .and_then(|threshold| now.checked_sub_signed(threshold))
        .map(to_epoch)
        .ok_or_else(|| {
            StoreError::storage(
                "staleness cutoff",
                format!("threshold of {} days is out of range", threshold_days),
            )
        })
}
