//! Periodic staleness classification.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::notification::{self, NotificationDispatcher};
use crate::store::{PrequelRepository, StalenessReport};

/// Runs the staleness engine on a fixed interval and sends a digest of the
/// stale PRs after each run.
#[derive(Clone)]
pub struct StalenessScheduler {
    repository: PrequelRepository,
    dispatcher: NotificationDispatcher,
    period: Duration,
    threshold_days: u32,
}

/// Owner of a running scheduler task. Dropping the handle without calling
/// [`SchedulerHandle::stop`] also stops the task at its next wake-up.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the task to stop and wait for it. A run in progress completes
    /// first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Staleness scheduler task failed: {}", e);
        }
        info!("Staleness scheduler stopped");
    }
}

impl StalenessScheduler {
    pub fn new(
        repository: PrequelRepository,
        dispatcher: NotificationDispatcher,
        period: Duration,
        threshold_days: u32,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            period,
            threshold_days,
        }
    }

    /// Start the loop. The first run happens immediately.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(self.run(receiver));
        SchedulerHandle { shutdown, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Staleness scheduler started: every {:?}, threshold {} days",
            self.period, self.threshold_days
        );
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means shut down.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One classification pass followed by the digest. Errors are logged.
    pub async fn run_once(&self) -> Option<StalenessReport> {
        let report = match self
            .repository
            .staleness
            .mark_stale_prs(self.threshold_days)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                error!("Scheduled staleness run failed: {}", e);
                return None;
            }
        };

        if self.dispatcher.is_enabled() {
            let stale = self.repository.analytics.stale_prs().await;
            if let Some(digest) = notification::stale_digest(&stale, self.threshold_days) {
                self.dispatcher.dispatch(digest);
            }
        }

        Some(report)
    }
}
