//! Background retention sweep

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::usage::config::RetentionPolicy;
use crate::usage::telemetry::storage::{ApiRequestRepository, StorageError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

/// Apply the age cutoff, then the count cap
pub fn sweep_once(
    repository: &dyn ApiRequestRepository,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<SweepReport, StorageError> {
    let mut report = SweepReport::default();

    if let Some(max_age) = policy.max_age {
        // An age too large for chrono keeps everything
        if let Ok(age) = chrono::Duration::from_std(max_age) {
            if let Some(cutoff) = now.checked_sub_signed(age) {
                report.expired = repository.delete_older_than(cutoff)?;
            }
        }
    }

    if policy.max_records.is_some() {
        report.evicted = repository.evict_overflow()?;
    }

    Ok(report)
}

/// Start the periodic retention sweep.
///
/// The first sweep runs immediately. Returns `None` when the policy has no
/// limits. The task ends when `shutdown` is cancelled.
pub fn start_retention_sweeper(
    repository: Arc<dyn ApiRequestRepository>,
    policy: RetentionPolicy,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if policy.is_disabled() {
        log::info!("Retention disabled, not starting sweeper");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = interval(policy.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let repo = repository.clone();
            let result =
                tokio::task::spawn_blocking(move || sweep_once(repo.as_ref(), &policy, Utc::now()))
                    .await;

            match result {
                Ok(Ok(report)) if report.expired + report.evicted > 0 => {
                    log::info!(
                        "Retention sweep removed {} expired and {} overflow records",
                        report.expired,
                        report.evicted
                    );
                }
                Ok(Ok(_)) => log::debug!("Retention sweep found nothing to remove"),
                Ok(Err(e)) => log::warn!("Retention sweep failed: {}", e),
                Err(e) => log::error!("Retention sweep task panicked: {}", e),
            }
        }

        log::debug!("Retention sweeper stopped");
    }))
}
