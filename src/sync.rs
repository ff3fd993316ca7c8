//! Recovery sweep for jobs that neither a webhook nor a poll loop converged,
//! typically because the process restarted mid-poll.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    models::{JobRecord, SyncAction, SyncItemReport, SyncReport, SyncRequest},
    provider::ProviderClient,
    reconcile::{Convergence, ReconcileOutcome, Reconciler},
    scheduler::PollScheduler,
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub stale_after: Duration,
    /// Pause between provider calls within one sweep.
    pub item_delay: Duration,
    pub batch_limit: usize,
    /// Period of the background sweep; zero disables it.
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(15 * 60),
            item_delay: Duration::from_millis(250),
            batch_limit: 50,
            interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncScope {
    pub owner_id: Option<String>,
    pub stale_after: Duration,
    pub limit: usize,
    pub resume_polling: bool,
}

pub struct ManualSync {
    provider: Arc<dyn ProviderClient>,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<PollScheduler>,
    config: SyncConfig,
}

impl ManualSync {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        reconciler: Arc<Reconciler>,
        scheduler: Arc<PollScheduler>,
        config: SyncConfig,
    ) -> Self {
        Self {
            provider,
            reconciler,
            scheduler,
            config,
        }
    }

    pub fn scope(&self, owner_id: Option<String>, request: &SyncRequest) -> SyncScope {
        SyncScope {
            owner_id,
            stale_after: request
                .older_than_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.config.stale_after),
            limit: request
                .limit
                .unwrap_or(self.config.batch_limit)
                .clamp(1, self.config.batch_limit.max(1)),
            resume_polling: request.resume_polling.unwrap_or(false),
        }
    }

    pub async fn sweep(&self, scope: &SyncScope) -> Result<SyncReport> {
        // Ages beyond chrono's range select nothing.
        let cutoff = chrono::Duration::from_std(scope.stale_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let records =
            self.reconciler
                .store()
                .list_stale(cutoff, scope.owner_id.as_deref(), scope.limit)?;

        let mut report = SyncReport::default();
        let mut provider_calls = 0usize;

        for record in records {
            report.checked += 1;
            let Some(external_id) = record.external_id.clone() else {
                report.skipped += 1;
                report.items.push(item(
                    &record,
                    SyncAction::Skipped,
                    Some("No provider job id recorded".to_string()),
                ));
                continue;
            };

            if provider_calls > 0 {
                time::sleep(self.config.item_delay).await;
            }
            provider_calls += 1;

            let status = match self.provider.get_status(&external_id).await {
                Ok(status) => status,
                Err(err) => {
                    warn!(job_id = %record.id, external_id = %external_id, "Sync status check failed: {err}");
                    report.errors += 1;
                    report
                        .items
                        .push(item(&record, SyncAction::Error, Some(err.to_string())));
                    continue;
                }
            };

            let observed = status.status;
            let job = record.job_ref();
            match self
                .reconciler
                .apply(&job, status, Convergence::ManualSync)
                .await
            {
                Ok(ReconcileOutcome::Applied(updated)) => {
                    self.scheduler.stop_polling(&external_id).await;
                    report.updated += 1;
                    report.items.push(item(
                        &updated,
                        SyncAction::Updated,
                        updated.error_message.clone(),
                    ));
                }
                Ok(_) => {
                    let mut message = None;
                    if scope.resume_polling
                        && !observed.is_terminal()
                        && !self.scheduler.is_polling(&external_id).await
                        && self.scheduler.start_polling(&external_id, job.clone()).await
                    {
                        report.resumed += 1;
                        message = Some("Poll loop resumed".to_string());
                    }
                    let current = self.reconciler.store().get(&job)?.unwrap_or(record);
                    report.unchanged += 1;
                    report
                        .items
                        .push(item(&current, SyncAction::Unchanged, message));
                }
                Err(err) => {
                    warn!(job_id = %record.id, "Sync failed applying status: {err:#}");
                    report.errors += 1;
                    report
                        .items
                        .push(item(&record, SyncAction::Error, Some(format!("{err:#}"))));
                }
            }
        }

        info!(
            owner_id = scope.owner_id.as_deref().unwrap_or("*"),
            checked = report.checked,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            errors = report.errors,
            resumed = report.resumed,
            "Sync sweep finished"
        );
        Ok(report)
    }
}

fn item(record: &JobRecord, action: SyncAction, message: Option<String>) -> SyncItemReport {
    SyncItemReport {
        job_id: record.id.clone(),
        external_id: record.external_id.clone(),
        action,
        status: record.status,
        message,
    }
}

/// Periodic all-owner sweep. The first tick fires immediately, which picks
/// up jobs orphaned by the previous process.
pub fn spawn_sync_worker(sync: Arc<ManualSync>, shutdown: CancellationToken) {
    let period = sync.config.interval;
    if period.is_zero() {
        info!("Periodic sync disabled");
        return;
    }

    tokio::spawn(async move {
        let scope = SyncScope {
            owner_id: None,
            stale_after: sync.config.stale_after,
            limit: sync.config.batch_limit,
            resume_polling: true,
        };
        let mut interval = time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(err) = sync.sweep(&scope).await {
                warn!("Sync worker error: {err:#}");
            }
        }
    });
}
