//! The convergence funnel shared by the poll loop, the webhook endpoint and
//! the manual sync. All three hand a normalized [`StatusReport`] to
//! [`Reconciler::apply`]; only the first terminal observation for a job runs
//! finalization and writes the record.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    finalizer::ArtifactFinalizer,
    models::{ApplyOutcome, JobRecord, JobRef, JobState, StorageMode, TerminalUpdate},
    provider::StatusReport,
    store::JobStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    Poll,
    Webhook,
    ManualSync,
    Api,
}

impl Convergence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Webhook => "webhook",
            Self::ManualSync => "manual_sync",
            Self::Api => "api",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// A non-terminal observation; the record may have moved to RUNNING.
    InProgress,
    /// This call performed the terminal transition.
    Applied(JobRecord),
    /// Already terminal, or another path holds the finalization claim.
    Noop,
}

impl ReconcileOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

pub struct Reconciler {
    store: Arc<JobStore>,
    finalizer: ArtifactFinalizer,
    finalize_lease: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<JobStore>, finalizer: ArtifactFinalizer, finalize_lease: Duration) -> Self {
        Self {
            store,
            finalizer,
            finalize_lease,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub async fn apply(
        &self,
        job: &JobRef,
        report: StatusReport,
        path: Convergence,
    ) -> Result<ReconcileOutcome> {
        let Some(current) = self.store.get(job)? else {
            anyhow::bail!("Unknown job {} for owner {}", job.job_id, job.owner_id);
        };

        if current.status.is_terminal() {
            debug!(
                job_id = %job.job_id,
                path = path.as_str(),
                observed = report.status.as_str(),
                current = current.status.as_str(),
                "Ignoring observation for settled job"
            );
            return Ok(ReconcileOutcome::Noop);
        }

        match report.status {
            JobState::Queued => Ok(ReconcileOutcome::InProgress),
            JobState::Running => {
                if self.store.mark_running(job, report.progress)? && current.status == JobState::Queued
                {
                    info!(job_id = %job.job_id, path = path.as_str(), "Job is running");
                }
                Ok(ReconcileOutcome::InProgress)
            }
            JobState::Completed => {
                if !self.store.claim_finalization(job, self.finalize_lease)? {
                    info!(
                        job_id = %job.job_id,
                        path = path.as_str(),
                        "Finalization already claimed by another path"
                    );
                    return Ok(ReconcileOutcome::Noop);
                }
                let outputs = self.finalizer.finalize(&report.outputs, job).await;
                let stored = outputs.storage_keys.clone();
                let outcome = self.commit(job, TerminalUpdate::Completed(outputs), path)?;
                if matches!(outcome, ReconcileOutcome::Noop) && !stored.is_empty() {
                    warn!(
                        job_id = %job.job_id,
                        path = path.as_str(),
                        "Job settled elsewhere during finalization; removing stored artifacts"
                    );
                    self.finalizer.discard(&stored).await;
                }
                Ok(outcome)
            }
            JobState::Failed => {
                let message = report
                    .error
                    .unwrap_or_else(|| "Provider reported failure without an error message".to_string());
                self.commit(job, TerminalUpdate::Failed(message), path)
            }
            JobState::Cancelled => self.commit(job, TerminalUpdate::Cancelled(report.error), path),
        }
    }

    /// Terminal failure that did not come from the provider, e.g. an
    /// exhausted poll budget. Like [`Reconciler::cancel`], it yields to a
    /// finalization in progress.
    pub fn fail(&self, job: &JobRef, message: String, path: Convergence) -> Result<ReconcileOutcome> {
        let applied =
            self.store
                .apply_local_terminal(job, TerminalUpdate::Failed(message), self.finalize_lease)?;
        Ok(self.settle(applied, path))
    }

    pub fn cancel(
        &self,
        job: &JobRef,
        message: Option<String>,
        path: Convergence,
    ) -> Result<ReconcileOutcome> {
        let applied = self.store.apply_local_terminal(
            job,
            TerminalUpdate::Cancelled(message),
            self.finalize_lease,
        )?;
        Ok(self.settle(applied, path))
    }

    /// `true` when the record is terminal or no longer exists.
    pub fn is_settled(&self, job: &JobRef) -> Result<bool> {
        Ok(self
            .store
            .get(job)?
            .map(|record| record.status.is_terminal())
            .unwrap_or(true))
    }

    fn commit(
        &self,
        job: &JobRef,
        update: TerminalUpdate,
        path: Convergence,
    ) -> Result<ReconcileOutcome> {
        let applied = self.store.apply_terminal_status(job, update)?;
        Ok(self.settle(applied, path))
    }

    fn settle(&self, applied: ApplyOutcome, path: Convergence) -> ReconcileOutcome {
        match applied {
            ApplyOutcome::Updated(record) => {
                info!(
                    job_id = %record.id,
                    external_id = record.external_id.as_deref().unwrap_or("-"),
                    path = path.as_str(),
                    status = record.status.as_str(),
                    storage_mode = record.storage_mode.map(|m| m.as_str()).unwrap_or("-"),
                    "Job reached terminal state"
                );
                if record.storage_mode == Some(StorageMode::TemporaryFallback) {
                    info!(
                        job_id = %record.id,
                        "Job completed with temporary provider URLs that will expire"
                    );
                }
                ReconcileOutcome::Applied(record)
            }
            ApplyOutcome::Noop(record) => {
                debug!(
                    job_id = %record.id,
                    path = path.as_str(),
                    status = record.status.as_str(),
                    "Terminal transition not applied"
                );
                ReconcileOutcome::Noop
            }
        }
    }
}
