//! Per-job poll loops against the provider status endpoint.
//!
//! The scheduler owns a map of active loops keyed by external job id. Each
//! entry carries a generation number; a loop only acts while its generation
//! is still the registered one, so a stop or a replacement that races with an
//! in-flight status request discards that request's result.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    models::{JobRef, JobState, PollJobStatus},
    provider::ProviderClient,
    reconcile::{Convergence, Reconciler},
};

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between attempts while the provider answers normally.
    pub interval: Duration,
    pub max_attempts: u32,
    /// Growth of the delay per consecutive status-check error.
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 120,
            backoff_factor: 1.5,
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Delay before the next attempt after `consecutive_errors` failed status
/// checks in a row. Non-decreasing in `consecutive_errors` and never above
/// `max(max_backoff, interval)`.
pub fn backoff_delay(config: &PollConfig, consecutive_errors: u32) -> Duration {
    if consecutive_errors == 0 {
        return config.interval;
    }
    let cap = config.max_backoff.max(config.interval);
    let factor = config
        .backoff_factor
        .max(1.0)
        .powi(consecutive_errors.min(64) as i32);
    let millis = (config.interval.as_millis() as f64 * factor).min(cap.as_millis() as f64);
    Duration::from_millis(millis as u64).clamp(config.interval, cap)
}

struct PollEntry {
    generation: u64,
    job: JobRef,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    attempts: u32,
    consecutive_errors: u32,
    last_status: Option<JobState>,
    started_at: DateTime<Utc>,
}

pub struct PollScheduler {
    provider: Arc<dyn ProviderClient>,
    reconciler: Arc<Reconciler>,
    config: PollConfig,
    jobs: Mutex<HashMap<String, PollEntry>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl PollScheduler {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        reconciler: Arc<Reconciler>,
        config: PollConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            reconciler,
            config,
            jobs: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start polling `external_id`, replacing any loop already registered for
    /// it. Returns `false` once the scheduler has been shut down.
    pub async fn start_polling(self: &Arc<Self>, external_id: &str, job: JobRef) -> bool {
        if self.shutdown.is_cancelled() {
            warn!(external_id = %external_id, "Scheduler is shut down; not starting poll loop");
            return false;
        }

        let mut jobs = self.jobs.lock().await;
        if let Some(previous) = jobs.remove(external_id) {
            info!(
                external_id = %external_id,
                job_id = %previous.job.job_id,
                "Replacing existing poll loop"
            );
            previous.cancel.cancel();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.shutdown.child_token();
        // The loop cannot observe the map until this lock is released, so the
        // entry is always in place before its first attempt.
        let handle = tokio::spawn(self.clone().run(
            external_id.to_string(),
            job.clone(),
            generation,
            cancel.clone(),
        ));

        info!(
            external_id = %external_id,
            job_id = %job.job_id,
            interval_ms = self.config.interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "Poll loop started"
        );

        jobs.insert(
            external_id.to_string(),
            PollEntry {
                generation,
                job,
                cancel,
                handle: Some(handle),
                attempts: 0,
                consecutive_errors: 0,
                last_status: None,
                started_at: Utc::now(),
            },
        );
        true
    }

    /// Stop the loop for `external_id`. An in-flight status request is left
    /// to finish and its result is dropped.
    pub async fn stop_polling(&self, external_id: &str) -> bool {
        let removed = self.jobs.lock().await.remove(external_id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!(external_id = %external_id, job_id = %entry.job.job_id, "Poll loop stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_polling(&self, external_id: &str) -> bool {
        self.jobs.lock().await.contains_key(external_id)
    }

    pub async fn polling_status(&self) -> Vec<PollJobStatus> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<PollJobStatus> = jobs
            .iter()
            .map(|(external_id, entry)| PollJobStatus {
                external_id: external_id.clone(),
                job_id: entry.job.job_id.clone(),
                attempts: entry.attempts,
                max_attempts: self.config.max_attempts,
                consecutive_errors: entry.consecutive_errors,
                last_status: entry.last_status,
                started_at: entry.started_at,
            })
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    /// Cancel every loop and wait briefly for each to exit.
    pub async fn shutdown(&self) {
        info!("Shutting down poll scheduler");
        self.shutdown.cancel();

        let drained: Vec<(String, PollEntry)> = self.jobs.lock().await.drain().collect();
        for (external_id, mut entry) in drained {
            entry.cancel.cancel();
            if let Some(handle) = entry.handle.take() {
                if tokio::time::timeout(Duration::from_secs(5), handle)
                    .await
                    .is_err()
                {
                    warn!(external_id = %external_id, "Poll loop did not exit in time");
                }
            }
        }
        info!("Poll scheduler shut down");
    }

    async fn run(
        self: Arc<Self>,
        external_id: String,
        job: JobRef,
        generation: u64,
        cancel: CancellationToken,
    ) {
        self.poll_until_settled(&external_id, &job, generation, &cancel)
            .await;
        self.deregister(&external_id, generation).await;
    }

    async fn poll_until_settled(
        &self,
        external_id: &str,
        job: &JobRef,
        generation: u64,
        cancel: &CancellationToken,
    ) {
        let mut attempts = 0u32;
        let mut consecutive_errors = 0u32;
        let mut delay = self.config.interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if cancel.is_cancelled() || !self.is_current(external_id, generation).await {
                return;
            }

            match self.reconciler.is_settled(job) {
                Ok(true) => {
                    debug!(external_id = %external_id, job_id = %job.job_id, "Job already settled; ending poll loop");
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(external_id = %external_id, "Failed reading job record before poll: {err:#}");
                }
            }

            attempts += 1;
            let result = self.provider.get_status(external_id).await;

            // Stopped or replaced while the request was in flight.
            if cancel.is_cancelled() || !self.is_current(external_id, generation).await {
                debug!(external_id = %external_id, attempt = attempts, "Discarding status for stopped poll loop");
                return;
            }

            let mut observed = None;
            match result {
                Ok(report) => {
                    let status = report.status;
                    match self.reconciler.apply(job, report, Convergence::Poll).await {
                        Ok(_) => {
                            consecutive_errors = 0;
                            observed = Some(status);
                        }
                        Err(err) => {
                            consecutive_errors += 1;
                            warn!(
                                external_id = %external_id,
                                attempt = attempts,
                                "Failed applying polled status: {err:#}"
                            );
                        }
                    }
                }
                Err(err) => {
                    consecutive_errors += 1;
                    warn!(
                        external_id = %external_id,
                        attempt = attempts,
                        consecutive_errors,
                        "Status check failed: {err}"
                    );
                }
            }

            self.record_attempt(external_id, generation, attempts, consecutive_errors, observed)
                .await;

            if observed.is_some_and(|s| s.is_terminal()) {
                info!(
                    external_id = %external_id,
                    job_id = %job.job_id,
                    attempts,
                    "Poll loop finished"
                );
                return;
            }

            if attempts >= self.config.max_attempts {
                let message = format!("Polling timeout after {attempts} attempts");
                warn!(external_id = %external_id, job_id = %job.job_id, "{message}");
                if let Err(err) = self.reconciler.fail(job, message, Convergence::Poll) {
                    error!(external_id = %external_id, "Failed recording polling timeout: {err:#}");
                }
                return;
            }

            delay = backoff_delay(&self.config, consecutive_errors);
            debug!(
                external_id = %external_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Next poll scheduled"
            );
        }
    }

    async fn is_current(&self, external_id: &str, generation: u64) -> bool {
        self.jobs
            .lock()
            .await
            .get(external_id)
            .is_some_and(|entry| entry.generation == generation)
    }

    async fn record_attempt(
        &self,
        external_id: &str,
        generation: u64,
        attempts: u32,
        consecutive_errors: u32,
        observed: Option<JobState>,
    ) {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(external_id) {
            if entry.generation == generation {
                entry.attempts = attempts;
                entry.consecutive_errors = consecutive_errors;
                if observed.is_some() {
                    entry.last_status = observed;
                }
            }
        }
    }

    async fn deregister(&self, external_id: &str, generation: u64) {
        let mut jobs = self.jobs.lock().await;
        if jobs
            .get(external_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            jobs.remove(external_id);
        }
    }
}
