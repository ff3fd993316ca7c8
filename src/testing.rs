//! Fakes shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    artifact_store::ObjectStore,
    finalizer::{ArtifactFinalizer, FinalizeConfig},
    models::JobState,
    provider::{CreateJobParams, ProviderClient, ProviderError, StatusReport},
    reconcile::Reconciler,
    store::JobStore,
};

#[derive(Debug, Clone)]
pub enum Scripted {
    Report(StatusReport),
    Transient,
}

pub fn running() -> Scripted {
    Scripted::Report(StatusReport::new(JobState::Running))
}

pub fn succeeded(urls: &[&str]) -> Scripted {
    Scripted::Report(StatusReport {
        status: JobState::Completed,
        outputs: urls.iter().map(|u| u.to_string()).collect(),
        error: None,
        progress: None,
    })
}

/// Provider whose status answers are scripted per external id. The last
/// scripted answer repeats once the script runs out.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    status_delay: Mutex<Option<Duration>>,
    download_bytes: Vec<u8>,
    pub status_calls: AtomicUsize,
    pub downloads: AtomicUsize,
    pub cancels: AtomicUsize,
    pub created: AtomicUsize,
    reject_create: bool,
    refuse_cancel: bool,
}

impl ScriptedProvider {
    pub fn with_download(bytes: Vec<u8>) -> Self {
        Self {
            download_bytes: bytes,
            ..Default::default()
        }
    }

    pub fn rejecting_create() -> Self {
        Self {
            reject_create: true,
            ..Default::default()
        }
    }

    pub fn refusing_cancel() -> Self {
        Self {
            refuse_cancel: true,
            ..Default::default()
        }
    }

    pub fn script(&self, external_id: &str, answers: Vec<Scripted>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(external_id.to_string(), answers.into());
    }

    /// Every status call sleeps this long before answering.
    pub fn delay_status(&self, delay: Duration) {
        *self.status_delay.lock().unwrap() = Some(delay);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn next_answer(&self, external_id: &str) -> Scripted {
        let mut scripts = self.scripts.lock().unwrap();
        let Some(queue) = scripts.get_mut(external_id) else {
            return Scripted::Transient;
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(Scripted::Transient)
        } else {
            queue.front().cloned().unwrap_or(Scripted::Transient)
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn create_job(&self, _: &CreateJobParams) -> Result<String, ProviderError> {
        if self.reject_create {
            return Err(ProviderError::Api {
                status: 422,
                body: "invalid version".to_string(),
            });
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ext-created-{n}"))
    }

    async fn get_status(&self, external_id: &str) -> Result<StatusReport, ProviderError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.status_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.next_answer(external_id) {
            Scripted::Report(report) => Ok(report),
            Scripted::Transient => Err(ProviderError::Api {
                status: 503,
                body: "upstream unavailable".to_string(),
            }),
        }
    }

    async fn cancel_job(&self, _: &str) -> Result<bool, ProviderError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(!self.refuse_cancel)
    }

    async fn download(&self, _: &str) -> Result<Vec<u8>, ProviderError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(self.download_bytes.clone())
    }
}

/// In-memory object store that can be told to fail writes.
#[derive(Default)]
pub struct MemoryObjects {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub writes: AtomicUsize,
    /// Fail the next N writes.
    pub fail_writes: AtomicUsize,
    /// Writes after this many successful ones fail.
    pub fail_after: Mutex<Option<usize>>,
}

impl MemoryObjects {
    pub fn failing(times: usize) -> Self {
        let store = Self::default();
        store.fail_writes.store(times, Ordering::SeqCst);
        store
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjects {
    async fn store(&self, key: &str, bytes: Vec<u8>, _: &str) -> Result<String> {
        let count = self.writes.fetch_add(1, Ordering::SeqCst);
        if matches!(*self.fail_after.lock().unwrap(), Some(limit) if count >= limit) {
            anyhow::bail!("bucket full");
        }
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("bucket unavailable");
        }
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(format!("https://cdn.example/{key}"))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

pub fn quick_finalize_config() -> FinalizeConfig {
    FinalizeConfig {
        backoff: Duration::from_millis(1),
        derive_thumbnails: false,
        ..Default::default()
    }
}

pub fn reconciler_with(
    provider: Arc<ScriptedProvider>,
    objects: Arc<MemoryObjects>,
) -> Reconciler {
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let finalizer = ArtifactFinalizer::new(provider, objects, quick_finalize_config());
    Reconciler::new(store, finalizer, Duration::from_secs(600))
}
