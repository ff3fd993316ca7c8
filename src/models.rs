use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Generation,
    Upscale,
    Training,
    Video,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Upscale => "upscale",
            Self::Training => "training",
            Self::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "generation" => Some(Self::Generation),
            "upscale" => Some(Self::Upscale),
            "training" => Some(Self::Training),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

/// Where a completed job's outputs live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    Durable,
    TemporaryFallback,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::TemporaryFallback => "temporary-fallback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "durable" => Some(Self::Durable),
            "temporary-fallback" => Some(Self::TemporaryFallback),
            _ => None,
        }
    }
}

/// Identifies a Job Record together with the user who owns it. Every store
/// read and write is scoped by both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub job_id: String,
    pub owner_id: String,
}

impl JobRef {
    pub fn new(job_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            owner_id: owner_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub kind: JobKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobOutputs {
    pub permanent_urls: Vec<String>,
    pub thumbnail_urls: Vec<String>,
    pub storage_keys: Vec<String>,
    pub mode: StorageMode,
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TerminalUpdate {
    Completed(JobOutputs),
    Failed(String),
    Cancelled(Option<String>),
}

impl TerminalUpdate {
    pub fn state(&self) -> JobState {
        match self {
            Self::Completed(_) => JobState::Completed,
            Self::Failed(_) => JobState::Failed,
            Self::Cancelled(_) => JobState::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Updated(JobRecord),
    Noop(JobRecord),
}

impl ApplyOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            Self::Updated(record) | Self::Noop(record) => record,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub owner_id: String,
    pub kind: JobKind,
    pub external_id: Option<String>,
    pub status: JobState,
    pub progress: Option<f64>,
    pub output_urls: Vec<String>,
    pub thumbnail_urls: Vec<String>,
    pub storage_keys: Vec<String>,
    pub storage_mode: Option<StorageMode>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn job_ref(&self) -> JobRef {
        JobRef::new(self.id.clone(), self.owner_id.clone())
    }

    pub fn to_response(&self) -> JobResponse {
        JobResponse {
            id: self.id.clone(),
            kind: self.kind,
            external_id: self.external_id.clone(),
            status: self.status,
            progress: self.progress,
            output_urls: self.output_urls.clone(),
            thumbnail_urls: self.thumbnail_urls.clone(),
            storage_mode: self.storage_mode,
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: String,
    pub kind: JobKind,
    pub external_id: Option<String>,
    pub status: JobState,
    pub progress: Option<f64>,
    pub output_urls: Vec<String>,
    pub thumbnail_urls: Vec<String>,
    pub storage_mode: Option<StorageMode>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub kind: JobKind,
    pub version: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPollingRequest {
    pub external_id: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub older_than_seconds: Option<u64>,
    pub limit: Option<usize>,
    pub resume_polling: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollJobStatus {
    pub external_id: String,
    pub job_id: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub consecutive_errors: u32,
    pub last_status: Option<JobState>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingStatusResponse {
    pub active: usize,
    pub jobs: Vec<PollJobStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Updated,
    Unchanged,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItemReport {
    pub job_id: String,
    pub external_id: Option<String>,
    pub action: SyncAction,
    pub status: JobState,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub checked: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub errors: usize,
    pub resumed: usize,
    pub items: Vec<SyncItemReport>,
}
