//! Client for the external AI provider (Replicate) and normalization of its
//! prediction payloads into the internal five-state vocabulary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::models::JobState;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("unknown provider status `{0}`")]
    UnknownStatus(String),
}

/// The provider's native status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl ProviderStatus {
    pub fn parse(value: &str) -> Result<Self, ProviderError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "starting" | "queued" => Ok(Self::Starting),
            "processing" | "running" => Ok(Self::Processing),
            "succeeded" | "successful" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" | "aborted" => Ok(Self::Canceled),
            other => Err(ProviderError::UnknownStatus(other.to_string())),
        }
    }

    pub fn to_job_state(self) -> JobState {
        match self {
            Self::Starting => JobState::Queued,
            Self::Processing => JobState::Running,
            Self::Succeeded => JobState::Completed,
            Self::Failed => JobState::Failed,
            Self::Canceled => JobState::Cancelled,
        }
    }
}

/// Output shapes the provider returns. Scalars (a score, a flag) land in
/// `Other` and carry no artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ProviderOutput {
    Url(String),
    List(Vec<Value>),
    Structured(Map<String, Value>),
    Other(Value),
}

/// Keys checked, in order, when the output is an object.
const STRUCTURED_URL_KEYS: [&str; 7] = [
    "images", "urls", "output", "files", "video", "image", "weights",
];

impl ProviderOutput {
    pub fn into_urls(self) -> Vec<String> {
        match self {
            Self::Url(url) => vec![url].into_iter().filter(|u| is_url(u)).collect(),
            Self::List(items) => items.iter().filter_map(url_from_value).collect(),
            Self::Structured(map) => {
                for key in STRUCTURED_URL_KEYS {
                    if let Some(value) = map.get(key) {
                        let urls = urls_from_value(value);
                        if !urls.is_empty() {
                            return urls;
                        }
                    }
                }
                map.values().flat_map(urls_from_value).collect()
            }
            Self::Other(_) => Vec::new(),
        }
    }
}

fn is_url(value: &str) -> bool {
    value.starts_with("https://") || value.starts_with("http://")
}

fn url_from_value(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| is_url(s))
        .map(|s| s.to_string())
}

fn urls_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::String(_) => url_from_value(value).into_iter().collect(),
        Value::Array(items) => items.iter().filter_map(url_from_value).collect(),
        _ => Vec::new(),
    }
}

/// A normalized status observation, identical for the poll, webhook and
/// manual sync paths.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: JobState,
    pub outputs: Vec<String>,
    pub error: Option<String>,
    pub progress: Option<f64>,
}

impl StatusReport {
    pub fn new(status: JobState) -> Self {
        Self {
            status,
            outputs: Vec::new(),
            error: None,
            progress: None,
        }
    }
}

/// Prediction payload as returned by `GET /predictions/{id}` and as pushed
/// to the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<ProviderOutput>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub logs: Option<String>,
}

impl Prediction {
    pub fn into_report(self) -> Result<StatusReport, ProviderError> {
        let status = ProviderStatus::parse(&self.status)?.to_job_state();
        let outputs = match (status, self.output) {
            (JobState::Completed, Some(output)) => output.into_urls(),
            _ => Vec::new(),
        };
        let error = self.error.and_then(|value| match value {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        });
        let progress = self.logs.as_deref().and_then(parse_progress);
        Ok(StatusReport {
            status,
            outputs,
            error,
            progress,
        })
    }
}

/// Extract the last `NN%` marker from provider log output.
pub fn parse_progress(logs: &str) -> Option<f64> {
    let bytes = logs.as_bytes();
    let mut idx = bytes.len();
    while idx > 0 {
        idx -= 1;
        if bytes[idx] != b'%' {
            continue;
        }
        let end = idx;
        let mut start = end;
        while start > 0 && bytes[start - 1].is_ascii_digit() {
            start -= 1;
        }
        if start == end {
            continue;
        }
        if let Ok(value) = logs[start..end].parse::<f64>() {
            if value <= 100.0 {
                return Some(value);
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct CreateJobParams {
    pub version: String,
    pub input: Value,
    pub webhook_url: Option<String>,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn create_job(&self, params: &CreateJobParams) -> Result<String, ProviderError>;

    async fn get_status(&self, external_id: &str) -> Result<StatusReport, ProviderError>;

    /// Returns `false` when the provider refused because the job is already
    /// finished or unknown.
    async fn cancel_job(&self, external_id: &str) -> Result<bool, ProviderError>;

    /// Download an ephemeral, provider-hosted output.
    async fn download(&self, url: &str) -> Result<Vec<u8>, ProviderError>;
}

pub struct ReplicateClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl ReplicateClient {
    pub fn new(base_url: String, api_token: String) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_prediction(response: reqwest::Response) -> Result<Prediction, ProviderError> {
        let response = Self::ensure_success(response).await?;
        let value = response.json::<Value>().await?;
        serde_json::from_value::<Prediction>(value).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ProviderClient for ReplicateClient {
    async fn create_job(&self, params: &CreateJobParams) -> Result<String, ProviderError> {
        let mut body = json!({
            "version": params.version,
            "input": params.input,
        });
        if let Some(webhook) = &params.webhook_url {
            body["webhook"] = json!(webhook);
            body["webhook_events_filter"] = json!(["start", "completed"]);
        }

        let response = self
            .client
            .post(format!("{}/predictions", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;

        Ok(Self::parse_prediction(response).await?.id)
    }

    async fn get_status(&self, external_id: &str) -> Result<StatusReport, ProviderError> {
        let response = self
            .client
            .get(format!("{}/predictions/{}", self.base_url, external_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        Self::parse_prediction(response).await?.into_report()
    }

    async fn cancel_job(&self, external_id: &str) -> Result<bool, ProviderError> {
        let response = self
            .client
            .post(format!("{}/predictions/{}/cancel", self.base_url, external_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        match response.status().as_u16() {
            404 | 409 | 422 => Ok(false),
            _ => {
                Self::ensure_success(response).await?;
                Ok(true)
            }
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        let response = self.client.get(url).send().await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_statuses_map_onto_job_states() {
        let cases = [
            ("starting", JobState::Queued),
            ("processing", JobState::Running),
            ("succeeded", JobState::Completed),
            ("failed", JobState::Failed),
            ("canceled", JobState::Cancelled),
        ];
        for (native, expected) in cases {
            assert_eq!(
                ProviderStatus::parse(native).unwrap().to_job_state(),
                expected
            );
        }
        assert!(matches!(
            ProviderStatus::parse("exploded"),
            Err(ProviderError::UnknownStatus(_))
        ));
    }

    #[test]
    fn single_url_output_becomes_one_item_list() {
        let output: ProviderOutput = serde_json::from_value(json!("https://tmp/a.png")).unwrap();
        assert_eq!(output.into_urls(), vec!["https://tmp/a.png".to_string()]);
    }

    #[test]
    fn array_output_skips_nulls_and_non_urls() {
        let output: ProviderOutput = serde_json::from_value(json!([
            "https://tmp/a.png",
            null,
            "not a url",
            "https://tmp/b.png"
        ]))
        .unwrap();
        assert_eq!(
            output.into_urls(),
            vec!["https://tmp/a.png".to_string(), "https://tmp/b.png".to_string()]
        );
    }

    #[test]
    fn structured_output_prefers_known_list_keys() {
        let output: ProviderOutput = serde_json::from_value(json!({
            "seed": 42,
            "images": ["https://tmp/x.webp", "https://tmp/y.webp"]
        }))
        .unwrap();
        assert_eq!(output.into_urls().len(), 2);

        let weights: ProviderOutput = serde_json::from_value(json!({
            "version": "abc",
            "weights": "https://tmp/lora.tar"
        }))
        .unwrap();
        assert_eq!(weights.into_urls(), vec!["https://tmp/lora.tar".to_string()]);
    }

    #[test]
    fn scalar_output_decodes_without_artifacts() {
        for output in [json!(0.93), json!(true)] {
            let done: Prediction = serde_json::from_value(json!({
                "id": "ext-score",
                "status": "succeeded",
                "output": output
            }))
            .unwrap();
            let report = done.into_report().unwrap();
            assert_eq!(report.status, JobState::Completed);
            assert!(report.outputs.is_empty());
        }
    }

    #[test]
    fn outputs_are_only_collected_for_succeeded_predictions() {
        let running: Prediction = serde_json::from_value(json!({
            "id": "ext-1",
            "status": "processing",
            "output": ["https://tmp/partial.png"],
            "logs": "step 1\n 37%|###"
        }))
        .unwrap();
        let report = running.into_report().unwrap();
        assert_eq!(report.status, JobState::Running);
        assert!(report.outputs.is_empty());
        assert_eq!(report.progress, Some(37.0));
    }

    #[test]
    fn failed_prediction_keeps_provider_error_text() {
        let failed: Prediction = serde_json::from_value(json!({
            "id": "ext-1",
            "status": "failed",
            "error": "CUDA out of memory"
        }))
        .unwrap();
        let report = failed.into_report().unwrap();
        assert_eq!(report.status, JobState::Failed);
        assert_eq!(report.error.as_deref(), Some("CUDA out of memory"));
    }

    #[test]
    fn progress_uses_last_marker() {
        assert_eq!(parse_progress("10%|#\n55%|#####"), Some(55.0));
        assert_eq!(parse_progress("no markers here"), None);
        assert_eq!(parse_progress("%"), None);
    }
}
