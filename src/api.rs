use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tokio::fs;
use tracing::{error, info, warn};

use crate::{
    artifact_store::{content_type_for_extension, extension_from_url, object_path},
    auth::{authorize, verify_bearer},
    error::ApiError,
    models::{
        CreateJobRequest, JobRecord, JobRef, JobResponse, NewJob, PollingStatusResponse,
        StartPollingRequest, SyncReport, SyncRequest,
    },
    provider::{CreateJobParams, Prediction},
    reconcile::Convergence,
    AppState,
};

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

fn load_job(state: &AppState, job: &JobRef) -> Result<JobRecord, ApiError> {
    state.store.get(job)?.ok_or_else(ApiError::job_not_found)
}

pub async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let owner_id = authorize(&headers, &state.config.api_key)?;

    if payload.version.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Request must include a model version.".to_string(),
        ));
    }

    let record = state.store.insert(&NewJob {
        owner_id,
        kind: payload.kind,
    })?;
    let job = record.job_ref();

    let params = CreateJobParams {
        version: payload.version,
        input: payload.input,
        webhook_url: state.config.webhook_url.clone(),
    };
    let external_id = match state.provider.create_job(&params).await {
        Ok(id) => id,
        Err(err) => {
            warn!(job_id = %job.job_id, "Provider rejected job: {err}");
            state
                .reconciler
                .fail(&job, format!("Provider rejected job: {err}"), Convergence::Api)?;
            return Err(err.into());
        }
    };

    state.store.attach_external_id(&job, &external_id)?;
    info!(
        job_id = %job.job_id,
        external_id = %external_id,
        kind = record.kind.as_str(),
        "Job submitted"
    );

    if state.config.auto_poll {
        state.scheduler.start_polling(&external_id, job.clone()).await;
    }

    let record = load_job(&state, &job)?;
    Ok((StatusCode::ACCEPTED, Json(record.to_response())))
}

pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let owner_id = authorize(&headers, &state.config.api_key)?;
    let record = load_job(&state, &JobRef::new(job_id, owner_id))?;
    Ok(Json(record.to_response()))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let owner_id = authorize(&headers, &state.config.api_key)?;
    let job = JobRef::new(job_id, owner_id);
    let record = load_job(&state, &job)?;

    if record.status.is_terminal() {
        return Ok(Json(record.to_response()));
    }

    if let Some(external_id) = &record.external_id {
        if !state.provider.cancel_job(external_id).await? {
            return Err(ApiError::Conflict {
                code: "CANCEL_REFUSED",
                message: "Provider refused to cancel; the job may already be finishing."
                    .to_string(),
            });
        }
        state.scheduler.stop_polling(external_id).await;
    }

    state
        .reconciler
        .cancel(&job, Some("Cancelled by user".to_string()), Convergence::Api)?;
    let record = load_job(&state, &job)?;
    if !record.status.is_terminal() {
        return Err(ApiError::Conflict {
            code: "JOB_FINALIZING",
            message: "Job outputs are being stored; it can no longer be cancelled.".to_string(),
        });
    }
    Ok(Json(record.to_response()))
}

pub async fn start_polling(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<StartPollingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = authorize(&headers, &state.config.api_key)?;
    let job = JobRef::new(payload.job_id, owner_id);
    let record = load_job(&state, &job)?;

    if record.status.is_terminal() {
        return Err(ApiError::Conflict {
            code: "JOB_ALREADY_TERMINAL",
            message: format!("Job is already {}.", record.status.as_str()),
        });
    }
    if record.external_id.as_deref() != Some(payload.external_id.as_str()) {
        if let Some(other) = state.store.find_by_external_id(&payload.external_id)? {
            if other.id != record.id {
                return Err(ApiError::Conflict {
                    code: "EXTERNAL_ID_IN_USE",
                    message: "External id already belongs to another job.".to_string(),
                });
            }
        }
        state.store.attach_external_id(&job, &payload.external_id)?;
    }

    if !state
        .scheduler
        .start_polling(&payload.external_id, job.clone())
        .await
    {
        return Err(ApiError::Conflict {
            code: "SCHEDULER_STOPPED",
            message: "Polling scheduler is shutting down.".to_string(),
        });
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "polling": true,
            "externalId": payload.external_id,
            "jobId": job.job_id
        })),
    ))
}

pub async fn stop_polling(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(external_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = authorize(&headers, &state.config.api_key)?;
    let owned = state
        .store
        .find_by_external_id(&external_id)?
        .is_some_and(|record| record.owner_id == owner_id);
    if !owned {
        return Err(ApiError::job_not_found());
    }

    let stopped = state.scheduler.stop_polling(&external_id).await;
    Ok(Json(json!({ "stopped": stopped, "externalId": external_id })))
}

pub async fn polling_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PollingStatusResponse>, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;
    let jobs = state.scheduler.polling_status().await;
    Ok(Json(PollingStatusResponse {
        active: jobs.len(),
        jobs,
    }))
}

pub async fn manual_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SyncReport>, ApiError> {
    let owner_id = authorize(&headers, &state.config.api_key)?;
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        serde_json::from_slice::<SyncRequest>(&body)
            .map_err(|err| ApiError::BadRequest(format!("Invalid sync request: {err}")))?
    };

    let scope = state.sync.scope(Some(owner_id), &request);
    Ok(Json(state.sync.sweep(&scope).await?))
}

/// Always acknowledges; the provider retries deliveries that are not 2xx,
/// and reconciliation is idempotent anyway.
pub async fn receive_webhook(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let prediction = match serde_json::from_slice::<Prediction>(&body) {
        Ok(prediction) => prediction,
        Err(err) => {
            warn!("Ignoring malformed webhook payload: {err}");
            return Json(json!({ "received": false }));
        }
    };

    let webhooks = state.webhooks.clone();
    tokio::spawn(async move {
        let external_id = prediction.id.clone();
        if let Err(err) = webhooks.process(prediction).await {
            error!(external_id = %external_id, "Webhook processing failed: {err:#}");
        }
    });

    Json(json!({ "received": true }))
}

pub async fn download_artifact(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let path = object_path(state.objects.root(), &key)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound {
                code: "ARTIFACT_NOT_FOUND",
                message: "Artifact not found.".to_string(),
            });
        }
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("Failed to read artifact {key}"))
                .into());
        }
    };

    let content_type = content_type_for_extension(&extension_from_url(&key));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "public, max-age=31536000, immutable")
        .body(Body::from(bytes))
        .map_err(|err| ApiError::Internal(err.into()))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{http::Request, Router};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        artifact_store::LocalObjectStore,
        config::Config,
        models::{JobKind, JobState},
        router,
        store::JobStore,
        testing::{quick_finalize_config, running, succeeded, ScriptedProvider},
    };

    const KEY: &str = "test-key";

    struct Harness {
        app: Router,
        state: AppState,
        provider: Arc<ScriptedProvider>,
    }

    fn harness_with(provider: ScriptedProvider) -> Harness {
        let root = std::env::temp_dir().join(format!("replicate-sync-{}", uuid::Uuid::new_v4()));
        let config = Config {
            api_key: KEY.to_string(),
            finalize: quick_finalize_config(),
            storage_root: root.clone(),
            ..Default::default()
        };
        let provider = Arc::new(provider);
        let objects = Arc::new(LocalObjectStore::new(root, config.public_base_url.clone()));
        let state = AppState::new(
            config,
            Arc::new(JobStore::open_in_memory().unwrap()),
            provider.clone(),
            objects,
        );
        Harness {
            app: router(state.clone()),
            state,
            provider,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedProvider::with_download(b"png-bytes".to_vec()))
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {KEY}"))
            .header("x-owner-id", "user-1")
            .header(header::CONTENT_TYPE, "application/json");
        let body = body.map(|v| Body::from(v.to_string())).unwrap_or_else(Body::empty);
        builder.body(body).unwrap()
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn submit(h: &Harness) -> Value {
        let (status, body) = call(
            &h.app,
            request(
                "POST",
                "/v1/jobs",
                Some(json!({"kind": "generation", "version": "sdxl", "input": {"prompt": "me"}})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        body
    }

    #[tokio::test]
    async fn routes_require_bearer_key() {
        let h = harness();
        let req = Request::builder()
            .uri("/v1/jobs/abc")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&h.app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn submitted_job_is_queued_with_external_id_and_polled() {
        let h = harness();
        let body = submit(&h).await;

        assert_eq!(body["status"], "QUEUED");
        assert_eq!(body["kind"], "generation");
        assert_eq!(body["externalId"], "ext-created-0");
        assert!(h.state.scheduler.is_polling("ext-created-0").await);
        h.state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn provider_rejection_marks_job_failed() {
        let h = harness_with(ScriptedProvider::rejecting_create());
        let (status, body) = call(
            &h.app,
            request(
                "POST",
                "/v1/jobs",
                Some(json!({"kind": "upscale", "version": "esrgan"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "PROVIDER_ERROR");

        let stale = h
            .state
            .store
            .list_stale(Utc::now() + chrono::Duration::hours(1), Some("user-1"), 10)
            .unwrap();
        assert!(stale.is_empty());
        assert!(h.state.scheduler.polling_status().await.is_empty());
    }

    #[tokio::test]
    async fn jobs_are_scoped_to_their_owner() {
        let h = harness();
        let body = submit(&h).await;
        let id = body["id"].as_str().unwrap();

        let req = Request::builder()
            .uri(format!("/v1/jobs/{id}"))
            .header(header::AUTHORIZATION, format!("Bearer {KEY}"))
            .header("x-owner-id", "someone-else")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&h.app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "JOB_NOT_FOUND");
        h.state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_stops_polling_and_settles_record() {
        let h = harness();
        let body = submit(&h).await;
        let id = body["id"].as_str().unwrap();

        let (status, body) = call(&h.app, request("POST", &format!("/v1/jobs/{id}/cancel"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "CANCELLED");
        assert!(!h.state.scheduler.is_polling("ext-created-0").await);
        assert_eq!(h.provider.cancels.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_cancel_leaves_job_running() {
        let h = harness_with(ScriptedProvider::refusing_cancel());
        let body = submit(&h).await;
        let id = body["id"].as_str().unwrap();

        let (status, body) = call(&h.app, request("POST", &format!("/v1/jobs/{id}/cancel"), None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CANCEL_REFUSED");
        assert!(h.state.scheduler.is_polling("ext-created-0").await);
        h.state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn webhook_is_acknowledged_and_finalizes_job() {
        let h = harness();
        let body = submit(&h).await;
        let id = body["id"].as_str().unwrap().to_string();

        let req = Request::builder()
            .method("POST")
            .uri("/v1/webhooks/replicate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "id": "ext-created-0",
                    "status": "succeeded",
                    "output": ["https://replicate.delivery/out.png"]
                })
                .to_string(),
            ))
            .unwrap();
        let (status, ack) = call(&h.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["received"], true);

        let job = JobRef::new(id, "user-1");
        let mut record = None;
        for _ in 0..200 {
            let current = h.state.store.get(&job).unwrap().unwrap();
            if current.status.is_terminal() {
                record = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = record.expect("webhook never settled the job");
        assert_eq!(record.status, JobState::Completed);
        assert!(!h.state.scheduler.is_polling("ext-created-0").await);

        // The permanent URL is served by the artifact route.
        let path = record.output_urls[0]
            .strip_prefix("http://localhost:8080")
            .unwrap()
            .to_string();
        let response = h
            .app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"png-bytes");
    }

    #[tokio::test]
    async fn malformed_webhook_is_still_acknowledged() {
        let h = harness();
        let req = Request::builder()
            .method("POST")
            .uri("/v1/webhooks/replicate")
            .body(Body::from("not json"))
            .unwrap();
        let (status, ack) = call(&h.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["received"], false);
    }

    #[tokio::test]
    async fn polling_routes_start_list_and_stop() {
        let h = harness();
        let record = h
            .state
            .store
            .insert(&NewJob {
                owner_id: "user-1".to_string(),
                kind: JobKind::Training,
            })
            .unwrap();
        h.provider.script("ext-train", vec![running()]);

        let (status, _) = call(
            &h.app,
            request(
                "POST",
                "/v1/polling",
                Some(json!({"externalId": "ext-train", "jobId": record.id})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (_, listing) = call(&h.app, request("GET", "/v1/polling", None)).await;
        assert_eq!(listing["active"], 1);
        assert_eq!(listing["jobs"][0]["externalId"], "ext-train");
        assert_eq!(listing["jobs"][0]["maxAttempts"], 120);

        let (status, stopped) = call(&h.app, request("DELETE", "/v1/polling/ext-train", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stopped["stopped"], true);
        assert!(h.state.scheduler.polling_status().await.is_empty());
    }

    #[tokio::test]
    async fn polling_rejects_external_id_owned_by_another_job() {
        let h = harness();
        let first = submit(&h).await;
        let second = h
            .state
            .store
            .insert(&NewJob {
                owner_id: "user-1".to_string(),
                kind: JobKind::Generation,
            })
            .unwrap();

        let (status, body) = call(
            &h.app,
            request(
                "POST",
                "/v1/polling",
                Some(json!({"externalId": first["externalId"], "jobId": second.id})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "EXTERNAL_ID_IN_USE");
        let untouched = h.state.store.get(&second.job_ref()).unwrap().unwrap();
        assert!(untouched.external_id.is_none());
        h.state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_is_refused_while_outputs_are_being_stored() {
        let h = harness();
        let body = submit(&h).await;
        let id = body["id"].as_str().unwrap();
        let job = JobRef::new(id, "user-1");
        assert!(h
            .state
            .store
            .claim_finalization(&job, Duration::from_secs(600))
            .unwrap());

        let (status, body) = call(&h.app, request("POST", &format!("/v1/jobs/{id}/cancel"), None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "JOB_FINALIZING");
        assert_eq!(
            h.state.store.get(&job).unwrap().unwrap().status,
            JobState::Queued
        );
    }

    #[tokio::test]
    async fn huge_sync_age_is_accepted() {
        let h = harness();
        let (status, report) = call(
            &h.app,
            request(
                "POST",
                "/v1/sync",
                Some(json!({"olderThanSeconds": 1_000_000_000_000_000u64})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["checked"], 0);
    }

    #[tokio::test]
    async fn manual_sync_reports_per_job_outcomes() {
        let h = harness();
        let record = h
            .state
            .store
            .insert(&NewJob {
                owner_id: "user-1".to_string(),
                kind: JobKind::Generation,
            })
            .unwrap();
        h.state
            .store
            .attach_external_id(&record.job_ref(), "ext-lost")
            .unwrap();
        h.provider
            .script("ext-lost", vec![succeeded(&["https://replicate.delivery/x.png"])]);
        std::thread::sleep(Duration::from_millis(2));

        let (status, report) = call(
            &h.app,
            request("POST", "/v1/sync", Some(json!({"olderThanSeconds": 0}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["checked"], 1);
        assert_eq!(report["updated"], 1);
        assert_eq!(report["items"][0]["action"], "updated");
        assert_eq!(report["items"][0]["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn artifact_route_rejects_traversal() {
        let h = harness();
        let req = Request::builder()
            .uri("/v1/artifacts/user-1/..%2F..%2Fetc/passwd")
            .body(Body::empty())
            .unwrap();
        let response = h.app.clone().oneshot(req).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
