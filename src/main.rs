mod api;
mod artifact_store;
mod auth;
mod config;
mod error;
mod finalizer;
mod models;
mod provider;
mod reconcile;
mod scheduler;
mod store;
mod sync;
#[cfg(test)]
mod testing;
mod webhook;

use std::sync::Arc;

use anyhow::{Context, Result};
use artifact_store::LocalObjectStore;
use axum::{
    routing::{delete, get, post},
    Router,
};
use config::Config;
use finalizer::ArtifactFinalizer;
use provider::{ProviderClient, ReplicateClient};
use reconcile::Reconciler;
use scheduler::PollScheduler;
use store::JobStore;
use sync::ManualSync;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use webhook::WebhookReconciler;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<JobStore>,
    pub provider: Arc<dyn ProviderClient>,
    pub objects: Arc<LocalObjectStore>,
    pub reconciler: Arc<Reconciler>,
    pub scheduler: Arc<PollScheduler>,
    pub webhooks: Arc<WebhookReconciler>,
    pub sync: Arc<ManualSync>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<JobStore>,
        provider: Arc<dyn ProviderClient>,
        objects: Arc<LocalObjectStore>,
    ) -> Self {
        let finalizer =
            ArtifactFinalizer::new(provider.clone(), objects.clone(), config.finalize.clone());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            finalizer,
            config.finalize_lease,
        ));
        let scheduler =
            PollScheduler::new(provider.clone(), reconciler.clone(), config.poll.clone());
        let webhooks = Arc::new(WebhookReconciler::new(
            reconciler.clone(),
            scheduler.clone(),
        ));
        let sync = Arc::new(ManualSync::new(
            provider.clone(),
            reconciler.clone(),
            scheduler.clone(),
            config.sync.clone(),
        ));

        Self {
            config,
            store,
            provider,
            objects,
            reconciler,
            scheduler,
            webhooks,
            sync,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/v1/jobs", post(api::create_job))
        .route("/v1/jobs/{job_id}", get(api::get_job))
        .route("/v1/jobs/{job_id}/cancel", post(api::cancel_job))
        .route(
            "/v1/polling",
            get(api::polling_status).post(api::start_polling),
        )
        .route("/v1/polling/{external_id}", delete(api::stop_polling))
        .route("/v1/sync", post(api::manual_sync))
        .route("/v1/webhooks/replicate", post(api::receive_webhook))
        .route("/v1/artifacts/{*key}", get(api::download_artifact))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replicate_sync=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    artifact_store::ensure_storage_root(&config.storage_root).await?;
    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    if config.api_key_is_fallback {
        warn!("Using generated API key {}", config.api_key);
    }
    if config.webhook_url.is_none() {
        info!("No https webhook URL configured; relying on polling");
    }

    let store = Arc::new(JobStore::open(&config.database_path)?);
    let provider: Arc<dyn ProviderClient> = Arc::new(ReplicateClient::new(
        config.provider_base_url.clone(),
        config.provider_token.clone(),
    )?);
    let objects = Arc::new(LocalObjectStore::new(
        config.storage_root.clone(),
        config.public_base_url.clone(),
    ));
    let state = AppState::new(config.clone(), store, provider, objects);

    let shutdown = CancellationToken::new();
    sync::spawn_sync_worker(state.sync.clone(), shutdown.clone());

    let scheduler = state.scheduler.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("replicate-sync listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    scheduler.shutdown().await;
    info!("replicate-sync stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed listening for shutdown signal: {err}");
    }
}
