//! Turns ephemeral provider output URLs into durably stored artifacts.
//!
//! A batch either lands completely in the object store or not at all. After
//! the configured number of attempts the job keeps the provider URLs, tagged
//! `temporary-fallback`, with a warning that they will expire.

use std::{io::Cursor, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};
use tracing::{info, warn};

use crate::{
    artifact_store::{
        artifact_key, content_type_for_extension, extension_from_url, thumbnail_key, ObjectStore,
    },
    models::{JobOutputs, JobRef, StorageMode},
    provider::ProviderClient,
};

#[derive(Debug, Clone)]
pub struct FinalizeConfig {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub derive_thumbnails: bool,
    pub thumbnail_max_edge: u32,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            derive_thumbnails: true,
            thumbnail_max_edge: 512,
        }
    }
}

pub struct ArtifactFinalizer {
    provider: Arc<dyn ProviderClient>,
    objects: Arc<dyn ObjectStore>,
    config: FinalizeConfig,
}

struct StoredBatch {
    permanent_urls: Vec<String>,
    thumbnail_urls: Vec<String>,
    storage_keys: Vec<String>,
}

impl ArtifactFinalizer {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        objects: Arc<dyn ObjectStore>,
        config: FinalizeConfig,
    ) -> Self {
        Self {
            provider,
            objects,
            config,
        }
    }

    /// Never fails: storage trouble degrades to the fallback outputs.
    pub async fn finalize(&self, urls: &[String], job: &JobRef) -> JobOutputs {
        let mut last_error = None;

        for attempt in 1..=self.config.max_attempts {
            let mut written = Vec::new();
            match self.store_batch(urls, job, &mut written).await {
                Ok(batch) => {
                    info!(
                        job_id = %job.job_id,
                        artifacts = batch.permanent_urls.len(),
                        attempt,
                        "Artifacts stored durably"
                    );
                    return JobOutputs {
                        permanent_urls: batch.permanent_urls,
                        thumbnail_urls: batch.thumbnail_urls,
                        storage_keys: batch.storage_keys,
                        mode: StorageMode::Durable,
                        warning: None,
                    };
                }
                Err(err) => {
                    warn!(
                        job_id = %job.job_id,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        "Artifact storage attempt failed: {err:#}"
                    );
                    self.discard(&written).await;
                    last_error = Some(err);
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.config.backoff * attempt).await;
                    }
                }
            }
        }

        let reason = last_error
            .map(|err| format!("{err:#}"))
            .unwrap_or_else(|| "unknown error".to_string());
        warn!(
            job_id = %job.job_id,
            "Falling back to temporary provider URLs: {reason}"
        );

        JobOutputs {
            permanent_urls: urls.to_vec(),
            thumbnail_urls: urls.to_vec(),
            storage_keys: Vec::new(),
            mode: StorageMode::TemporaryFallback,
            warning: Some(fallback_warning(self.config.max_attempts, &reason)),
        }
    }

    async fn store_batch(
        &self,
        urls: &[String],
        job: &JobRef,
        written: &mut Vec<String>,
    ) -> Result<StoredBatch> {
        let mut batch = StoredBatch {
            permanent_urls: Vec::with_capacity(urls.len()),
            thumbnail_urls: Vec::with_capacity(urls.len()),
            storage_keys: Vec::with_capacity(urls.len()),
        };

        for (index, url) in urls.iter().enumerate() {
            let bytes = self
                .provider
                .download(url)
                .await
                .with_context(|| format!("Failed downloading {url}"))?;

            let extension = extension_from_url(url);
            let key = artifact_key(&job.owner_id, &job.job_id, index, &extension);
            let thumbnail = if self.config.derive_thumbnails {
                derive_thumbnail(&bytes, self.config.thumbnail_max_edge).await
            } else {
                None
            };

            let permanent = self
                .objects
                .store(&key, bytes, content_type_for_extension(&extension))
                .await
                .with_context(|| format!("Failed storing {key}"))?;
            written.push(key.clone());
            batch.storage_keys.push(key);

            let thumbnail_url = match thumbnail {
                Some(thumb) => {
                    let thumb_key = thumbnail_key(&job.owner_id, &job.job_id, index);
                    let stored = self
                        .objects
                        .store(&thumb_key, thumb, "image/jpeg")
                        .await
                        .with_context(|| format!("Failed storing {thumb_key}"))?;
                    written.push(thumb_key.clone());
                    batch.storage_keys.push(thumb_key);
                    stored
                }
                None => permanent.clone(),
            };

            batch.permanent_urls.push(permanent);
            batch.thumbnail_urls.push(thumbnail_url);
        }

        Ok(batch)
    }

    /// Best-effort removal of stored objects.
    pub async fn discard(&self, keys: &[String]) {
        for key in keys {
            if let Err(err) = self.objects.delete(key).await {
                warn!(key = %key, "Failed removing partial artifact: {err:#}");
            }
        }
    }
}

/// JPEG thumbnail for decodable images; `None` for videos, weights and the like.
async fn derive_thumbnail(bytes: &[u8], max_edge: u32) -> Option<Vec<u8>> {
    let format = image::guess_format(bytes).ok()?;
    if !matches!(
        format,
        ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP
    ) {
        return None;
    }

    let owned = bytes.to_vec();
    let encoded = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let decoded = image::load_from_memory_with_format(&owned, format)?;
        let thumb = DynamicImage::ImageRgb8(decoded.thumbnail(max_edge, max_edge).to_rgb8());
        let mut out = Cursor::new(Vec::new());
        thumb.write_to(&mut out, ImageFormat::Jpeg)?;
        Ok(out.into_inner())
    })
    .await;

    match encoded {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(err)) => {
            warn!("Thumbnail derivation failed: {err:#}");
            None
        }
        Err(err) => {
            warn!("Thumbnail task join error: {err:#}");
            None
        }
    }
}

pub fn fallback_warning(attempts: u32, reason: &str) -> String {
    format!(
        "Durable storage failed after {attempts} attempts ({reason}). Results are served from temporary provider URLs that expire in about 1 hour; download them before then."
    )
}
