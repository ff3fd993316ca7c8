use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;

/// Durable blob storage for finalized artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return the permanent URL.
    async fn store(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Filesystem-backed store whose objects are served by the artifact route.
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf, public_base_url: String) -> Self {
        Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/v1/artifacts/{}", self.public_base_url, key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn store(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        let path = object_path(&self.root, key)?;
        ensure_parent_dir(&path).await?;

        // Write-then-rename so a reader never sees a half-written object.
        let tmp = path.with_extension("partial");
        fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move object into place at {}", path.display()))?;

        Ok(self.public_url(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = object_path(&self.root, key)?;
        delete_file_if_exists(&path).await
    }
}

pub async fn ensure_storage_root(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create storage root at {}", path.display()))
}

/// Resolve a storage key below `root`, rejecting anything that could escape it.
pub fn object_path(root: &Path, key: &str) -> Result<PathBuf> {
    let relative = Path::new(key);
    if key.is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        anyhow::bail!("Invalid storage key `{key}`");
    }
    Ok(root.join(relative))
}

pub fn artifact_key(owner_id: &str, job_id: &str, index: usize, extension: &str) -> String {
    format!("{owner_id}/{job_id}/{index}.{extension}")
}

pub fn thumbnail_key(owner_id: &str, job_id: &str, index: usize) -> String {
    format!("{owner_id}/{job_id}/thumb-{index}.jpg")
}

/// File extension from the last path segment of `url`, defaulting to `bin`.
pub fn extension_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let segment = path.rsplit('/').next().unwrap_or_default();
    match segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "bin".to_string(),
    }
}

pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "tar" => "application/x-tar",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}
