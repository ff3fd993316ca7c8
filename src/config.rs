use std::{env, fs, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use tracing::warn;
use uuid::Uuid;

use crate::{finalizer::FinalizeConfig, scheduler::PollConfig, sync::SyncConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub database_path: PathBuf,
    pub storage_root: PathBuf,
    pub public_base_url: String,
    pub provider_base_url: String,
    pub provider_token: String,
    pub webhook_url: Option<String>,
    pub auto_poll: bool,
    pub poll: PollConfig,
    pub finalize: FinalizeConfig,
    pub finalize_lease: Duration,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_key: String::new(),
            api_key_is_fallback: false,
            database_path: PathBuf::from("./data/jobs.sqlite3"),
            storage_root: PathBuf::from("./data/artifacts"),
            public_base_url: "http://localhost:8080".to_string(),
            provider_base_url: "https://api.replicate.com/v1".to_string(),
            provider_token: String::new(),
            webhook_url: None,
            auto_poll: true,
            poll: PollConfig::default(),
            finalize: FinalizeConfig::default(),
            finalize_lease: Duration::from_secs(10 * 60),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("REPLICATE_SYNC_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key();

        let database_path = PathBuf::from(
            env::var("REPLICATE_SYNC_DATABASE_PATH")
                .unwrap_or_else(|_| "./data/jobs.sqlite3".to_string()),
        );
        let storage_root = PathBuf::from(
            env::var("REPLICATE_SYNC_STORAGE_ROOT")
                .unwrap_or_else(|_| "./data/artifacts".to_string()),
        );
        let public_base_url = env::var("REPLICATE_SYNC_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let provider_base_url = env::var("REPLICATE_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.replicate.com/v1".to_string());
        let provider_token = env::var("REPLICATE_API_TOKEN").unwrap_or_default();
        if provider_token.trim().is_empty() {
            warn!("REPLICATE_API_TOKEN not set; provider calls will be rejected");
        }

        // Providers refuse to deliver to plain-http endpoints, so local
        // development relies on polling alone.
        let webhook_url = env::var("REPLICATE_SYNC_WEBHOOK_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| v.starts_with("https://"));

        let poll_defaults = PollConfig::default();
        let poll = PollConfig {
            interval: env_millis("REPLICATE_SYNC_POLL_INTERVAL_MS", poll_defaults.interval),
            max_attempts: env_parse("REPLICATE_SYNC_POLL_MAX_ATTEMPTS", poll_defaults.max_attempts)
                .max(1),
            backoff_factor: env_parse(
                "REPLICATE_SYNC_POLL_BACKOFF_FACTOR",
                poll_defaults.backoff_factor,
            )
            .max(1.0),
            max_backoff: env_millis("REPLICATE_SYNC_POLL_MAX_BACKOFF_MS", poll_defaults.max_backoff),
        };

        let finalize_defaults = FinalizeConfig::default();
        let finalize = FinalizeConfig {
            max_attempts: env_parse(
                "REPLICATE_SYNC_FINALIZE_ATTEMPTS",
                finalize_defaults.max_attempts,
            )
            .max(1),
            backoff: env_millis("REPLICATE_SYNC_FINALIZE_BACKOFF_MS", finalize_defaults.backoff),
            derive_thumbnails: env_flag(
                "REPLICATE_SYNC_THUMBNAILS",
                finalize_defaults.derive_thumbnails,
            ),
            thumbnail_max_edge: env_parse(
                "REPLICATE_SYNC_THUMBNAIL_MAX_EDGE",
                finalize_defaults.thumbnail_max_edge,
            ),
        };

        let finalize_lease = Duration::from_secs(env_parse(
            "REPLICATE_SYNC_FINALIZE_LEASE_SECONDS",
            10 * 60,
        ));

        let sync_defaults = SyncConfig::default();
        let sync = SyncConfig {
            stale_after: Duration::from_secs(env_parse(
                "REPLICATE_SYNC_STALE_AFTER_SECONDS",
                sync_defaults.stale_after.as_secs(),
            )),
            item_delay: env_millis("REPLICATE_SYNC_ITEM_DELAY_MS", sync_defaults.item_delay),
            batch_limit: env_parse("REPLICATE_SYNC_BATCH_LIMIT", sync_defaults.batch_limit),
            interval: Duration::from_secs(env_parse(
                "REPLICATE_SYNC_INTERVAL_SECONDS",
                sync_defaults.interval.as_secs(),
            )),
        };

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            database_path,
            storage_root,
            public_base_url,
            provider_base_url,
            provider_token,
            webhook_url,
            auto_poll: env_flag("REPLICATE_SYNC_AUTO_POLL", true),
            poll,
            finalize,
            finalize_lease,
            sync,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| parse_flag(&v))
        .unwrap_or(default)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn resolve_api_key() -> (String, bool) {
    if let Ok(value) = env::var("REPLICATE_SYNC_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    if let Ok(key_file) = env::var("REPLICATE_SYNC_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                warn!(
                    key_file = %key_file,
                    "REPLICATE_SYNC_API_KEY_FILE is empty; falling back to generated key"
                );
            }
            Err(err) => {
                warn!(
                    key_file = %key_file,
                    "Failed reading REPLICATE_SYNC_API_KEY_FILE: {err}; falling back to generated key"
                );
            }
        }
    } else {
        warn!("REPLICATE_SYNC_API_KEY not set; falling back to generated key");
    }

    (format!("fallback-{}", Uuid::new_v4()), true)
}
