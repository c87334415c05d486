//! Listener configuration, read from the environment (after `.env` has been loaded).
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{CheckpointPolicy, DEFAULT_POLL_INTERVAL};
use crate::listener::TransportMode;
use crate::push::DEFAULT_REFRESH_INTERVAL;
use crate::signer::{DEFAULT_GATEWAY, DEFAULT_GRANT_TTL};

/// Public Base Sepolia endpoints tried after the configured primary.
pub const PUBLIC_FALLBACK_RPCS: [&str; 2] =
    ["https://base-sepolia.drpc.org", "https://sepolia.base.org"];

/// Problems turning the environment into a [`ListenerConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is unset or blank.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    /// A variable is set but unusable.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },
    /// Neither `RPC_URLS` nor `BASE_SEPOLIA_RPC_URL` produced an endpoint.
    #[error("no RPC endpoints configured (set RPC_URLS or BASE_SEPOLIA_RPC_URL)")]
    NoEndpoints,
}

/// Where the block checkpoint is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckpointBackend {
    /// `{ "lastBlock": n }` in a JSON file.
    #[default]
    Json,
    /// Key/value row in an SQLite database.
    Sqlite,
}

impl CheckpointBackend {
    /// File used when `CHECKPOINT_FILE` is unset.
    pub fn default_file(self) -> &'static str {
        match self {
            CheckpointBackend::Json => "lastBlock.json",
            CheckpointBackend::Sqlite => "lastBlock.sqlite",
        }
    }
}

/// Everything the binary needs to build a [`crate::Listener`].
#[derive(Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Endpoints in priority order. The first one decides push vs pull.
    pub rpc_urls: Vec<String>,
    /// HMAC secret for download tokens.
    pub download_secret: String,
    /// Registry file written by the creation workflow.
    pub datasets_file: PathBuf,
    /// Grant log read by the HTTP API.
    pub access_db_file: PathBuf,
    /// Checkpoint file (JSON) or database (SQLite); see [`CheckpointBackend::default_file`].
    pub checkpoint_file: PathBuf,
    /// Pull strategy poll interval.
    pub poll_interval: Duration,
    /// Push strategy registry refresh interval.
    pub refresh_interval: Duration,
    /// Lifetime of signed URLs.
    pub grant_ttl: Duration,
    /// Gateway base for signed URLs.
    pub gateway_url: String,
    /// Checkpoint behavior when blocks are dropped.
    pub checkpoint_policy: CheckpointPolicy,
    /// Checkpoint persistence backend.
    pub checkpoint_backend: CheckpointBackend,
}

impl std::fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("rpc_urls", &self.rpc_urls)
            .field("download_secret", &"<redacted>")
            .field("datasets_file", &self.datasets_file)
            .field("access_db_file", &self.access_db_file)
            .field("checkpoint_file", &self.checkpoint_file)
            .field("poll_interval", &self.poll_interval)
            .field("refresh_interval", &self.refresh_interval)
            .field("grant_ttl", &self.grant_ttl)
            .field("gateway_url", &self.gateway_url)
            .field("checkpoint_policy", &self.checkpoint_policy)
            .field("checkpoint_backend", &self.checkpoint_backend)
            .finish()
    }
}

impl ListenerConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let rpc_urls = match get("RPC_URLS") {
            Some(list) => split_list(&list),
            None => match get("BASE_SEPOLIA_RPC_URL") {
                Some(primary) => std::iter::once(primary)
                    .chain(PUBLIC_FALLBACK_RPCS.iter().map(|s| s.to_string()))
                    .collect(),
                None => Vec::new(),
            },
        };
        if rpc_urls.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        let download_secret = get("DOWNLOAD_SECRET").ok_or(ConfigError::Missing("DOWNLOAD_SECRET"))?;

        let checkpoint_backend = match get("CHECKPOINT_BACKEND").as_deref() {
            None => CheckpointBackend::Json,
            Some(v) if v.eq_ignore_ascii_case("json") => CheckpointBackend::Json,
            Some(v) if v.eq_ignore_ascii_case("sqlite") => {
                if cfg!(feature = "store-sqlite") {
                    CheckpointBackend::Sqlite
                } else {
                    return Err(ConfigError::Invalid {
                        name: "CHECKPOINT_BACKEND",
                        reason: "built without the store-sqlite feature".into(),
                    });
                }
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "CHECKPOINT_BACKEND",
                    reason: format!("expected json or sqlite, got {other:?}"),
                })
            }
        };

        let checkpoint_policy = if parse_bool("STRICT_CHECKPOINT", get("STRICT_CHECKPOINT"))? {
            CheckpointPolicy::Strict
        } else {
            CheckpointPolicy::BestEffort
        };

        Ok(Self {
            rpc_urls,
            download_secret,
            datasets_file: get("DATASETS_FILE")
                .unwrap_or_else(|| "datasets.json".into())
                .into(),
            access_db_file: get("ACCESS_DB_FILE").unwrap_or_else(|| "db.json".into()).into(),
            checkpoint_file: get("CHECKPOINT_FILE")
                .unwrap_or_else(|| checkpoint_backend.default_file().into())
                .into(),
            poll_interval: parse_secs("POLL_INTERVAL_SECS", get("POLL_INTERVAL_SECS"))?
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            refresh_interval: parse_secs("REFRESH_INTERVAL_SECS", get("REFRESH_INTERVAL_SECS"))?
                .unwrap_or(DEFAULT_REFRESH_INTERVAL),
            grant_ttl: parse_secs("GRANT_TTL_SECS", get("GRANT_TTL_SECS"))?
                .unwrap_or(DEFAULT_GRANT_TTL),
            gateway_url: get("GATEWAY_URL").unwrap_or_else(|| DEFAULT_GATEWAY.into()),
            checkpoint_policy,
            checkpoint_backend,
        })
    }

    /// The endpoint that decides the transport strategy.
    pub fn primary_endpoint(&self) -> &str {
        self.rpc_urls.first().map(String::as_str).unwrap_or_default()
    }

    /// Push if the primary endpoint is a WebSocket URL, pull otherwise.
    pub fn mode(&self) -> TransportMode {
        TransportMode::from_endpoint(self.primary_endpoint())
    }

    /// The request/response endpoints, in order. WebSocket entries are skipped.
    pub fn poll_endpoints(&self) -> Vec<&str> {
        self.rpc_urls
            .iter()
            .map(String::as_str)
            .filter(|u| TransportMode::from_endpoint(u) == TransportMode::Pull)
            .collect()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_secs(name: &'static str, raw: Option<String>) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = raw else { return Ok(None) };
    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            name,
            reason: "must be at least 1 second".into(),
        }),
        Ok(secs) => Ok(Some(Duration::from_secs(secs))),
        Err(e) => Err(ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(name: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    let Some(raw) = raw else { return Ok(false) };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            name,
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}
