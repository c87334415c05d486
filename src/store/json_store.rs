//! Flat JSON file stores, the format shared with the HTTP API and the creation workflow.
//!
//! No cross-process locking: the registry is written by another process and read here as a
//! fresh full reload each time. Writes go through temp-file + rename so readers never see a
//! half-written file.
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task;

use crate::store::{AccessGrant, CheckpointStore, GrantStore, Registry, RegistryStore};

/// Read and parse `path`, or `None` if the file does not exist.
///
/// An empty file is an error, not an empty value: writers outside this crate truncate before
/// writing, so a blank file is a write in progress.
fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if raw.trim().is_empty() {
        bail!("{} is empty (write in progress?)", path.display());
    }
    let value =
        serde_json::from_str(&raw).with_context(|| format!("parse JSON in {}", path.display()))?;
    Ok(Some(value))
}

/// Pretty-print `value` into `path` atomically.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent directories of {}", path.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("serialize JSON")?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file =
        fs::File::create(&tmp).with_context(|| format!("create temp file {}", tmp.display()))?;
    file.write_all(json.as_bytes())
        .with_context(|| format!("write {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// `datasets.json`: `{ "<token address>": { symbol, cid, ... } }`.
pub struct JsonRegistry {
    path: PathBuf,
}

impl JsonRegistry {
    /// Registry backed by the file at `path` (may not exist yet).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add or replace one record. Used by tooling and tests; the listener itself only reads.
    pub async fn upsert(&self, token: &str, record: crate::DatasetRecord) -> anyhow::Result<()> {
        let path = self.path.clone();
        let token = token.to_string();
        task::spawn_blocking(move || {
            let mut registry: Registry = read_json(&path)?.unwrap_or_default();
            registry.insert(&token, record);
            write_json_atomic(&path, &registry)
        })
        .await?
    }
}

#[async_trait]
impl RegistryStore for JsonRegistry {
    async fn load_registry(&self) -> anyhow::Result<Registry> {
        let path = self.path.clone();
        task::spawn_blocking(move || Ok(read_json::<Registry>(&path)?.unwrap_or_default())).await?
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(rename = "lastBlock")]
    last_block: u64,
}

/// `lastBlock.json`: `{ "lastBlock": n }`. Owned exclusively by the pull strategy.
pub struct JsonCheckpointStore {
    path: PathBuf,
}

impl JsonCheckpointStore {
    /// Checkpoint backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn load_checkpoint(&self) -> anyhow::Result<Option<u64>> {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            Ok(read_json::<CheckpointFile>(&path)?.map(|f| f.last_block))
        })
        .await?
    }

    async fn save_checkpoint(&self, block: u64) -> anyhow::Result<()> {
        let path = self.path.clone();
        task::spawn_blocking(move || write_json_atomic(&path, &CheckpointFile { last_block: block }))
            .await?
    }
}

/// `db.json`: a JSON array of grants, appended to and read newest-first.
pub struct JsonGrantLog {
    path: PathBuf,
    // serializes read-modify-write appends from concurrent event handlers
    write_lock: Mutex<()>,
}

impl JsonGrantLog {
    /// Grant log backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Every grant, oldest first.
    pub async fn all(&self) -> anyhow::Result<Vec<AccessGrant>> {
        let path = self.path.clone();
        task::spawn_blocking(move || Ok(read_json::<Vec<AccessGrant>>(&path)?.unwrap_or_default()))
            .await?
    }
}

#[async_trait]
impl GrantStore for JsonGrantLog {
    async fn append_grant(&self, grant: AccessGrant) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut grants: Vec<AccessGrant> = read_json(&path)?.unwrap_or_default();
            grants.push(grant);
            write_json_atomic(&path, &grants)
        })
        .await?
    }

    async fn latest_grant(&self, user: &str, symbol: &str) -> anyhow::Result<Option<AccessGrant>> {
        let grants = self.all().await?;
        Ok(grants
            .into_iter()
            .rev()
            .find(|g| g.user.eq_ignore_ascii_case(user) && g.symbol == symbol))
    }
}
