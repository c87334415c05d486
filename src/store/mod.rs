//! Persistence interfaces used by the listener: the dataset registry, the block checkpoint,
//! and the access-grant log. Each is reachable only through load/save style calls.
use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata for one tokenized dataset, keyed in the registry by token contract address.
///
/// Accepts both `contentId`/`poolAddress`/`createdAt` and the creation workflow's
/// `cid`/`bonding_curve`/`created_at` field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Short uppercase ticker, immutable after creation.
    pub symbol: String,
    /// Content identifier of the uploaded file, possibly `ipfs://`-prefixed.
    #[serde(rename = "contentId", alias = "cid")]
    pub content_id: String,
    /// Pool / bonding-curve contract, once the pool has been initialized.
    #[serde(
        rename = "poolAddress",
        alias = "bonding_curve",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pool_address: Option<String>,
    /// Creation time, milliseconds since the epoch.
    #[serde(rename = "createdAt", alias = "created_at", default)]
    pub created_at: i64,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DatasetRecord {
    /// A record with no pool yet, stamped with the current time.
    pub fn new(symbol: impl Into<String>, content_id: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            content_id: content_id.into(),
            pool_address: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            name: None,
            description: None,
        }
    }
}

/// Snapshot of the registry. Keys are always lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Value>", into = "BTreeMap<String, DatasetRecord>")]
pub struct Registry {
    records: BTreeMap<String, DatasetRecord>,
}

impl From<BTreeMap<String, DatasetRecord>> for Registry {
    fn from(map: BTreeMap<String, DatasetRecord>) -> Self {
        Self::from_records(map)
    }
}

/// Records are decoded one at a time; an unusable entry is skipped with a warning so the rest
/// of the registry stays live.
impl From<BTreeMap<String, Value>> for Registry {
    fn from(raw: BTreeMap<String, Value>) -> Self {
        let records = raw.into_iter().filter_map(|(key, value)| {
            match serde_json::from_value::<DatasetRecord>(value) {
                Ok(record) => Some((key, record)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "registry record unusable, skipping");
                    None
                }
            }
        });
        Self::from_records(records)
    }
}

impl From<Registry> for BTreeMap<String, DatasetRecord> {
    fn from(registry: Registry) -> Self {
        registry.records
    }
}

impl Registry {
    /// Build a registry, lowercasing every key.
    pub fn from_records<I, K>(records: I) -> Self
    where
        I: IntoIterator<Item = (K, DatasetRecord)>,
        K: AsRef<str>,
    {
        let records = records
            .into_iter()
            .map(|(k, v)| (k.as_ref().trim().to_ascii_lowercase(), v))
            .collect();
        Self { records }
    }

    /// Case-insensitive lookup by token address string.
    pub fn get(&self, token: &str) -> Option<&DatasetRecord> {
        self.records.get(&token.trim().to_ascii_lowercase())
    }

    /// Lookup by parsed address.
    pub fn get_address(&self, token: &Address) -> Option<&DatasetRecord> {
        self.records.get(&crate::events::lower_hex(token))
    }

    /// Insert or replace a record.
    pub fn insert(&mut self, token: &str, record: DatasetRecord) {
        self.records.insert(token.trim().to_ascii_lowercase(), record);
    }

    /// Every key that parses as a 20-byte address. Malformed keys are skipped with a warning.
    pub fn targets(&self) -> Vec<Address> {
        self.records
            .keys()
            .filter_map(|key| match key.parse::<Address>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "registry key is not an address, skipping");
                    None
                }
            })
            .collect()
    }

    /// Iterate `(lowercase address, record)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DatasetRecord)> {
        self.records.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of registered datasets.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A download entitlement written after a qualifying event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    /// Lowercase user address.
    pub user: String,
    /// Dataset symbol from the registry.
    pub symbol: String,
    /// Lowercase token contract address.
    pub token: String,
    /// Burned / redeemed amount in base units, decimal.
    pub amount: String,
    /// Signed, expiring download URL.
    pub download_url: String,
    /// Grant time, milliseconds since the epoch.
    pub ts: i64,
}

/// Read side of the dataset registry. Written by the external creation workflow.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Full fresh reload; callers must not cache the result across cycles.
    async fn load_registry(&self) -> anyhow::Result<Registry>;
}

/// The last fully processed block height.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` until the first checkpoint is written.
    async fn load_checkpoint(&self) -> anyhow::Result<Option<u64>>;

    /// Durably record `block` as fully processed.
    async fn save_checkpoint(&self, block: u64) -> anyhow::Result<()>;
}

/// Append-only log of access grants.
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Append one grant. Duplicates are allowed.
    async fn append_grant(&self, grant: AccessGrant) -> anyhow::Result<()>;

    /// Most recent grant for `user` (case-insensitive) and `symbol` (exact).
    async fn latest_grant(&self, user: &str, symbol: &str) -> anyhow::Result<Option<AccessGrant>>;
}

#[async_trait]
impl<T: RegistryStore + ?Sized> RegistryStore for Arc<T> {
    async fn load_registry(&self) -> anyhow::Result<Registry> {
        (**self).load_registry().await
    }
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn load_checkpoint(&self) -> anyhow::Result<Option<u64>> {
        (**self).load_checkpoint().await
    }

    async fn save_checkpoint(&self, block: u64) -> anyhow::Result<()> {
        (**self).save_checkpoint(block).await
    }
}

#[async_trait]
impl<T: GrantStore + ?Sized> GrantStore for Arc<T> {
    async fn append_grant(&self, grant: AccessGrant) -> anyhow::Result<()> {
        (**self).append_grant(grant).await
    }

    async fn latest_grant(&self, user: &str, symbol: &str) -> anyhow::Result<Option<AccessGrant>> {
        (**self).latest_grant(user, symbol).await
    }
}

// concrete stores live here
pub mod json_store;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
