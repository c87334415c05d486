//! Picks push or pull once, from the primary endpoint's scheme, and runs it.
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::config::{CheckpointBackend, ListenerConfig};
use crate::engine::PollEngine;
use crate::grants::GrantIssuer;
use crate::hooks::ListenerHooks;
use crate::push::PushListener;
use crate::rpc::{FallbackRpc, LogSource};
use crate::signer::GrantSigner;
use crate::store::json_store::{JsonCheckpointStore, JsonGrantLog, JsonRegistry};
use crate::store::CheckpointStore;

/// How events reach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Server-pushed log subscriptions over WebSocket.
    Push,
    /// Periodic `eth_getLogs` over HTTP.
    Pull,
}

impl TransportMode {
    /// `ws://` and `wss://` (any case) select push; everything else pulls.
    pub fn from_endpoint(url: &str) -> Self {
        let url = url.trim().to_ascii_lowercase();
        if url.starts_with("ws://") || url.starts_with("wss://") {
            TransportMode::Push
        } else {
            TransportMode::Pull
        }
    }
}

/// A way of delivering events to [`ListenerHooks`].
#[async_trait]
pub trait EventStrategy: Send + Sync {
    /// Which transport this strategy uses.
    fn mode(&self) -> TransportMode;

    /// Deliver events until the process stops. Transient failures are retried internally.
    async fn run(&self, hooks: Arc<dyn ListenerHooks>) -> anyhow::Result<()>;

    /// Deliver whatever is currently pending and return.
    async fn run_once(&self, hooks: Arc<dyn ListenerHooks>) -> anyhow::Result<()>;
}

#[async_trait]
impl<C, L> EventStrategy for PollEngine<C, L>
where
    C: CheckpointStore + 'static,
    L: LogSource + 'static,
{
    fn mode(&self) -> TransportMode {
        TransportMode::Pull
    }

    async fn run(&self, hooks: Arc<dyn ListenerHooks>) -> anyhow::Result<()> {
        self.poll_forever(hooks.as_ref()).await
    }

    async fn run_once(&self, hooks: Arc<dyn ListenerHooks>) -> anyhow::Result<()> {
        let outcome = self.poll_once(hooks.as_ref()).await?;
        tracing::info!(
            checkpoint = outcome.checkpoint,
            head = outcome.head,
            events = outcome.events,
            dropped = outcome.dropped_blocks.len(),
            "single poll complete"
        );
        Ok(())
    }
}

#[async_trait]
impl EventStrategy for PushListener {
    fn mode(&self) -> TransportMode {
        TransportMode::Push
    }

    async fn run(&self, hooks: Arc<dyn ListenerHooks>) -> anyhow::Result<()> {
        PushListener::run(self, hooks).await
    }

    async fn run_once(&self, _hooks: Arc<dyn ListenerHooks>) -> anyhow::Result<()> {
        anyhow::bail!("a WebSocket endpoint has no backlog to drain; use an HTTP endpoint for single runs")
    }
}

/// A strategy bound to the hooks it feeds.
pub struct Listener {
    strategy: Box<dyn EventStrategy>,
    hooks: Arc<dyn ListenerHooks>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("mode", &self.strategy.mode())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Pair any strategy with any hooks.
    pub fn new(strategy: impl EventStrategy + 'static, hooks: Arc<dyn ListenerHooks>) -> Self {
        Self {
            strategy: Box::new(strategy),
            hooks,
        }
    }

    /// Wire the JSON stores, the signer and the transport chosen by `config`.
    pub fn from_config(config: &ListenerConfig) -> anyhow::Result<Self> {
        let signer = GrantSigner::new(&config.download_secret)?
            .with_gateway(config.gateway_url.clone())
            .with_ttl(config.grant_ttl);
        let hooks: Arc<dyn ListenerHooks> = Arc::new(GrantIssuer::new(
            JsonRegistry::new(&config.datasets_file),
            JsonGrantLog::new(&config.access_db_file),
            signer,
        ));

        let strategy: Box<dyn EventStrategy> = match config.mode() {
            TransportMode::Push => Box::new(
                PushListener::new(config.primary_endpoint())
                    .with_refresh_interval(config.refresh_interval),
            ),
            TransportMode::Pull => {
                let checkpoints = checkpoint_store(config)?;
                let rpc = FallbackRpc::new(config.poll_endpoints())
                    .context("build RPC endpoint list")?;
                Box::new(
                    PollEngine::new(checkpoints, rpc)
                        .with_interval(config.poll_interval)
                        .with_policy(config.checkpoint_policy),
                )
            }
        };

        tracing::info!(
            mode = ?strategy.mode(),
            endpoint = %config.primary_endpoint(),
            registry = %config.datasets_file.display(),
            grants = %config.access_db_file.display(),
            "listener configured"
        );
        Ok(Self { strategy, hooks })
    }

    /// Active transport.
    pub fn mode(&self) -> TransportMode {
        self.strategy.mode()
    }

    /// Run until the process stops.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.strategy.run(Arc::clone(&self.hooks)).await
    }

    /// One cycle (pull only).
    pub async fn run_once(&self) -> anyhow::Result<()> {
        self.strategy.run_once(Arc::clone(&self.hooks)).await
    }
}

fn checkpoint_store(config: &ListenerConfig) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    match config.checkpoint_backend {
        CheckpointBackend::Json => Ok(Arc::new(JsonCheckpointStore::new(&config.checkpoint_file))),
        #[cfg(feature = "store-sqlite")]
        CheckpointBackend::Sqlite => Ok(Arc::new(crate::store::sqlite_store::SqliteCheckpointStore::new(
            &config.checkpoint_file,
        )?)),
        #[cfg(not(feature = "store-sqlite"))]
        CheckpointBackend::Sqlite => anyhow::bail!("SQLite checkpoints need the store-sqlite feature"),
    }
}
