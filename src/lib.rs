#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! datacoin-listener: turns DataCoin burn and redemption events into signed download grants.
//!
//! ## What you implement (or reuse)
//! - [`RegistryStore`]: the token address → dataset metadata map written by the creation workflow.
//! - [`CheckpointStore`]: one integer, the last fully processed block.
//! - [`GrantStore`]: the append-only log of issued download grants.
//! - [`LogSource`]: chain head and `eth_getLogs` access (see [`FallbackRpc`]).
//!
//! JSON-file implementations of the three stores live in [`store::json_store`], matching the files
//! the HTTP API reads. An SQLite checkpoint store is available behind the `store-sqlite` feature.
//!
//! ## What the listener does
//! - Picks **push** (WebSocket `eth_subscribe`) or **pull** (`eth_getLogs` polling) from the
//!   endpoint scheme, once, at startup.
//! - Reloads the registry every cycle so newly created tokens are picked up without a restart.
//! - Classifies `Transfer` events to the zero address and `Redeemed` events as entitlement claims.
//! - Signs a short-lived download URL for the dataset's content id and appends an [`AccessGrant`].
//!
//! ## Minimal usage
//! ```rust,no_run
//! use datacoin_listener::prelude::*;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let signer = GrantSigner::new("change-me")?;
//!     let hooks = GrantIssuer::new(
//!         JsonRegistry::new("datasets.json"),
//!         JsonGrantLog::new("db.json"),
//!         signer,
//!     );
//!     let rpc = FallbackRpc::new(["https://sepolia.base.org"])?;
//!     let engine = PollEngine::new(JsonCheckpointStore::new("lastBlock.json"), rpc);
//!     let outcome = engine.poll_once(&hooks).await?;
//!     println!("checkpoint now {}", outcome.checkpoint);
//!     Ok(())
//! }
//! ```

/// Environment-driven configuration.
pub mod config;

/// Pull strategy: checkpointed `eth_getLogs` polling with per-block fallback.
pub mod engine;

/// Event ABI, decoding, and address helpers.
pub mod events;

/// Listener Core: classification of chain events and grant issuance.
pub mod grants;

/// The seam between transport strategies and the grant logic.
pub mod hooks;

/// Strategy selection and the top-level listener.
pub mod listener;

/// Push strategy: WebSocket log subscriptions.
pub mod push;

/// Request/response chain access with endpoint fallback.
pub mod rpc;

/// Signed, expiring download URLs.
pub mod signer;

/// Persistence layer (traits, JSON files, optional SQLite).
pub mod store;

// Public re-exports
pub use config::{CheckpointBackend, ConfigError, ListenerConfig};
pub use engine::{CheckpointPolicy, PollEngine, PollOutcome};
pub use events::{ChainEvent, EventKind};
pub use grants::{classify, Classification, GrantIssuer};
pub use hooks::ListenerHooks;
pub use listener::{EventStrategy, Listener, TransportMode};
pub use push::{PushListener, SubscriptionSet};
pub use rpc::{FallbackRpc, HttpEndpoint, LogSource};
pub use signer::GrantSigner;
pub use store::json_store::{JsonCheckpointStore, JsonGrantLog, JsonRegistry};
#[cfg(feature = "store-sqlite")]
pub use store::sqlite_store::SqliteCheckpointStore;
pub use store::{AccessGrant, CheckpointStore, DatasetRecord, GrantStore, Registry, RegistryStore};

/// Convenience prelude for end users.
pub mod prelude {
    pub use crate::{
        CheckpointStore, FallbackRpc, GrantIssuer, GrantSigner, GrantStore, JsonCheckpointStore,
        JsonGrantLog, JsonRegistry, Listener, ListenerHooks, LogSource, PollEngine, RegistryStore,
    };
}
