//! Listener glue: provide the target set and receive decoded events.
use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;

use crate::events::ChainEvent;

/// Implemented by the Listener Core; driven by whichever transport strategy is active.
#[async_trait]
pub trait ListenerHooks: Send + Sync {
    /// Token contracts to observe. Called every poll cycle / refresh tick, never cached.
    async fn targets(&self) -> anyhow::Result<Vec<Address>>;

    /// Called once per decoded event. Errors are logged by the caller and never stop the loop.
    async fn on_event(&self, event: ChainEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: ListenerHooks + ?Sized> ListenerHooks for Arc<T> {
    async fn targets(&self) -> anyhow::Result<Vec<Address>> {
        (**self).targets().await
    }

    async fn on_event(&self, event: ChainEvent) -> anyhow::Result<()> {
        (**self).on_event(event).await
    }
}
