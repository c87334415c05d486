//! Listener Core: decide whether an event is an entitlement claim and, if so, grant access.
use alloy::primitives::utils::format_units;
use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::Utc;

use crate::events::{lower_hex, ChainEvent, EventKind};
use crate::hooks::ListenerHooks;
use crate::signer::{strip_scheme, GrantSigner};
use crate::store::{AccessGrant, GrantStore, RegistryStore};

/// How an event is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Transfer to the zero address.
    Burn,
    /// `Redeemed` event.
    Redemption,
    /// Anything else, e.g. an ordinary transfer between holders.
    Ignored,
}

/// Burn iff the destination is the zero address; every redemption qualifies.
pub fn classify(event: &ChainEvent) -> Classification {
    match event.kind {
        EventKind::Transfer { to } if to == Address::ZERO => Classification::Burn,
        EventKind::Transfer { .. } => Classification::Ignored,
        EventKind::Redeemed { .. } => Classification::Redemption,
    }
}

/// Turns qualifying events into signed grants.
///
/// The registry is reloaded for every event so tokens registered after startup resolve.
/// Grant generation depends only on the record, the user and the clock, so replaying an event
/// just appends another equivalent row.
pub struct GrantIssuer<R, G> {
    registry: R,
    grants: G,
    signer: GrantSigner,
}

impl<R, G> GrantIssuer<R, G>
where
    R: RegistryStore,
    G: GrantStore,
{
    /// Issuer reading `registry`, appending to `grants`, signing with `signer`.
    pub fn new(registry: R, grants: G, signer: GrantSigner) -> Self {
        Self {
            registry,
            grants,
            signer,
        }
    }

    /// The grant store, e.g. for serving lookups.
    pub fn grants(&self) -> &G {
        &self.grants
    }

    /// Classify `event` and, if it qualifies for a registered token, append and return the grant.
    ///
    /// `Ok(None)` covers ignored transfers and events for unknown tokens.
    pub async fn issue(&self, event: &ChainEvent) -> anyhow::Result<Option<AccessGrant>> {
        let class = classify(event);
        if class == Classification::Ignored {
            tracing::trace!(token = %lower_hex(&event.contract), block = event.block_number, "ordinary transfer ignored");
            return Ok(None);
        }

        let token = lower_hex(&event.contract);
        let registry = self.registry.load_registry().await?;
        let Some(record) = registry.get(&token) else {
            tracing::debug!(token = %token, block = event.block_number, "event for token not in registry, dropped");
            return Ok(None);
        };

        let user = lower_hex(&event.user);
        let now = Utc::now();
        let download_url = self
            .signer
            .sign_url(strip_scheme(&record.content_id), &user, now)?;

        tracing::info!(
            kind = ?class,
            user = %user,
            symbol = %record.symbol,
            token = %token,
            amount = %format_units(event.amount, 18u8).unwrap_or_else(|_| event.amount.to_string()),
            block = event.block_number,
            tx = ?event.tx_hash,
            "granting download access"
        );

        let grant = AccessGrant {
            user,
            symbol: record.symbol.clone(),
            token,
            amount: event.amount.to_string(),
            download_url,
            ts: now.timestamp_millis(),
        };
        self.grants.append_grant(grant.clone()).await?;
        Ok(Some(grant))
    }
}

#[async_trait]
impl<R, G> ListenerHooks for GrantIssuer<R, G>
where
    R: RegistryStore,
    G: GrantStore,
{
    async fn targets(&self) -> anyhow::Result<Vec<Address>> {
        Ok(self.registry.load_registry().await?.targets())
    }

    async fn on_event(&self, event: ChainEvent) -> anyhow::Result<()> {
        self.issue(&event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{B256, U256};

    fn event(kind: EventKind) -> ChainEvent {
        ChainEvent {
            contract: Address::repeat_byte(1),
            kind,
            user: Address::repeat_byte(2),
            amount: U256::from(1u64),
            block_number: 1,
            tx_hash: None,
        }
    }

    #[test]
    fn transfer_to_zero_is_a_burn() {
        let ev = event(EventKind::Transfer { to: Address::ZERO });
        assert_eq!(classify(&ev), Classification::Burn);
    }

    #[test]
    fn transfer_to_holder_is_ignored() {
        let ev = event(EventKind::Transfer {
            to: Address::repeat_byte(9),
        });
        assert_eq!(classify(&ev), Classification::Ignored);
    }

    #[test]
    fn redemption_always_qualifies() {
        let ev = event(EventKind::Redeemed {
            ticker_topic: B256::ZERO,
        });
        assert_eq!(classify(&ev), Classification::Redemption);
    }
}
