//! Pull strategy: checkpointed `eth_getLogs` polling.
//!
//! Each cycle:
//! 1) read the chain head `H`; nothing to do if `H <= checkpoint`,
//! 2) for every registered token, fetch logs in `checkpoint+1..=H`, falling back to one query
//!    per block when the range query is rejected,
//! 3) hand every decoded event to the hooks,
//! 4) persist `H` as the new checkpoint (subject to [`CheckpointPolicy`]).
use std::time::Duration;

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use anyhow::Context;
use tokio::time::{self, MissedTickBehavior};

use crate::{
    events::{decode_log, lower_hex},
    hooks::ListenerHooks,
    rpc::LogSource,
    store::CheckpointStore,
};

/// Poll interval. Shorter intervals hit public endpoint rate limits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// With no checkpoint yet, start this many blocks behind the head.
pub const START_LOOKBACK_BLOCKS: u64 = 6;

/// What to do with the checkpoint when some blocks could not be fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// Advance to the head anyway. Never stalls; a block every endpoint refuses is lost.
    #[default]
    BestEffort,
    /// Keep the old checkpoint so the whole range is retried next cycle. Can stall on a
    /// permanently broken token.
    Strict,
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Checkpoint after the cycle.
    pub checkpoint: u64,
    /// Head observed this cycle.
    pub head: u64,
    /// Range scanned, if any.
    pub scanned: Option<(u64, u64)>,
    /// Token contracts queried.
    pub targets: usize,
    /// Decoded events handed to the hooks.
    pub events: usize,
    /// Events whose hook returned an error.
    pub failed_events: usize,
    /// `(token, block)` pairs that could not be fetched from any endpoint.
    pub dropped_blocks: Vec<(Address, u64)>,
}

impl PollOutcome {
    fn idle(checkpoint: u64, head: u64) -> Self {
        Self {
            checkpoint,
            head,
            ..Default::default()
        }
    }

    /// True when the checkpoint moved this cycle.
    pub fn advanced(&self, previous: u64) -> bool {
        self.checkpoint > previous
    }
}

/// Core poller. `C` = checkpoint store, `L` = log source.
pub struct PollEngine<C, L> {
    checkpoints: C,
    source: L,
    interval: Duration,
    policy: CheckpointPolicy,
}

impl<C, L> PollEngine<C, L>
where
    C: CheckpointStore + 'static,
    L: LogSource + 'static,
{
    /// Create a new engine with a checkpoint store and a log source.
    pub fn new(checkpoints: C, source: L) -> Self {
        Self {
            checkpoints,
            source,
            interval: DEFAULT_POLL_INTERVAL,
            policy: CheckpointPolicy::default(),
        }
    }

    /// Override the poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Choose how dropped blocks affect checkpoint advancement.
    pub fn with_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Configured poll interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Load the checkpoint, initializing it to `head - START_LOOKBACK_BLOCKS` on first run.
    pub async fn checkpoint(&self) -> anyhow::Result<u64> {
        if let Some(block) = self.checkpoints.load_checkpoint().await? {
            return Ok(block);
        }
        let head = self.source.head().await.context("read chain head")?;
        let start = head.saturating_sub(START_LOOKBACK_BLOCKS);
        self.checkpoints
            .save_checkpoint(start)
            .await
            .context("persist initial checkpoint")?;
        tracing::info!(head, start, "no checkpoint found, starting behind head");
        Ok(start)
    }

    /// Run a single poll cycle.
    ///
    /// # Errors
    /// Returns an error if the head cannot be read from any endpoint, the target set cannot be
    /// loaded, or the checkpoint cannot be persisted. In each case the checkpoint is left where
    /// it was, so the next cycle retries the same range.
    pub async fn poll_once<H>(&self, hooks: &H) -> anyhow::Result<PollOutcome>
    where
        H: ListenerHooks + ?Sized,
    {
        let checkpoint = self.checkpoint().await?;
        let head = self.source.head().await.context("read chain head")?;
        if head <= checkpoint {
            return Ok(PollOutcome::idle(checkpoint, head));
        }

        let targets = hooks.targets().await.context("load target set")?;
        let (from, to) = (checkpoint + 1, head);
        let mut outcome = PollOutcome {
            checkpoint,
            head,
            scanned: Some((from, to)),
            targets: targets.len(),
            ..Default::default()
        };

        tracing::debug!(from, to, targets = targets.len(), "polling");

        for address in &targets {
            let (logs, dropped) = self.fetch_logs(*address, from, to).await;
            outcome
                .dropped_blocks
                .extend(dropped.into_iter().map(|b| (*address, b)));

            // logs for other events on the same contract decode to None
            for event in logs.iter().filter_map(decode_log) {
                outcome.events += 1;
                let block = event.block_number;
                if let Err(e) = hooks.on_event(event).await {
                    outcome.failed_events += 1;
                    tracing::error!(token = %lower_hex(address), block, error = ?e, "event handling failed");
                }
            }
        }

        if !outcome.dropped_blocks.is_empty() {
            match self.policy {
                CheckpointPolicy::Strict => {
                    tracing::warn!(
                        dropped = outcome.dropped_blocks.len(),
                        checkpoint,
                        "blocks unavailable, holding checkpoint for retry"
                    );
                    return Ok(outcome);
                }
                CheckpointPolicy::BestEffort => {
                    tracing::warn!(
                        dropped = outcome.dropped_blocks.len(),
                        head,
                        "blocks unavailable, advancing checkpoint anyway; their events are lost"
                    );
                }
            }
        }

        self.checkpoints
            .save_checkpoint(head)
            .await
            .with_context(|| format!("persist checkpoint {head}"))?;
        outcome.checkpoint = head;
        Ok(outcome)
    }

    /// Fetch `from..=to` for one token, bisecting to single blocks if the range query fails.
    /// Returns the logs retrieved and the blocks that failed individually.
    async fn fetch_logs(&self, address: Address, from: u64, to: u64) -> (Vec<Log>, Vec<u64>) {
        let err = match self.source.logs(address, from, to).await {
            Ok(logs) => return (logs, Vec::new()),
            Err(e) => e,
        };
        tracing::warn!(
            token = %lower_hex(&address),
            from,
            to,
            error = %err,
            "range query failed, falling back to per-block queries"
        );

        let mut logs = Vec::new();
        let mut dropped = Vec::new();
        for block in from..=to {
            match self.source.logs(address, block, block).await {
                Ok(found) => logs.extend(found),
                Err(e) => {
                    tracing::warn!(token = %lower_hex(&address), block, error = %e, "block skipped");
                    dropped.push(block);
                }
            }
        }
        (logs, dropped)
    }

    /// Poll immediately, then every interval, forever. Cycle errors are logged and retried.
    pub async fn poll_forever<H>(&self, hooks: &H) -> anyhow::Result<()>
    where
        H: ListenerHooks + ?Sized,
    {
        tracing::info!(interval = ?self.interval, policy = ?self.policy, "listener running (HTTP polling)");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.poll_once(hooks).await {
                Ok(outcome) => {
                    if let Some((from, to)) = outcome.scanned {
                        tracing::info!(
                            from,
                            to,
                            events = outcome.events,
                            dropped = outcome.dropped_blocks.len(),
                            checkpoint = outcome.checkpoint,
                            "poll cycle complete"
                        );
                    }
                }
                Err(e) => tracing::error!(error = ?e, "poll cycle failed"),
            }
        }
    }
}
