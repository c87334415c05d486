//! Push strategy: one WebSocket connection carrying an `eth_subscribe("logs")` per token.
//!
//! Newly registered tokens are subscribed on the next refresh tick. On disconnect the
//! subscription set is cleared and rebuilt after reconnecting, with exponential backoff.
//! No checkpoint is kept; events emitted while disconnected are not replayed.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use anyhow::{anyhow, Context};
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::events::{decode_log, event_topics, lower_hex};
use crate::hooks::ListenerHooks;

/// How often the registry is re-read for new tokens.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(20);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Addresses with a live (or requested) subscription on the current connection.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    inner: Mutex<HashSet<Address>>,
}

impl SubscriptionSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address`; false if it was already present.
    pub fn insert_if_absent(&self, address: Address) -> bool {
        self.lock().insert(address)
    }

    /// Forget `address` so the next refresh retries it.
    pub fn remove(&self, address: &Address) -> bool {
        self.lock().remove(address)
    }

    /// Whether `address` is subscribed.
    pub fn contains(&self, address: &Address) -> bool {
        self.lock().contains(address)
    }

    /// Drop everything, e.g. after the connection is lost.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of subscribed addresses.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<Address>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A frame received on the subscription connection.
#[derive(Debug, Clone)]
pub enum WsMessage {
    /// Reply to an `eth_subscribe` request.
    Subscribed {
        /// Request id.
        id: u64,
        /// Server-assigned subscription id.
        subscription: String,
    },
    /// Error reply to a request.
    Rejected {
        /// Request id.
        id: u64,
        /// Server error message.
        reason: String,
    },
    /// A log notification.
    Log(Box<Log>),
    /// Anything else.
    Other,
}

/// Build the `eth_subscribe` request for one token, matching either topic.
pub fn subscribe_request(id: u64, address: &Address) -> Value {
    let topics: Vec<String> = event_topics().iter().map(|t| t.to_string()).collect();
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "eth_subscribe",
        "params": ["logs", {
            "address": lower_hex(address),
            "topics": [topics],
        }],
    })
}

/// Classify a text frame.
pub fn parse_message(text: &str) -> anyhow::Result<WsMessage> {
    let json: Value = serde_json::from_str(text).context("parse websocket frame")?;

    if let Some(id) = json.get("id").and_then(Value::as_u64) {
        if let Some(err) = json.get("error") {
            let reason = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Ok(WsMessage::Rejected { id, reason });
        }
        if let Some(subscription) = json.get("result").and_then(Value::as_str) {
            return Ok(WsMessage::Subscribed {
                id,
                subscription: subscription.to_string(),
            });
        }
    }

    if json.get("method").and_then(Value::as_str) == Some("eth_subscription") {
        if let Some(result) = json.get("params").and_then(|p| p.get("result")) {
            let log: Log =
                serde_json::from_value(result.clone()).context("parse log notification")?;
            return Ok(WsMessage::Log(Box::new(log)));
        }
    }

    Ok(WsMessage::Other)
}

/// Subscription-driven listener over a single WebSocket endpoint.
#[derive(Debug)]
pub struct PushListener {
    url: String,
    refresh: Duration,
    subscribed: SubscriptionSet,
    next_id: AtomicU64,
}

impl PushListener {
    /// Listener for the `ws://` / `wss://` endpoint at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            refresh: DEFAULT_REFRESH_INTERVAL,
            subscribed: SubscriptionSet::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Override the registry refresh interval.
    pub fn with_refresh_interval(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current subscriptions.
    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscribed
    }

    /// Connect, subscribe and dispatch forever, reconnecting with backoff.
    pub async fn run(&self, hooks: Arc<dyn ListenerHooks>) -> anyhow::Result<()> {
        tracing::info!(endpoint = %self.url, refresh = ?self.refresh, "listener running (WebSocket)");

        let mut backoff = INITIAL_BACKOFF;
        loop {
            let err = match self.session(&hooks, &mut backoff).await {
                Ok(()) => anyhow!("connection closed"),
                Err(e) => e,
            };
            self.subscribed.clear();
            tracing::error!(error = ?err, retry_in = ?backoff, "websocket session ended, reconnecting");
            time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// One connection lifetime. Resets `backoff` once connected.
    async fn session(
        &self,
        hooks: &Arc<dyn ListenerHooks>,
        backoff: &mut Duration,
    ) -> anyhow::Result<()> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("connect to {}", self.url))?;
        let (mut write, mut read) = stream.split();
        tracing::info!(endpoint = %self.url, "websocket connected");
        *backoff = INITIAL_BACKOFF;
        self.subscribed.clear();

        // request id -> address, to undo the set entry if the server refuses
        let mut pending: HashMap<u64, Address> = HashMap::new();

        let mut refresh = time::interval(self.refresh);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    self.subscribe_new(hooks.as_ref(), &mut write, &mut pending).await?;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(text.as_str(), hooks, &mut pending);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "websocket closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("websocket read"),
                    None => return Ok(()),
                },
            }
        }
    }

    /// Subscribe every target not yet in the set. Registry errors are logged and retried on
    /// the next tick; send errors end the session.
    async fn subscribe_new<S>(
        &self,
        hooks: &dyn ListenerHooks,
        write: &mut S,
        pending: &mut HashMap<u64, Address>,
    ) -> anyhow::Result<()>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let targets = match hooks.targets().await {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = ?e, "registry refresh failed");
                return Ok(());
            }
        };

        for address in targets {
            if !self.subscribed.insert_if_absent(address) {
                continue;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let request = subscribe_request(id, &address);
            write
                .send(Message::Text(request.to_string().into()))
                .await
                .context("send eth_subscribe")?;
            pending.insert(id, address);
            tracing::info!(token = %lower_hex(&address), id, "subscribing");
        }
        Ok(())
    }

    /// Apply one text frame. A decoded event is handed to the hooks on its own task, whose
    /// handle is returned.
    fn handle_text(
        &self,
        text: &str,
        hooks: &Arc<dyn ListenerHooks>,
        pending: &mut HashMap<u64, Address>,
    ) -> Option<JoinHandle<()>> {
        let message = match parse_message(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = ?e, "unparseable websocket frame");
                return None;
            }
        };

        match message {
            WsMessage::Subscribed { id, subscription } => {
                if let Some(address) = pending.remove(&id) {
                    tracing::debug!(token = %lower_hex(&address), %subscription, "subscription confirmed");
                }
            }
            WsMessage::Rejected { id, reason } => {
                if let Some(address) = pending.remove(&id) {
                    self.subscribed.remove(&address);
                    tracing::warn!(token = %lower_hex(&address), %reason, "subscription rejected, will retry");
                }
            }
            WsMessage::Log(log) if log.removed => {
                tracing::debug!(tx = ?log.transaction_hash, "reorged log ignored");
            }
            WsMessage::Log(log) => {
                let event = decode_log(&log)?;
                let hooks = Arc::clone(hooks);
                return Some(tokio::spawn(async move {
                    let block = event.block_number;
                    if let Err(e) = hooks.on_event(event).await {
                        tracing::error!(block, error = ?e, "event handling failed");
                    }
                }));
            }
            WsMessage::Other => {}
        }
        None
    }
}
