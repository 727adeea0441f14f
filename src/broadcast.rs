//! Cross-instance broadcast fan-out (§4.8).
//!
//! The adapter trait mirrors the teacher's `AgencyRuntime`-style async-trait
//! provider seams (`agent/contract/runtime.rs`: `ToolProvider`/`LLMProvider`)
//! - a small async surface a backend plugs into - while the dedupe/filter
//! pipeline is grounded on `EventEmitter`'s fail-open outcome shape
//! (`other_examples/.../emitter.rs`): a broadcast failure never blocks local
//! delivery.
//!
//! Per design note §9, the broadcast channel map is an explicit,
//! constructor-injected object (`InMemoryBroadcastHub`), never an implicit
//! process-wide global.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast as tokio_broadcast;

use crate::error::AdapterError;

/// Wire shape for a broadcast message (§6): `{broadcastId, id, source,
/// eventName, context, traceId, version, timestamp}`. JSON-safe; adapters
/// are free to choose any transport encoding on top of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub broadcast_id: String,
    pub id: String,
    pub source: String,
    pub event_name: String,
    pub context: serde_json::Value,
    pub trace_id: String,
    pub version: u32,
    pub timestamp: i64,
    /// Carries the sender's per-broadcast `excludeSelf` choice (§4.5), so
    /// self-exclusion is decided by the broadcast call that produced this
    /// message rather than by whatever a receiver happened to pass when it
    /// subscribed.
    pub exclude_self: bool,
}

/// A pluggable cross-instance transport (§4.8).
#[async_trait]
pub trait BroadcastAdapter: Send + Sync {
    async fn publish(&self, channel: &str, message: BroadcastMessage) -> Result<(), AdapterError>;

    /// Subscribe to `channel`; delivered messages are pushed to `sink`.
    async fn subscribe(
        &self,
        channel: &str,
        sink: tokio::sync::mpsc::UnboundedSender<BroadcastMessage>,
    ) -> Result<(), AdapterError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), AdapterError>;
    async fn disconnect(&self) -> Result<(), AdapterError>;

    async fn health_check(&self) -> bool {
        true
    }
}

/// A predicate run over every inbound broadcast before local delivery
/// (§4.8 "filter chain"). Returning `false` drops the message silently.
pub type BroadcastFilter = Arc<dyn Fn(&BroadcastMessage) -> bool + Send + Sync>;

/// Bookkeeping and policy layered on top of one or more [`BroadcastAdapter`]s:
/// dedup, self-exclusion, and filtering (§4.8).
pub struct BroadcastManager {
    node_id: String,
    adapters: RwLock<Vec<Arc<dyn BroadcastAdapter>>>,
    filters: RwLock<Vec<BroadcastFilter>>,
    processed: Mutex<Dedup>,
}

struct Dedup {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Dedup {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns `true` if this id is new (not previously seen), recording it.
    fn record(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

impl BroadcastManager {
    /// `max_processed_broadcasts` bounds the dedupe set's memory via FIFO
    /// eviction (§4.8).
    pub fn new(node_id: impl Into<String>, max_processed_broadcasts: usize) -> Self {
        Self {
            node_id: node_id.into(),
            adapters: RwLock::new(Vec::new()),
            filters: RwLock::new(Vec::new()),
            processed: Mutex::new(Dedup::new(max_processed_broadcasts)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn add_adapter(&self, adapter: Arc<dyn BroadcastAdapter>) {
        self.adapters.write().push(adapter);
    }

    pub fn add_filter(&self, filter: BroadcastFilter) {
        self.filters.write().push(filter);
    }

    pub fn adapters(&self) -> Vec<Arc<dyn BroadcastAdapter>> {
        self.adapters.read().clone()
    }

    /// Fan a message out to every registered adapter/channel. Per §4.8,
    /// adapter failures are collected but never prevent local emission -
    /// callers decide whether to surface them.
    pub async fn publish(
        &self,
        channels: &[String],
        message: BroadcastMessage,
    ) -> Vec<AdapterError> {
        let adapters = self.adapters.read().clone();
        let mut errors = Vec::new();
        for adapter in &adapters {
            for channel in channels {
                if let Err(e) = adapter.publish(channel, message.clone()).await {
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Decide whether an inbound broadcast should be delivered locally:
    /// dedupe by `broadcast_id`, drop self-originated messages when the
    /// sender asked for exclusion (§4.5 `excludeSelf`), then run the filter
    /// chain (§4.8).
    pub fn should_deliver(&self, message: &BroadcastMessage) -> bool {
        if !self.processed.lock().record(&message.broadcast_id) {
            return false;
        }
        if message.exclude_self && message.source == self.node_id {
            return false;
        }
        self.filters.read().iter().all(|f| f(message))
    }

    /// Number of broadcast ids currently held in the dedupe window (SPEC_FULL
    /// §3 SUPPLEMENT Diagnostics).
    pub fn dedup_size(&self) -> usize {
        self.processed.lock().seen.len()
    }
}

/// A process-local, constructor-injected channel map standing in for a real
/// network transport: every [`InMemoryBroadcastAdapter`] built from the same
/// hub can see every other's publications. Never a global singleton (§9).
#[derive(Default)]
pub struct InMemoryBroadcastHub {
    channels: RwLock<std::collections::HashMap<String, tokio_broadcast::Sender<BroadcastMessage>>>,
}

impl InMemoryBroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn channel_sender(&self, channel: &str) -> tokio_broadcast::Sender<BroadcastMessage> {
        if let Some(tx) = self.channels.read().get(channel) {
            return tx.clone();
        }
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| tokio_broadcast::channel(1024).0)
            .clone()
    }
}

/// Reference [`BroadcastAdapter`] backed by an [`InMemoryBroadcastHub`].
pub struct InMemoryBroadcastAdapter {
    hub: Arc<InMemoryBroadcastHub>,
}

impl InMemoryBroadcastAdapter {
    pub fn new(hub: Arc<InMemoryBroadcastHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl BroadcastAdapter for InMemoryBroadcastAdapter {
    async fn publish(&self, channel: &str, message: BroadcastMessage) -> Result<(), AdapterError> {
        let tx = self.hub.channel_sender(channel);
        // No subscribers is not an error: broadcast is fire-and-forget.
        let _ = tx.send(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        sink: tokio::sync::mpsc::UnboundedSender<BroadcastMessage>,
    ) -> Result<(), AdapterError> {
        let mut rx = self.hub.channel_sender(channel).subscribe();
        tokio::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if sink.send(msg).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn unsubscribe(&self, _channel: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
