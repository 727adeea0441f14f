//! The event envelope (§3 "EventContext").
//!
//! Modeled as an open record: a typed envelope of stable keys plus an
//! opaque `meta` blob (`serde_json::Value`) carried through untouched, per
//! design note §9 ("Dynamic typing of context/meta").

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// The message envelope passed through the bus and dispatcher.
///
/// `signal` is not serializable and is skipped by serde; it exists only for
/// the in-process cancellation plumbing described in §5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    /// Stable across migrations, retries, and requeues.
    pub trace_id: String,
    /// Identifier for this specific emission.
    pub id: String,
    /// Links a requeued/child context back to its originator.
    pub parent_id: Option<String>,
    pub name: String,
    /// Positive integer, default 1.
    pub version: u32,
    /// Millisecond epoch timestamp.
    pub timestamp: i64,
    /// Opaque user payload, carried through untouched.
    pub meta: serde_json::Value,

    #[serde(skip)]
    pub signal: Option<CancellationToken>,

    // Broadcast fields (§3).
    pub broadcast: bool,
    pub broadcast_id: Option<String>,
    pub broadcast_source: Option<String>,
    pub broadcast_channels: Option<Vec<String>>,
    pub exclude_self: bool,
    pub received_at: Option<i64>,

    // DLQ control fields (§3).
    pub disable_auto_dlq: bool,
    pub requeue_count: u32,
    pub max_requeue: u32,

    // Tagging support (SPEC_FULL §3 "Tag").
    pub tags: HashSet<String>,
}

impl EventContext {
    /// Construct a new, normalized context for event `name` with the given
    /// `meta` payload - step 1 of `emit` (§4.4).
    pub fn new(name: impl Into<String>, meta: serde_json::Value) -> Self {
        Self {
            trace_id: new_trace_id(),
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            name: name.into(),
            version: 1,
            timestamp: now_ms(),
            meta,
            signal: None,
            broadcast: false,
            broadcast_id: None,
            broadcast_source: None,
            broadcast_channels: None,
            exclude_self: true,
            received_at: None,
            disable_auto_dlq: false,
            requeue_count: 0,
            max_requeue: 5,
            tags: HashSet::new(),
        }
    }

    /// Normalize an externally constructed context: fill in `timestamp`,
    /// `trace_id` and `version` if they're missing/default, per §4.4 step 1.
    pub fn normalize(mut self) -> Self {
        if self.trace_id.is_empty() {
            self.trace_id = new_trace_id();
        }
        if self.timestamp == 0 {
            self.timestamp = now_ms();
        }
        if self.version == 0 {
            self.version = 1;
        }
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Build a child context for a DLQ requeue (§4.6
    /// `requeueDLQ`): bumps `requeue_count`, links `parent_id`, disables
    /// auto-DLQ re-routing, and stamps a fresh timestamp.
    pub fn requeue_child(&self, dlq_id: &str) -> Self {
        let mut child = self.clone();
        child.id = Uuid::new_v4().to_string();
        child.parent_id = Some(dlq_id.to_string());
        child.disable_auto_dlq = true;
        child.requeue_count += 1;
        child.timestamp = now_ms();
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_is_normalized() {
        let ctx = EventContext::new("order.created", serde_json::json!({"id": 1}));
        assert!(!ctx.trace_id.is_empty());
        assert_eq!(ctx.version, 1);
        assert!(ctx.timestamp > 0);
        assert_eq!(ctx.requeue_count, 0);
        assert_eq!(ctx.max_requeue, 5);
    }

    #[test]
    fn requeue_child_bumps_count_and_links_parent() {
        let ctx = EventContext::new("order.created", serde_json::json!({}));
        let child = ctx.requeue_child("dlq_abc_123");
        assert_eq!(child.parent_id.as_deref(), Some("dlq_abc_123"));
        assert_eq!(child.requeue_count, 1);
        assert!(child.disable_auto_dlq);
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_ne!(child.id, ctx.id);
    }

    #[test]
    fn tags_roundtrip() {
        let ctx = EventContext::new("x", serde_json::json!(null)).with_tag("urgent");
        assert!(ctx.has_tag("urgent"));
        assert!(!ctx.has_tag("other"));
    }
}
