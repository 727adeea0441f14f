//! Point-in-time introspection snapshot (SPEC_FULL §2 AMBIENT, §4.9).
//!
//! Grounded on the teacher's `HealthStatus`/`GraphStats` pattern
//! (`agent/contract/runtime.rs`, `agent/contract/graph.rs`): a plain,
//! serializable struct a caller can poll or log, rather than a live
//! metrics registry - the crate's Non-goals exclude a full metrics layer,
//! but a cheap snapshot type is the ambient-diagnostics baseline every
//! library in this stack carries.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BusDiagnostics {
    /// Registered handler count per event name.
    pub handlers_per_event: std::collections::HashMap<String, usize>,
    /// Registered middleware count per event name.
    pub middleware_per_event: std::collections::HashMap<String, usize>,
    /// Total records currently sitting in the dead-letter queue.
    pub dlq_depth: usize,
    /// Entries currently held in the broadcast dedupe set.
    pub broadcast_dedup_size: usize,
    /// Tasks that have started but not yet reached a terminal state.
    pub in_flight_tasks: usize,
}

impl BusDiagnostics {
    pub fn is_healthy(&self) -> bool {
        self.dlq_depth == 0
    }
}
