//! EventStore: the persistence interface and its in-memory reference
//! implementation (§6).
//!
//! Grounded on the teacher's `AgencyRuntime` trait (`agent/contract/runtime.rs`):
//! an `async_trait` with a small, explicit surface, plus a health-check
//! method returning a structured status rather than a boolean.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::state_machine::TaskState;

/// One stored record of an emission's outcome (§3 "EventRecord").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub trace_id: String,
    pub name: String,
    pub version: u32,
    pub state: TaskState,
    pub timestamp: i64,
    pub context: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Health of an [`EventStore`] backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub details: Option<serde_json::Value>,
    pub message: Option<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            details: None,
            message: None,
        }
    }
}

/// The only persistence contract the core requires (§6).
///
/// `save_error_record` and `save_event_results` are optional in the
/// specification's wording; here they have default no-op implementations so
/// minimal stores don't need to implement them.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn save(&self, record: EventRecord) -> Result<(), StoreError>;
    async fn load(&self, trace_id: &str) -> Result<Vec<EventRecord>, StoreError>;
    async fn load_all(&self) -> Result<Vec<EventRecord>, StoreError>;
    async fn load_by_name(&self, name: &str) -> Result<Vec<EventRecord>, StoreError>;
    async fn load_by_time_range(&self, start: i64, end: i64) -> Result<Vec<EventRecord>, StoreError>;
    async fn delete(&self, trace_id: &str, id: &str) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy()
    }

    async fn save_error_record(
        &self,
        _error: &str,
        _context: &serde_json::Value,
        _kind: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn save_event_results(
        &self,
        _context: &serde_json::Value,
        _results: &serde_json::Value,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory reference [`EventStore`]. Non-goal: no durable persistence
/// across process crashes (§1).
#[derive(Default)]
pub struct InMemoryStore {
    records: parking_lot::RwLock<Vec<EventRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn save(&self, record: EventRecord) -> Result<(), StoreError> {
        self.records.write().push(record);
        Ok(())
    }

    async fn load(&self, trace_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.trace_id == trace_id)
            .cloned()
            .collect())
    }

    async fn load_all(&self) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.records.read().clone())
    }

    async fn load_by_name(&self, name: &str) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect())
    }

    async fn load_by_time_range(&self, start: i64, end: i64) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect())
    }

    async fn delete(&self, trace_id: &str, id: &str) -> Result<(), StoreError> {
        let mut guard = self.records.write();
        let before = guard.len();
        guard.retain(|r| !(r.trace_id == trace_id && r.id == id));
        if guard.len() == before {
            return Err(StoreError::NotFound {
                trace_id: trace_id.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.records.write().clear();
        Ok(())
    }
}
