//! Dead-letter queue operations (§4.6).
//!
//! Grounded on the `composable-rust` Postgres DLQ's status/record split
//! (`other_examples/.../dead_letter_queue.rs`), adapted to the in-process
//! [`crate::store::EventStore`] contract rather than a SQL table: DLQ
//! records are just [`EventRecord`]s with `state = DeadLetter` and a
//! derived id, stored in the same store as ordinary records.

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;

use crate::context::EventContext;
use crate::error::StoreError;
use crate::state_machine::TaskState;
use crate::store::{EventRecord, EventStore};

/// Derive the DLQ record id for an original record id, per §3:
/// `dlq_<origId>_<ts>`.
pub fn dlq_id(original_id: &str, timestamp_ms: i64) -> String {
    format!("dlq_{original_id}_{timestamp_ms}")
}

/// Move a failed [`EventRecord`] into the dead-letter queue: saves a new
/// record with `state = DeadLetter` and a derived id (§4.6 `moveToDLQ`).
pub async fn move_to_dlq(
    store: &dyn EventStore,
    mut record: EventRecord,
) -> Result<EventRecord, StoreError> {
    let ts = Utc::now().timestamp_millis();
    record.id = dlq_id(&record.id, ts);
    record.state = TaskState::DeadLetter;
    record.timestamp = ts;
    store.save(record.clone()).await?;
    Ok(record)
}

/// List dead-lettered records, optionally scoped to a trace, newest first
/// (§4.6 `listDLQ`).
pub async fn list_dlq(
    store: &dyn EventStore,
    trace_id: Option<&str>,
) -> Result<Vec<EventRecord>, StoreError> {
    let mut records = match trace_id {
        Some(t) => store.load(t).await?,
        None => store.load_all().await?,
    };
    records.retain(|r| r.state == TaskState::DeadLetter);
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(records)
}

/// Permanently remove a DLQ record, leaving a small audit trail behind in
/// the store (§4.6 `purgeDLQ`).
pub async fn purge_dlq(
    store: &dyn EventStore,
    trace_id: &str,
    dlq_record_id: &str,
    reason: &str,
) -> Result<(), StoreError> {
    store.delete(trace_id, dlq_record_id).await?;
    let audit = EventRecord {
        id: format!("audit_{dlq_record_id}"),
        trace_id: trace_id.to_string(),
        name: "dlq.purged".to_string(),
        version: 1,
        state: TaskState::Completed,
        timestamp: Utc::now().timestamp_millis(),
        context: serde_json::json!({ "purged_id": dlq_record_id, "reason": reason }),
        result: None,
        error: None,
    };
    store.save(audit).await
}

/// The shape of an emitter function the DLQ can call back into to retry a
/// dead-lettered record (`bus::EventBus::emit` or a test double).
pub type Emitter = Box<
    dyn Fn(
            String,
            EventContext,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<crate::bus::EmitResult>, String>> + Send>>
        + Send
        + Sync,
>;

/// Errors specific to the requeue operation.
#[derive(Debug, thiserror::Error)]
pub enum RequeueError {
    #[error("dlq record not found: trace={trace_id} id={dlq_id}")]
    NotFound { trace_id: String, dlq_id: String },

    #[error("dlq record exceeded max requeue attempts ({max})")]
    MaxRequeueExceeded { max: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Requeue a dead-lettered record by re-emitting it (§4.6 `requeueDLQ`).
///
/// On success (no error among the results) the original DLQ id is always
/// deleted; if the retry itself produced an error a *new* DLQ record is
/// saved for it.
pub async fn requeue_dlq(
    store: &dyn EventStore,
    trace_id: &str,
    dlq_record_id: &str,
    original_context: EventContext,
    emitter: &Emitter,
) -> Result<Vec<crate::bus::EmitResult>, RequeueError> {
    let records = store.load(trace_id).await?;
    let record = records
        .iter()
        .find(|r| r.id == dlq_record_id && r.state == TaskState::DeadLetter)
        .ok_or_else(|| RequeueError::NotFound {
            trace_id: trace_id.to_string(),
            dlq_id: dlq_record_id.to_string(),
        })?;

    if original_context.requeue_count >= original_context.max_requeue {
        return Err(RequeueError::MaxRequeueExceeded {
            max: original_context.max_requeue,
        });
    }

    let child_ctx = original_context.requeue_child(dlq_record_id);
    let name = record.name.clone();

    let results = emitter(name, child_ctx.clone())
        .await
        .map_err(|e| StoreError::Backend { message: e })?;

    let has_error = results.iter().any(|r| r.error.is_some());
    if has_error {
        let new_record = EventRecord {
            id: child_ctx.id.clone(),
            trace_id: child_ctx.trace_id.clone(),
            name: record.name.clone(),
            version: child_ctx.version,
            state: TaskState::Failed,
            timestamp: Utc::now().timestamp_millis(),
            context: serde_json::to_value(&child_ctx).unwrap_or_default(),
            result: None,
            error: Some("requeue retry still failing".to_string()),
        };
        move_to_dlq(store, new_record).await?;
    }

    store.delete(trace_id, dlq_record_id).await?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn failed_record(trace_id: &str, id: &str, name: &str) -> EventRecord {
        EventRecord {
            id: id.to_string(),
            trace_id: trace_id.to_string(),
            name: name.to_string(),
            version: 1,
            state: TaskState::Failed,
            timestamp: 1,
            context: serde_json::json!({}),
            result: None,
            error: Some("boom".to_string()),
        }
    }

    #[tokio::test]
    async fn s7_dlq_move_and_requeue() {
        let store = InMemoryStore::new();
        let moved = move_to_dlq(&store, failed_record("trace-1", "orig-1", "order.created"))
            .await
            .unwrap();
        assert!(moved.id.starts_with("dlq_orig-1_"));

        let listed = list_dlq(&store, Some("trace-1")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, moved.id);

        let ctx = EventContext::new("order.created", serde_json::json!({}));
        let ctx = EventContext { trace_id: "trace-1".to_string(), ..ctx };

        let emitter: Emitter = Box::new(|_name, _ctx| {
            Box::pin(async move {
                Ok(vec![crate::bus::EmitResult {
                    handler_index: 0,
                    state: TaskState::Completed,
                    trace_id: "trace-1".to_string(),
                    result: Some(serde_json::json!("ok")),
                    error: None,
                }])
            })
        });

        let dlq_id = moved.id.clone();
        let results = requeue_dlq(&store, "trace-1", &dlq_id, ctx, &emitter)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].error.is_none());

        let remaining = list_dlq(&store, Some("trace-1")).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn requeue_missing_record_errors() {
        let store = InMemoryStore::new();
        let ctx = EventContext::new("x", serde_json::json!({}));
        let emitter: Emitter = Box::new(|_n, _c| Box::pin(async move { Ok(vec![]) }));
        let err = requeue_dlq(&store, "trace-1", "dlq_missing", ctx, &emitter)
            .await
            .unwrap_err();
        assert!(matches!(err, RequeueError::NotFound { .. }));
    }

    #[tokio::test]
    async fn purge_leaves_audit_record() {
        let store = InMemoryStore::new();
        let moved = move_to_dlq(&store, failed_record("trace-1", "orig-1", "order.created"))
            .await
            .unwrap();
        purge_dlq(&store, "trace-1", &moved.id, "manual cleanup")
            .await
            .unwrap();
        let all = store.load("trace-1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "dlq.purged");
    }
}
