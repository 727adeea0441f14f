//! Dispatch lifecycle hooks (§4.5, §4.7): observation points fired as a DAG
//! node moves through scheduling, execution, and completion, independent of
//! the [`crate::state_machine::TaskState`] transitions of the task driving
//! each node.
//!
//! Grounded on the teacher's `TelemetryEvent` enum
//! (`agent/contract/runtime.rs`): a closed set of phase variants rather than
//! a free-form string, observed through a trait with no-op defaults so
//! implementors only override what they care about.

use std::time::Duration;

/// One phase of a dispatcher node's lifecycle.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Scheduled { node: String },
    Running { node: String },
    Retry { node: String, attempt: u32, error: String },
    Timeout { node: String, timeout: Duration },
    Completed { node: String },
    Failed { node: String, error: String },
}

impl LifecycleEvent {
    pub fn node(&self) -> &str {
        match self {
            LifecycleEvent::Scheduled { node }
            | LifecycleEvent::Running { node }
            | LifecycleEvent::Retry { node, .. }
            | LifecycleEvent::Timeout { node, .. }
            | LifecycleEvent::Completed { node }
            | LifecycleEvent::Failed { node, .. } => node,
        }
    }
}

/// Observer for dispatcher lifecycle events. Every method has a no-op
/// default so callers only implement the phases they need.
pub trait DispatcherHooks: Send + Sync {
    fn on_scheduled(&self, _node: &str) {}
    fn on_running(&self, _node: &str) {}
    fn on_retry(&self, _node: &str, _attempt: u32, _error: &str) {}
    fn on_timeout(&self, _node: &str, _timeout: Duration) {}
    fn on_completed(&self, _node: &str) {}
    fn on_failed(&self, _node: &str, _error: &str) {}

    /// Central dispatch point; the default routes to the typed methods
    /// above, so implementors can override either this or the individual
    /// hooks.
    fn on_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Scheduled { node } => self.on_scheduled(&node),
            LifecycleEvent::Running { node } => self.on_running(&node),
            LifecycleEvent::Retry { node, attempt, error } => self.on_retry(&node, attempt, &error),
            LifecycleEvent::Timeout { node, timeout } => self.on_timeout(&node, timeout),
            LifecycleEvent::Completed { node } => self.on_completed(&node),
            LifecycleEvent::Failed { node, error } => self.on_failed(&node, &error),
        }
    }
}

/// A [`DispatcherHooks`] that does nothing; the default when a caller
/// supplies none.
#[derive(Default)]
pub struct NoopHooks;

impl DispatcherHooks for NoopHooks {}
