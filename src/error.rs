//! Structured error types for the event dispatch kernel.
//!
//! Each subsystem boundary gets its own `thiserror` enum rather than one
//! monolithic error type, so callers can match on exactly the failures that
//! subsystem can produce. See §7 of the kernel design for the propagation
//! policy: most of these never escape `emit`/`run` - they are routed to a
//! user-supplied error handler or captured in a per-handler result instead.

use std::time::Duration;
use thiserror::Error;

use crate::state_machine::TaskState;

/// Errors produced by a single [`crate::task::EventTask`] execution.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// The handler did not complete within the configured timeout.
    #[error("task timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The task was cancelled, either by the external signal or an internal
    /// composed cancellation source.
    #[error("task was cancelled")]
    Cancelled,

    /// The handler itself returned an error. Carries the last attempt's
    /// message; `attempts` counts how many times the handler was invoked.
    #[error("handler failed after {attempts} attempt(s): {message}")]
    Handler { message: String, attempts: u32 },

    /// `execute` was called on a task that is not in `pending` state.
    #[error("task is not single-shot: already started")]
    AlreadyStarted,
}

impl TaskError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

/// Errors raised while registering handlers, middleware, or migrators.
#[derive(Error, Debug, Clone)]
pub enum RegistrationError {
    #[error("event '{event}' already has {count} handlers, exceeding cap of {max}")]
    HandlerCapExceeded {
        event: String,
        count: usize,
        max: usize,
    },

    #[error("event '{event}' already has {count} middleware, exceeding cap of {max}")]
    MiddlewareCapExceeded {
        event: String,
        count: usize,
        max: usize,
    },

    #[error("invalid version {version} for event '{event}': version must be positive")]
    InvalidVersion { event: String, version: i64 },

    #[error("duplicate migrator for event '{event}' from version {from_version}")]
    DuplicateMigrator { event: String, from_version: u32 },
}

/// A fatal, fail-fast error: an illegal [`TaskState`] transition.
///
/// Per §4.1, this is a programmer error. Implementations surface it by
/// panicking at the single call site that performs transitions; it is kept
/// as an `Error` type (rather than panicking directly inside the state
/// machine) so tests can assert on it without aborting the test process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal state transition: {from:?} -> {to:?}")]
pub struct StateMachineError {
    pub from: TaskState,
    pub to: TaskState,
}

/// Errors from the [`crate::store::EventStore`] trait. Per the propagation
/// policy these are never surfaced to the caller of `emit`; they are routed
/// to the bus's error handler with discriminant `"store"`.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("record not found: trace={trace_id} id={id}")]
    NotFound { trace_id: String, id: String },

    #[error("store backend error: {message}")]
    Backend { message: String },
}

/// Errors from a [`crate::broadcast::BroadcastAdapter`]. Routed to the
/// bus's error handler with discriminant `"adapter"`.
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    #[error("adapter '{adapter}' failed to publish on channel '{channel}': {message}")]
    Publish {
        adapter: String,
        channel: String,
        message: String,
    },

    #[error("adapter '{adapter}' failed to subscribe on channel '{channel}': {message}")]
    Subscribe {
        adapter: String,
        channel: String,
        message: String,
    },

    #[error("adapter '{adapter}' health check failed: {message}")]
    Unhealthy { adapter: String, message: String },
}

/// The dependency graph contains a cycle.
#[derive(Error, Debug, Clone)]
#[error("dependency graph contains a cycle involving: {nodes:?}")]
pub struct CycleError {
    pub nodes: Vec<String>,
}

/// Errors from the dependency-injector used by the dispatcher to pass
/// results between layers.
#[derive(Error, Debug, Clone)]
pub enum InjectorError {
    #[error("result for node '{0}' was already registered (write-once)")]
    AlreadyRegistered(String),

    #[error("no result registered for node '{0}'")]
    NotFound(String),

    #[error("value at node '{node}' is not cloneable: {reason}")]
    NotCloneable { node: String, reason: String },
}

/// Top-level error returned by [`crate::bus::EventBus::emit`] when
/// `throwOnError`-equivalent behavior (`TaskOptions::throw_on_error`) is
/// set, or by the global-timeout path.
#[derive(Error, Debug, Clone)]
pub enum EmitError {
    #[error("emission exceeded global timeout of {timeout:?}")]
    GlobalTimeout { timeout: Duration },

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Error raised when the dependency dispatcher's node graph is malformed or
/// a run fails fatally.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("no handler registered for node '{0}'")]
    NoHandler(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("next() called multiple times by middleware")]
    MiddlewareDoubleNext,

    #[error(transparent)]
    Injector(#[from] InjectorError),
}
