//! eventkernel - an in-process event dispatch kernel
//!
//! Typed event emissions are routed through per-event handler chains with
//! timeout/retry/cancellation discipline, optionally fanned out to other
//! instances over a pluggable broadcast transport. A separate dependency
//! dispatcher schedules named tasks in topological layers, passing results
//! from ancestors to descendants.
//!
//! # Architecture
//! - `state_machine`: per-execution status and legal transitions
//! - `task`: single handler invocation with timeout/retry/cancel
//! - `retry`: backoff strategy catalog
//! - `registry`: versioned handlers, migrators, middleware chains
//! - `store` / `dlq`: persistence interface and dead-letter handling
//! - `broadcast`: cross-instance fan-out with dedupe and filters
//! - `bus`: top-level orchestrator gluing the above
//! - `dispatcher`: DAG-scheduled task executor with result injection
//! - `pubsub` / `tag` / `lifecycle` / `diagnostics`: support services

#![deny(unsafe_code)]

pub mod broadcast;
pub mod bus;
pub mod context;
pub mod diagnostics;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod lifecycle;
pub mod pubsub;
pub mod registry;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod tag;
pub mod task;

pub use bus::{BroadcastOptions, EmitOptions, EmitResult, ErrorHandler, ErrorKind, EventBus, EventBusConfig};
pub use context::EventContext;
pub use error::{
    AdapterError, CycleError, RegistrationError, StateMachineError, StoreError, TaskError,
};
pub use state_machine::{StateMachine, TaskState};
pub use task::{EventTask, TaskOptions};

pub use dispatcher::{DependencyDispatcher, DispatcherConfig};

/// Result type returned by a single handler's execution.
pub type HandlerResult = Result<serde_json::Value, String>;
