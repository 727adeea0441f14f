//! EventBus: the top-level orchestrator (§4.4, §4.5).
//!
//! Grounded on the teacher's `AgencyRuntime` provider-seam style
//! (`agent/contract/runtime.rs`) for the store/adapter dependency shape, and
//! on `RetryLLM`/`ResilientLLM`'s wrapper-around-a-trait-object pattern
//! (`agent/runtime/impls/retry.rs`) for composing per-handler `EventTask`
//! execution with a middleware onion on top.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastAdapter, BroadcastManager, BroadcastMessage};
use crate::context::EventContext;
use crate::diagnostics::BusDiagnostics;
use crate::dlq;
use crate::error::{EmitError, RegistrationError, StoreError, TaskError};
use crate::registry::{HandlerRegistry, Middleware, Migrator, NextFn, RegistryCaps};
use crate::state_machine::TaskState;
use crate::store::{EventRecord, EventStore};
use crate::task::{EventTask, HandlerFn, TaskOptions};

/// Discriminant tag for errors routed through [`ErrorHandler`] rather than
/// surfaced to the caller of `emit` (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Store,
    Adapter,
    Broadcast,
    Handler,
    Middleware,
    Migrator,
    Cleanup,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Store => "store",
            ErrorKind::Adapter => "adapter",
            ErrorKind::Broadcast => "broadcast",
            ErrorKind::Handler => "handler",
            ErrorKind::Middleware => "middleware",
            ErrorKind::Migrator => "migrator",
            ErrorKind::Cleanup => "cleanup",
        }
    }
}

/// A user-supplied sink for non-fatal errors (§7). Per the propagation
/// policy, a panic inside this callback is caught and logged rather than
/// allowed to break dispatch.
pub type ErrorHandler = Arc<dyn Fn(ErrorKind, &str) + Send + Sync>;

fn invoke_error_handler(handler: &Option<ErrorHandler>, kind: ErrorKind, message: &str) {
    let Some(handler) = handler else { return };
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(kind, message)));
    if result.is_err() {
        error!(kind = kind.as_str(), "error handler itself panicked; continuing");
    }
}

/// Per-emission scheduling knobs (§6).
#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub global_timeout: Option<Duration>,
    pub parallel: bool,
    pub stop_on_error: bool,
    pub max_concurrency: usize,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            global_timeout: None,
            parallel: false,
            stop_on_error: false,
            max_concurrency: 1,
        }
    }
}

/// Broadcast fan-out selection (§4.5).
#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    pub channels: Vec<String>,
    /// Whether a node subscribed to one of `channels` should skip delivering
    /// this broadcast back to itself. Stamped onto the outgoing
    /// [`BroadcastMessage`] and enforced on the receiving end by
    /// [`crate::broadcast::BroadcastManager::should_deliver`].
    pub exclude_self: bool,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            channels: vec!["default".to_string()],
            exclude_self: true,
        }
    }
}

/// One handler's outcome within an emission (§3, §8 invariant 1).
#[derive(Debug, Clone)]
pub struct EmitResult {
    pub handler_index: usize,
    pub state: TaskState,
    pub trace_id: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct EventBusConfig {
    pub caps: RegistryCaps,
    pub max_processed_broadcasts: usize,
    pub node_id: Option<String>,
    pub error_handler: Option<ErrorHandler>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            caps: RegistryCaps::default(),
            max_processed_broadcasts: 10_000,
            node_id: None,
            error_handler: None,
        }
    }
}

fn generate_node_id() -> String {
    format!("node_{}_{}", Uuid::new_v4().simple(), Utc::now().timestamp_millis())
}

/// The kernel's single entry point: registration, emission, broadcast, and
/// the glue between them.
pub struct EventBus {
    registry: parking_lot::Mutex<HandlerRegistry>,
    store: Arc<dyn EventStore>,
    broadcast: BroadcastManager,
    node_id: String,
    error_handler: Option<ErrorHandler>,
    in_flight: AtomicUsize,
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>, config: EventBusConfig) -> Self {
        let node_id = config.node_id.clone().unwrap_or_else(generate_node_id);
        Self {
            registry: parking_lot::Mutex::new(HandlerRegistry::new(config.caps)),
            store,
            broadcast: BroadcastManager::new(node_id.clone(), config.max_processed_broadcasts),
            node_id,
            error_handler: config.error_handler,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn on(
        &self,
        name: &str,
        handler: HandlerFn<EventContext, serde_json::Value>,
        version: u32,
    ) -> Result<(), RegistrationError> {
        self.registry.lock().on(name, handler, version)
    }

    pub fn off(&self, name: &str, version: Option<u32>) {
        self.registry.lock().off(name, version);
    }

    pub fn use_middleware(&self, name: &str, middleware: Middleware) -> Result<(), RegistrationError> {
        self.registry.lock().use_middleware(name, middleware)
    }

    pub fn register_migrator(
        &self,
        name: &str,
        from_version: u32,
        migrator: Migrator,
    ) -> Result<(), RegistrationError> {
        self.registry.lock().register_migrator(name, from_version, migrator)
    }

    pub fn cleanup_registrations(&self, threshold_ms: i64) {
        self.registry.lock().cleanup(threshold_ms);
    }

    pub fn add_broadcast_adapter(&self, adapter: Arc<dyn BroadcastAdapter>) {
        self.broadcast.add_adapter(adapter);
    }

    pub fn add_broadcast_filter(&self, filter: crate::broadcast::BroadcastFilter) {
        self.broadcast.add_filter(filter);
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// A point-in-time snapshot across the registry, store, and broadcast
    /// manager (SPEC_FULL §3 SUPPLEMENT Diagnostics). Async because the DLQ
    /// depth is read from `self.store`.
    pub async fn diagnostics(&self) -> BusDiagnostics {
        let (handlers_per_event, middleware_per_event) = {
            let reg = self.registry.lock();
            (reg.handler_counts(), reg.middleware_counts())
        };
        let dlq_depth = dlq::list_dlq(self.store.as_ref(), None).await.map(|records| records.len()).unwrap_or(0);
        BusDiagnostics {
            handlers_per_event,
            middleware_per_event,
            dlq_depth,
            broadcast_dedup_size: self.broadcast.dedup_size(),
            in_flight_tasks: self.in_flight.load(Ordering::SeqCst),
        }
    }

    /// `emit(name, ctx, taskOptions?, emitOptions?)` (§4.4).
    pub async fn emit(
        &self,
        name: &str,
        ctx: EventContext,
        task_options: Option<TaskOptions>,
        emit_options: Option<EmitOptions>,
    ) -> Result<Vec<EmitResult>, EmitError> {
        let emit_options = emit_options.unwrap_or_default();
        let task_options = task_options.unwrap_or_default();

        // Steps 1-3: normalize, migrate, resolve.
        let ctx = ctx.normalize();
        let ctx = self.registry.lock().migrate_context(name, ctx);

        let (handlers, middlewares) = {
            let mut reg = self.registry.lock();
            (reg.get_handlers(name, ctx.version), reg.get_middlewares(name))
        };

        if handlers.is_empty() {
            return Ok(Vec::new());
        }

        let run = self.run_handlers(handlers, middlewares, &ctx, &task_options, &emit_options);

        let results = match emit_options.global_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(r) => r?,
                Err(_) => return Err(EmitError::GlobalTimeout { timeout }),
            },
            None => run.await?,
        };

        // Steps 6-7: persist and DLQ-route.
        for result in &results {
            self.persist_result(name, &ctx, result).await;
            if result.error.is_some() && !ctx.disable_auto_dlq {
                self.route_to_dlq(name, &ctx, result).await;
            }
        }

        Ok(results)
    }

    async fn run_handlers(
        &self,
        handlers: Vec<crate::registry::VersionedHandler>,
        middlewares: Vec<Middleware>,
        ctx: &EventContext,
        task_options: &TaskOptions,
        emit_options: &EmitOptions,
    ) -> Result<Vec<EmitResult>, TaskError> {
        let count = handlers.len();
        self.in_flight.fetch_add(count, Ordering::SeqCst);
        let outcome = if emit_options.parallel {
            self.run_parallel(handlers, middlewares, ctx, task_options, emit_options).await
        } else {
            self.run_serial(handlers, middlewares, ctx, task_options, emit_options).await
        };
        self.in_flight.fetch_sub(count, Ordering::SeqCst);
        outcome
    }

    async fn run_serial(
        &self,
        handlers: Vec<crate::registry::VersionedHandler>,
        middlewares: Vec<Middleware>,
        ctx: &EventContext,
        task_options: &TaskOptions,
        emit_options: &EmitOptions,
    ) -> Result<Vec<EmitResult>, TaskError> {
        let mut results = Vec::with_capacity(handlers.len());
        for (idx, vh) in handlers.into_iter().enumerate() {
            let result = execute_one(idx, vh.handler, middlewares.clone(), ctx.clone(), task_options.clone(), self.error_handler.clone()).await?;
            let had_error = result.error.is_some();
            results.push(result);
            if had_error && emit_options.stop_on_error {
                break;
            }
        }
        Ok(results)
    }

    async fn run_parallel(
        &self,
        handlers: Vec<crate::registry::VersionedHandler>,
        middlewares: Vec<Middleware>,
        ctx: &EventContext,
        task_options: &TaskOptions,
        emit_options: &EmitOptions,
    ) -> Result<Vec<EmitResult>, TaskError> {
        let concurrency = emit_options.max_concurrency.max(1);
        let stop = Arc::new(AtomicBool::new(false));
        let mut results = Vec::with_capacity(handlers.len());

        let indexed: Vec<(usize, crate::registry::VersionedHandler)> = handlers.into_iter().enumerate().collect();
        for chunk in indexed.chunks(concurrency) {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let futures = chunk.iter().map(|(idx, vh)| {
                execute_one(*idx, vh.handler.clone(), middlewares.clone(), ctx.clone(), task_options.clone(), self.error_handler.clone())
            });
            let chunk_results = futures::future::join_all(futures).await;
            for r in chunk_results {
                let r = r?;
                if r.error.is_some() && emit_options.stop_on_error {
                    stop.store(true, Ordering::SeqCst);
                }
                results.push(r);
            }
        }

        results.sort_by_key(|r| r.handler_index);
        Ok(results)
    }

    async fn persist_result(&self, name: &str, ctx: &EventContext, result: &EmitResult) {
        let record = EventRecord {
            id: format!("{}_{}", ctx.id, result.handler_index),
            trace_id: ctx.trace_id.clone(),
            name: name.to_string(),
            version: ctx.version,
            state: result.state,
            timestamp: Utc::now().timestamp_millis(),
            context: serde_json::to_value(ctx).unwrap_or_default(),
            result: result.result.clone(),
            error: result.error.clone(),
        };
        if let Err(e) = self.store.save(record).await {
            self.report_store_error(e);
        }
    }

    async fn route_to_dlq(&self, name: &str, ctx: &EventContext, result: &EmitResult) {
        let record = EventRecord {
            id: format!("{}_{}", ctx.id, result.handler_index),
            trace_id: ctx.trace_id.clone(),
            name: name.to_string(),
            version: ctx.version,
            state: TaskState::Failed,
            timestamp: Utc::now().timestamp_millis(),
            context: serde_json::to_value(ctx).unwrap_or_default(),
            result: None,
            error: result.error.clone(),
        };
        if let Err(e) = dlq::move_to_dlq(self.store.as_ref(), record).await {
            self.report_store_error(e);
        }
    }

    fn report_store_error(&self, err: StoreError) {
        warn!(error = %err, "store operation failed");
        invoke_error_handler(&self.error_handler, ErrorKind::Store, &err.to_string());
    }

    /// `broadcast(name, ctx, broadcastOptions, emitOptions)` (§4.5): local
    /// emit first, then fire-and-forget adapter fan-out.
    pub async fn broadcast(
        &self,
        name: &str,
        ctx: EventContext,
        broadcast_options: Option<BroadcastOptions>,
        task_options: Option<TaskOptions>,
        emit_options: Option<EmitOptions>,
    ) -> Result<Vec<EmitResult>, EmitError> {
        let broadcast_options = broadcast_options.unwrap_or_default();
        let local_results = self.emit(name, ctx.clone(), task_options, emit_options).await?;

        let message = BroadcastMessage {
            broadcast_id: Uuid::new_v4().to_string(),
            id: ctx.id.clone(),
            source: self.node_id.clone(),
            event_name: name.to_string(),
            context: serde_json::to_value(&ctx).unwrap_or_default(),
            trace_id: ctx.trace_id.clone(),
            version: ctx.version,
            timestamp: Utc::now().timestamp_millis(),
            exclude_self: broadcast_options.exclude_self,
        };

        let errors = self.broadcast.publish(&broadcast_options.channels, message).await;
        for e in errors {
            warn!(error = %e, "broadcast adapter publish failed");
            invoke_error_handler(&self.error_handler, ErrorKind::Adapter, &e.to_string());
        }

        Ok(local_results)
    }

    /// Subscribe every registered adapter to `channels`, delivering
    /// accepted inbound messages as local emissions (§4.5
    /// `subscribeBroadcast`). Requires `self: Arc<Self>` since delivery runs
    /// on a spawned background task for the lifetime of the subscription.
    /// Self-exclusion is decided per message by the sender's `BroadcastOptions`
    /// (carried on the wire), not by this call.
    pub async fn subscribe_broadcast(
        self: &Arc<Self>,
        channels: &[String],
    ) -> Result<(), crate::error::AdapterError> {
        for adapter in self.broadcast.adapters() {
            for channel in channels {
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
                adapter.subscribe(channel, tx).await?;
                let bus = self.clone();
                tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        bus.handle_inbound_broadcast(message).await;
                    }
                });
            }
        }
        Ok(())
    }

    async fn handle_inbound_broadcast(&self, message: BroadcastMessage) {
        if !self.broadcast.should_deliver(&message) {
            return;
        }
        let Ok(mut ctx) = serde_json::from_value::<EventContext>(message.context.clone()) else {
            warn!("dropping broadcast message with unparseable context");
            return;
        };
        ctx.broadcast = true;
        ctx.broadcast_source = Some(message.source.clone());
        ctx.broadcast_id = Some(message.broadcast_id.clone());
        ctx.received_at = Some(Utc::now().timestamp_millis());

        if let Err(e) = self.emit(&message.event_name, ctx, None, None).await {
            warn!(error = %e, "inbound broadcast emission failed");
            invoke_error_handler(&self.error_handler, ErrorKind::Broadcast, &e.to_string());
        }
    }
}

/// Invoke handler `idx` through its middleware chain, wrapped in an
/// [`EventTask`] for timeout/retry/cancellation discipline.
async fn execute_one(
    idx: usize,
    handler: HandlerFn<EventContext, serde_json::Value>,
    middlewares: Vec<Middleware>,
    ctx: EventContext,
    task_options: TaskOptions,
    error_handler: Option<ErrorHandler>,
) -> Result<EmitResult, TaskError> {
    let throw_on_error = task_options.throw_on_error;
    let signal = ctx.signal.clone().unwrap_or_else(tokio_util::sync::CancellationToken::new);
    let trace_id = ctx.trace_id.clone();
    let chained = wrap_with_middleware(handler, middlewares, error_handler);

    let mut task = EventTask::new(chained, task_options, signal);
    match task.execute(ctx).await {
        Ok(value) => Ok(EmitResult {
            handler_index: idx,
            state: task.state(),
            trace_id,
            result: Some(value),
            error: None,
        }),
        Err(err) => {
            if throw_on_error {
                return Err(err);
            }
            Ok(EmitResult {
                handler_index: idx,
                state: task.state(),
                trace_id,
                result: None,
                error: Some(err.to_string()),
            })
        }
    }
}

/// Build the onion described in §4.4 step 4: `middleware[0]` runs first
/// before and last after; a middleware that never calls `next()`
/// short-circuits the chain. Calling `next()` more than once per
/// invocation is reported as this handler's error, per invariant 9.
fn wrap_with_middleware(
    handler: HandlerFn<EventContext, serde_json::Value>,
    middlewares: Vec<Middleware>,
    error_handler: Option<ErrorHandler>,
) -> HandlerFn<EventContext, serde_json::Value> {
    Arc::new(move |ctx, token| {
        let handler = handler.clone();
        let middlewares = middlewares.clone();
        let error_handler = error_handler.clone();
        Box::pin(async move {
            let final_handler = handler.clone();
            let token_for_final = token.clone();
            let final_next: NextFn = Arc::new(move |ctx| {
                let final_handler = final_handler.clone();
                let token = token_for_final.clone();
                Box::pin(async move { (final_handler)(ctx, token).await })
            });

            let mut chain: NextFn = final_next;
            for mw in middlewares.into_iter().rev() {
                let next = chain.clone();
                let error_handler = error_handler.clone();
                // A fresh guard per chain invocation (not per middleware
                // registration): the same middleware runs once per retry
                // attempt, and each attempt gets its own "called" budget.
                chain = Arc::new(move |ctx| {
                    let mw = mw.clone();
                    let next = next.clone();
                    let error_handler = error_handler.clone();
                    Box::pin(async move {
                        let called = Arc::new(AtomicBool::new(false));
                        let guarded_next: NextFn = {
                            let next = next.clone();
                            let called = called.clone();
                            Arc::new(move |ctx| {
                                let next = next.clone();
                                let called = called.clone();
                                Box::pin(async move {
                                    if called.swap(true, Ordering::SeqCst) {
                                        return Err("next() called multiple times by middleware".to_string());
                                    }
                                    next(ctx).await
                                })
                            })
                        };
                        let result = mw(ctx, guarded_next).await;
                        if let Err(ref e) = result {
                            invoke_error_handler(&error_handler, ErrorKind::Middleware, e);
                        }
                        result
                    })
                });
            }
            chain(ctx).await
        })
    })
}
