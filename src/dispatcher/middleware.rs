//! Per-node middleware pipeline for the dependency dispatcher (§4.7 step 5,
//! §4.9 "MiddlewarePipeline (Dispatcher variant)").
//!
//! Mirrors `bus.rs`'s onion (`wrap_with_middleware`): outermost-registered
//! middleware runs first and last, a middleware that never calls `next()`
//! short-circuits the chain, and a `next()` called more than once is fatal.
//! Unlike the bus, where a double-`next()` is captured as that handler's
//! error, the dispatcher variant raises it as [`DispatchError::MiddlewareDoubleNext`]
//! and aborts the node's execution - per §4.7 the pipeline wraps the node's
//! entire retrying invocation, not a single handler call, so there is no
//! per-attempt result to degrade gracefully into.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::DispatchError;

pub type NodeNextFn = Arc<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, DispatchError>> + Send>>
        + Send
        + Sync,
>;

pub type NodeMiddleware = Arc<
    dyn Fn(
            serde_json::Value,
            NodeNextFn,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, DispatchError>> + Send>>
        + Send
        + Sync,
>;

/// Wraps a node's innermost action - conventionally a call into
/// `EventTask::execute` carrying the node's own retry/timeout options, per
/// §4.7 step 5 ("the innermost action is `executeWithStrategy(handler, …)`").
pub struct MiddlewarePipeline {
    middlewares: Vec<NodeMiddleware>,
}

impl MiddlewarePipeline {
    pub fn new(middlewares: Vec<NodeMiddleware>) -> Self {
        Self { middlewares }
    }

    pub async fn execute(
        &self,
        payload: serde_json::Value,
        final_action: NodeNextFn,
    ) -> Result<serde_json::Value, DispatchError> {
        let mut chain = final_action;
        for mw in self.middlewares.iter().rev() {
            let next = chain.clone();
            let mw = mw.clone();
            chain = Arc::new(move |payload| {
                let mw = mw.clone();
                let next = next.clone();
                Box::pin(async move {
                    let called = Arc::new(AtomicBool::new(false));
                    let guarded_next: NodeNextFn = {
                        let next = next.clone();
                        let called = called.clone();
                        Arc::new(move |payload| {
                            let next = next.clone();
                            let called = called.clone();
                            Box::pin(async move {
                                if called.swap(true, Ordering::SeqCst) {
                                    return Err(DispatchError::MiddlewareDoubleNext);
                                }
                                next(payload).await
                            })
                        })
                    };
                    mw(payload, guarded_next).await
                })
            });
        }
        chain(payload).await
    }
}
