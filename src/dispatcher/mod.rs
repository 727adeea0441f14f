//! DAG task dispatcher (§4.5): declare nodes and dependencies, register a
//! handler per node, then run the graph with per-node timeout/retry and
//! layer-concurrent execution.
//!
//! Grounded on the teacher's `DagExecutor`
//! (`agent/runtime/impls/dag_executor.rs`): layer-by-layer concurrent
//! execution with a completed-set gate, reworked around
//! [`crate::dispatcher::graph::DependencyGraph`]'s precomputed layers
//! instead of a polling loop, and around [`crate::task::EventTask`] for
//! each node's own timeout/retry discipline instead of a bare future.

pub mod graph;
pub mod injector;
pub mod middleware;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::lifecycle::{DispatcherHooks, LifecycleEvent, NoopHooks};
use crate::pubsub::Topic;
use crate::task::{EventTask, HandlerFn, TaskOptions};

pub use graph::{DependencyGraph, SliceMode};
pub use injector::Injector;
pub use middleware::{MiddlewarePipeline, NodeMiddleware, NodeNextFn};

/// Dispatcher-wide defaults and limits (§6).
#[derive(Clone)]
pub struct DispatcherConfig {
    /// Upper bound on concurrently running nodes within one layer. `0`
    /// means unbounded (still capped by the layer's own size).
    pub max_concurrency_per_layer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency_per_layer: 0,
        }
    }
}

struct NodeHandler {
    handler: HandlerFn<serde_json::Value, serde_json::Value>,
    options: TaskOptions,
}

/// Orchestrates a [`DependencyGraph`] of handlers, injecting each node's
/// result into the nodes that depend on it.
pub struct DependencyDispatcher {
    graph: Mutex<DependencyGraph>,
    handlers: Mutex<HashMap<String, NodeHandler>>,
    middlewares: Mutex<HashMap<String, Vec<NodeMiddleware>>>,
    injector: Mutex<Injector>,
    hooks: Arc<dyn DispatcherHooks>,
    events: Topic<LifecycleEvent>,
    config: DispatcherConfig,
}

impl DependencyDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            graph: Mutex::new(DependencyGraph::new()),
            handlers: Mutex::new(HashMap::new()),
            middlewares: Mutex::new(HashMap::new()),
            injector: Mutex::new(Injector::new()),
            hooks: Arc::new(NoopHooks),
            events: Topic::new(256),
            config,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn DispatcherHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Declare a node and its dependency names (§4.5 `add`).
    pub fn add(&self, node: impl Into<String>, deps: Vec<String>) {
        self.graph.lock().add(node, deps);
    }

    /// Register the handler a node runs once its dependencies resolve
    /// (§4.5 `handle`). The handler receives a JSON object keyed by
    /// dependency name (see [`Injector::resolve_many`]).
    pub fn handle(
        &self,
        node: impl Into<String>,
        handler: HandlerFn<serde_json::Value, serde_json::Value>,
        options: TaskOptions,
    ) {
        self.handlers
            .lock()
            .insert(node.into(), NodeHandler { handler, options });
    }

    /// Register a middleware wrapping `node`'s execution (§4.7 step 5, §4.9
    /// "MiddlewarePipeline (Dispatcher variant)"). Middlewares run in
    /// registration order, outermost first, around the node's own
    /// retry/timeout-governed invocation.
    pub fn use_middleware(&self, node: impl Into<String>, middleware: NodeMiddleware) {
        self.middlewares.lock().entry(node.into()).or_default().push(middleware);
    }

    /// Run a single node and everything it transitively depends on
    /// (§4.5 `run`).
    pub async fn run(&self, node: &str) -> Result<serde_json::Value, DispatchError> {
        if !self.graph.lock().contains(node) {
            return Err(DispatchError::UnknownNode(node.to_string()));
        }
        let layers = {
            let graph = self.graph.lock();
            graph.layered_subgraph_sort(&[node.to_string()], SliceMode::Upstream)?
        };
        self.execute_layers(layers).await?;
        self.injector.lock().resolve(node).map_err(DispatchError::from)
    }

    /// Run the whole graph, or the subgraph reachable from `roots` in
    /// `mode`, returning every executed node's result (§4.5 `runAll`).
    pub async fn run_all(
        &self,
        roots: Option<&[String]>,
        mode: SliceMode,
    ) -> Result<HashMap<String, serde_json::Value>, DispatchError> {
        let layers = {
            let graph = self.graph.lock();
            match roots {
                Some(roots) => graph.layered_subgraph_sort(roots, mode)?,
                None => graph.layered_topological_sort()?,
            }
        };
        self.execute_layers(layers.clone()).await?;
        let injector = self.injector.lock();
        let mut out = HashMap::new();
        for node in layers.into_iter().flatten() {
            if let Ok(v) = injector.resolve(&node) {
                out.insert(node, v);
            }
        }
        Ok(out)
    }

    async fn execute_layers(&self, layers: Vec<Vec<String>>) -> Result<(), DispatchError> {
        for layer in layers {
            let chunks: Vec<Vec<String>> = match self.config.max_concurrency_per_layer {
                0 => vec![layer],
                n => layer.chunks(n).map(|c| c.to_vec()).collect(),
            };
            for chunk in chunks {
                let mut futures = Vec::new();
                for node in chunk {
                    futures.push(self.execute_node(node));
                }
                for result in futures::future::join_all(futures).await {
                    result?;
                }
            }
        }
        Ok(())
    }

    async fn execute_node(&self, node: String) -> Result<(), DispatchError> {
        // Already resolved (e.g. a root injected externally before `run`) - skip.
        if self.injector.lock().has(&node) {
            return Ok(());
        }

        if !self.graph.lock().contains(&node) {
            return Err(DispatchError::UnknownNode(node));
        }
        let direct_deps = self.direct_deps(&node);

        let NodeHandler { handler, options } = {
            let mut handlers = self.handlers.lock();
            handlers
                .remove(&node)
                .ok_or_else(|| DispatchError::NoHandler(node.clone()))?
        };

        let payload = self.injector.lock().resolve_many(&direct_deps)?;

        self.hooks.on_event(LifecycleEvent::Scheduled { node: node.clone() });
        self.events.publish(LifecycleEvent::Scheduled { node: node.clone() });
        self.hooks.on_event(LifecycleEvent::Running { node: node.clone() });
        self.events.publish(LifecycleEvent::Running { node: node.clone() });

        let node_for_retry = node.clone();
        let hooks_retry = self.hooks.clone();
        let events_retry = self.events.clone();
        let mut options = options;
        let prior_on_retry = options.on_retry.take();
        options.on_retry = Some(Arc::new(move |attempt, error: &str| {
            if let Some(cb) = &prior_on_retry {
                cb(attempt, error);
            }
            hooks_retry.on_event(LifecycleEvent::Retry {
                node: node_for_retry.clone(),
                attempt,
                error: error.to_string(),
            });
            events_retry.publish(LifecycleEvent::Retry {
                node: node_for_retry.clone(),
                attempt,
                error: error.to_string(),
            });
        }));

        let node_for_timeout = node.clone();
        let hooks_timeout = self.hooks.clone();
        let events_timeout = self.events.clone();
        let prior_on_timeout = options.on_timeout.take();
        options.on_timeout = Some(Arc::new(move |timeout| {
            if let Some(cb) = &prior_on_timeout {
                cb(timeout);
            }
            hooks_timeout.on_event(LifecycleEvent::Timeout {
                node: node_for_timeout.clone(),
                timeout,
            });
            events_timeout.publish(LifecycleEvent::Timeout {
                node: node_for_timeout.clone(),
                timeout,
            });
        }));

        // The node's own retrying invocation is the innermost action the
        // middleware pipeline wraps (§4.7 step 5).
        let final_action: NodeNextFn = Arc::new(move |payload| {
            let handler = handler.clone();
            let options = options.clone();
            Box::pin(async move {
                let mut task = EventTask::new(handler, options, CancellationToken::new());
                task.execute(payload).await.map_err(DispatchError::Task)
            })
        });

        let node_middlewares = self.middlewares.lock().get(&node).cloned().unwrap_or_default();
        let pipeline = MiddlewarePipeline::new(node_middlewares);
        let result = pipeline.execute(payload, final_action).await;

        match result {
            Ok(value) => {
                self.hooks.on_event(LifecycleEvent::Completed { node: node.clone() });
                self.events.publish(LifecycleEvent::Completed { node: node.clone() });
                self.injector.lock().register(node, value)?;
                Ok(())
            }
            Err(err) => {
                self.hooks.on_event(LifecycleEvent::Failed {
                    node: node.clone(),
                    error: err.to_string(),
                });
                self.events.publish(LifecycleEvent::Failed {
                    node: node.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn direct_deps(&self, node: &str) -> Vec<String> {
        let graph = self.graph.lock();
        // DependencyGraph doesn't expose direct edges publicly beyond
        // transitive closures; recompute from the layered order isn't
        // needed here since `add` stores them directly.
        graph.direct_deps_of(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn handler_returning(value: serde_json::Value) -> HandlerFn<serde_json::Value, serde_json::Value> {
        Arc::new(move |_payload, _sig| {
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        })
    }

    #[tokio::test]
    async fn s6_diamond_executes_in_dependency_order() {
        let order = Arc::new(Mutex::new(Vec::<String>::new()));

        let dispatcher = DependencyDispatcher::new(DispatcherConfig::default());
        dispatcher.add("a", vec![]);
        dispatcher.add("b", vec!["a".to_string()]);
        dispatcher.add("c", vec!["a".to_string()]);
        dispatcher.add("d", vec!["b".to_string(), "c".to_string()]);

        for name in ["a", "b", "c", "d"] {
            let order = order.clone();
            let name_owned = name.to_string();
            let handler: HandlerFn<serde_json::Value, serde_json::Value> = Arc::new(move |_p, _sig| {
                let order = order.clone();
                let name_owned = name_owned.clone();
                Box::pin(async move {
                    order.lock().push(name_owned.clone());
                    Ok(serde_json::json!(name_owned))
                })
            });
            dispatcher.handle(name, handler, TaskOptions::default());
        }

        let results = dispatcher.run_all(None, SliceMode::Upstream).await.unwrap();
        assert_eq!(results.len(), 4);

        let seen = order.lock();
        let pos = |n: &str| seen.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[tokio::test]
    async fn run_single_node_resolves_only_its_upstream() {
        let dispatcher = DependencyDispatcher::new(DispatcherConfig::default());
        dispatcher.add("a", vec![]);
        dispatcher.add("b", vec!["a".to_string()]);
        dispatcher.add("unrelated", vec![]);

        dispatcher.handle("a", handler_returning(serde_json::json!(1)), TaskOptions::default());
        dispatcher.handle(
            "b",
            Arc::new(|payload, _sig| {
                Box::pin(async move {
                    let a = payload.get("a").cloned().unwrap_or_default();
                    Ok(serde_json::json!({ "plus_one": a }))
                })
            }),
            TaskOptions::default(),
        );
        dispatcher.handle("unrelated", handler_returning(serde_json::json!("never runs")), TaskOptions::default());

        let result = dispatcher.run("b").await.unwrap();
        assert_eq!(result, serde_json::json!({"plus_one": 1}));
    }

    #[tokio::test]
    async fn cycle_is_reported_as_dispatch_error() {
        let dispatcher = DependencyDispatcher::new(DispatcherConfig::default());
        dispatcher.add("a", vec!["b".to_string()]);
        dispatcher.add("b", vec!["a".to_string()]);
        let err = dispatcher.run_all(None, SliceMode::Upstream).await.unwrap_err();
        assert!(matches!(err, DispatchError::Cycle(_)));
    }

    #[tokio::test]
    async fn node_without_handler_errors() {
        let dispatcher = DependencyDispatcher::new(DispatcherConfig::default());
        dispatcher.add("a", vec![]);
        let err = dispatcher.run("a").await.unwrap_err();
        assert!(matches!(err, DispatchError::NoHandler(_)));
    }

    #[tokio::test]
    async fn node_middleware_wraps_execution() {
        let dispatcher = DependencyDispatcher::new(DispatcherConfig::default());
        dispatcher.add("a", vec![]);
        dispatcher.handle("a", handler_returning(serde_json::json!("ok")), TaskOptions::default());

        let trace = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let t = trace.clone();
        let mw: crate::dispatcher::NodeMiddleware = Arc::new(move |payload, next| {
            let t = t.clone();
            Box::pin(async move {
                t.lock().push("before");
                let r = next(payload).await;
                t.lock().push("after");
                r
            })
        });
        dispatcher.use_middleware("a", mw);

        let result = dispatcher.run("a").await.unwrap();
        assert_eq!(result, serde_json::json!("ok"));
        assert_eq!(trace.lock().as_slice(), &["before", "after"]);
    }

    #[tokio::test]
    async fn node_middleware_double_next_is_fatal() {
        let dispatcher = DependencyDispatcher::new(DispatcherConfig::default());
        dispatcher.add("a", vec![]);
        dispatcher.handle("a", handler_returning(serde_json::json!("ok")), TaskOptions::default());

        let double_next: crate::dispatcher::NodeMiddleware = Arc::new(|payload, next| {
            Box::pin(async move {
                let _ = next(payload.clone()).await;
                next(payload).await
            })
        });
        dispatcher.use_middleware("a", double_next);

        let err = dispatcher.run("a").await.unwrap_err();
        assert!(matches!(err, DispatchError::MiddlewareDoubleNext));
    }

    #[tokio::test]
    async fn node_retry_fires_lifecycle_hooks() {
        let dispatcher = DependencyDispatcher::new(DispatcherConfig::default());
        dispatcher.add("a", vec![]);

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let handler: HandlerFn<serde_json::Value, serde_json::Value> = Arc::new(move |_p, _sig| {
            let calls = calls2.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err("transient".to_string())
                } else {
                    Ok(serde_json::json!("ok"))
                }
            })
        });

        let mut options = TaskOptions::default();
        options.max_retries = 1;
        options.retry_delay = crate::retry::fixed(Duration::from_millis(1));

        dispatcher.handle("a", handler, options);

        let mut events = dispatcher.events();
        let result = dispatcher.run("a").await.unwrap();
        assert_eq!(result, serde_json::json!("ok"));

        let mut saw_retry = false;
        while let Ok(evt) = events.try_recv() {
            if matches!(evt, LifecycleEvent::Retry { .. }) {
                saw_retry = true;
            }
        }
        assert!(saw_retry);
    }
}
