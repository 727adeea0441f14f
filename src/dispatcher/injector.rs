//! Write-once dependency injector: carries each node's result forward to
//! the layers that depend on it (§4.5 "Injector").
//!
//! Values are `serde_json::Value`, which already rules out the
//! non-cloneable host objects and functions the specification calls out -
//! a `Value` is always structurally cloneable. Per-node `clone_strategy`
//! overrides exist for nodes that want a transform applied on every read
//! (e.g. stripping a large blob before handing it to a dependent).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::InjectorError;

pub type CloneStrategy = Arc<dyn Fn(&serde_json::Value, &str) -> serde_json::Value + Send + Sync>;

#[derive(Default)]
pub struct Injector {
    results: HashMap<String, serde_json::Value>,
    clone_strategies: HashMap<String, CloneStrategy>,
}

impl Injector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a per-path override for how `resolve` clones this node's
    /// value.
    pub fn set_clone_strategy(&mut self, node: impl Into<String>, strategy: CloneStrategy) {
        self.clone_strategies.insert(node.into(), strategy);
    }

    /// Register `node`'s result. Write-once: a second registration for the
    /// same node is an error (§4.5).
    pub fn register(&mut self, node: impl Into<String>, value: serde_json::Value) -> Result<(), InjectorError> {
        let node = node.into();
        if self.results.contains_key(&node) {
            return Err(InjectorError::AlreadyRegistered(node));
        }
        self.results.insert(node, value);
        Ok(())
    }

    /// Resolve a node's result, deep-cloned (optionally through its
    /// registered clone strategy). The strategy receives `node` as its
    /// `path` argument so it can vary its behavior by the location being
    /// resolved (§4.7 `cloneStrategy(value, path)`).
    pub fn resolve(&self, node: &str) -> Result<serde_json::Value, InjectorError> {
        let value = self
            .results
            .get(node)
            .ok_or_else(|| InjectorError::NotFound(node.to_string()))?;
        Ok(match self.clone_strategies.get(node) {
            Some(strategy) => strategy(value, node),
            None => value.clone(),
        })
    }

    /// Resolve several nodes at once, in the given order, as a JSON object
    /// keyed by node name - the shape handlers receive as their injected
    /// dependencies (§4.5).
    pub fn resolve_many(&self, nodes: &[String]) -> Result<serde_json::Value, InjectorError> {
        let mut map = serde_json::Map::new();
        for node in nodes {
            map.insert(node.clone(), self.resolve(node)?);
        }
        Ok(serde_json::Value::Object(map))
    }

    pub fn has(&self, node: &str) -> bool {
        self.results.contains_key(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_once_rejects_second_registration() {
        let mut inj = Injector::new();
        inj.register("a", serde_json::json!(1)).unwrap();
        let err = inj.register("a", serde_json::json!(2)).unwrap_err();
        assert!(matches!(err, InjectorError::AlreadyRegistered(_)));
    }

    #[test]
    fn resolve_missing_errors() {
        let inj = Injector::new();
        let err = inj.resolve("missing").unwrap_err();
        assert!(matches!(err, InjectorError::NotFound(_)));
    }

    #[test]
    fn resolve_many_builds_keyed_object() {
        let mut inj = Injector::new();
        inj.register("a", serde_json::json!(1)).unwrap();
        inj.register("b", serde_json::json!("two")).unwrap();
        let resolved = inj.resolve_many(&["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(resolved, serde_json::json!({"a": 1, "b": "two"}));
    }

    #[test]
    fn clone_strategy_overrides_plain_clone() {
        let mut inj = Injector::new();
        inj.register("a", serde_json::json!({"big": "blob", "id": 1})).unwrap();
        inj.set_clone_strategy(
            "a",
            Arc::new(|v, _path| serde_json::json!({"id": v.get("id").cloned().unwrap_or_default()})),
        );
        let resolved = inj.resolve("a").unwrap();
        assert_eq!(resolved, serde_json::json!({"id": 1}));
    }

    #[test]
    fn clone_strategy_receives_resolution_path() {
        let mut inj = Injector::new();
        inj.register("a", serde_json::json!(1)).unwrap();
        inj.set_clone_strategy(
            "a",
            Arc::new(|v, path| serde_json::json!({"path": path, "value": v})),
        );
        let resolved = inj.resolve("a").unwrap();
        assert_eq!(resolved, serde_json::json!({"path": "a", "value": 1}));
    }
}
