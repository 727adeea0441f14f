//! HandlerRegistry: versioned handlers, migrators, middleware chains, usage
//! tracking, and registration caps (§4.3).
//!
//! Grounded on the teacher's `IntentGraph` insertion-order bookkeeping
//! (`agent/contract/graph.rs`) for the "insertion order" invariant, and on
//! its `AgencyKernel`/`AgencyRuntime` trait split for keeping pure
//! (synchronous) registry bookkeeping separate from the async dispatch path
//! in `bus.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::EventContext;
use crate::error::RegistrationError;
use crate::task::HandlerFn;

/// A handler registered under `(event_name, version)`.
#[derive(Clone)]
pub struct VersionedHandler {
    pub handler: HandlerFn<EventContext, serde_json::Value>,
    pub version: u32,
}

/// A pure context transformer, registered under `(event_name, from_version)`.
pub type Migrator = Arc<dyn Fn(EventContext) -> EventContext + Send + Sync>;

/// Onion middleware: receives the context and a `next` continuation,
/// returns the (possibly short-circuited) result.
pub type Middleware = Arc<
    dyn Fn(
            EventContext,
            NextFn,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<serde_json::Value, String>> + Send>,
        > + Send
        + Sync,
>;

pub type NextFn = Arc<
    dyn Fn(
            EventContext,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<serde_json::Value, String>> + Send>,
        > + Send
        + Sync,
>;

#[derive(Clone)]
struct Entry<T> {
    items: Vec<T>,
    last_used: Option<i64>,
    usage_count: u64,
}

impl<T> Default for Entry<T> {
    fn default() -> Self {
        Entry {
            items: Vec::new(),
            last_used: None,
            usage_count: 0,
        }
    }
}

/// Caps on the number of handlers/middleware per event (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct RegistryCaps {
    pub max_handlers_per_event: usize,
    pub max_middleware_per_event: usize,
}

impl Default for RegistryCaps {
    fn default() -> Self {
        Self {
            max_handlers_per_event: 64,
            max_middleware_per_event: 32,
        }
    }
}

/// The registry of handlers, middleware, and migrators for an [`crate::bus::EventBus`].
pub struct HandlerRegistry {
    handlers: HashMap<String, Entry<VersionedHandler>>,
    middlewares: HashMap<String, Entry<Middleware>>,
    migrators: HashMap<(String, u32), Migrator>,
    caps: RegistryCaps,
}

impl HandlerRegistry {
    pub fn new(caps: RegistryCaps) -> Self {
        Self {
            handlers: HashMap::new(),
            middlewares: HashMap::new(),
            migrators: HashMap::new(),
            caps,
        }
    }

    /// Register a handler for `name` at `version` (default 1). Insertion
    /// order within `(name, version)` is preserved.
    pub fn on(
        &mut self,
        name: &str,
        handler: HandlerFn<EventContext, serde_json::Value>,
        version: u32,
    ) -> Result<(), RegistrationError> {
        if version == 0 {
            return Err(RegistrationError::InvalidVersion {
                event: name.to_string(),
                version: 0,
            });
        }
        let entry = self.handlers.entry(name.to_string()).or_default();
        if entry.items.len() >= self.caps.max_handlers_per_event {
            return Err(RegistrationError::HandlerCapExceeded {
                event: name.to_string(),
                count: entry.items.len(),
                max: self.caps.max_handlers_per_event,
            });
        }
        entry.items.push(VersionedHandler { handler, version });
        Ok(())
    }

    /// Remove handlers for `name`. If `version` is given only handlers at
    /// that version are removed; handler identity removal (by pointer) is
    /// out of scope here since handlers are type-erased closures - callers
    /// wanting selective removal should scope by version.
    pub fn off(&mut self, name: &str, version: Option<u32>) {
        if let Some(entry) = self.handlers.get_mut(name) {
            match version {
                Some(v) => entry.items.retain(|h| h.version != v),
                None => entry.items.clear(),
            }
        }
    }

    pub fn use_middleware(&mut self, name: &str, middleware: Middleware) -> Result<(), RegistrationError> {
        let entry = self.middlewares.entry(name.to_string()).or_default();
        if entry.items.len() >= self.caps.max_middleware_per_event {
            return Err(RegistrationError::MiddlewareCapExceeded {
                event: name.to_string(),
                count: entry.items.len(),
                max: self.caps.max_middleware_per_event,
            });
        }
        entry.items.push(middleware);
        Ok(())
    }

    pub fn register_migrator(
        &mut self,
        name: &str,
        from_version: u32,
        migrator: Migrator,
    ) -> Result<(), RegistrationError> {
        let key = (name.to_string(), from_version);
        if self.migrators.contains_key(&key) {
            return Err(RegistrationError::DuplicateMigrator {
                event: name.to_string(),
                from_version,
            });
        }
        self.migrators.insert(key, migrator);
        Ok(())
    }

    /// Returns a snapshot (cloned `Arc`s, cheap) of handlers for `(name,
    /// version)`, recording usage for cleanup bookkeeping. Per §5, `emit`
    /// snapshots the registry before dispatch so concurrent `on`/`off`
    /// calls never tear a dispatch.
    pub fn get_handlers(&mut self, name: &str, version: u32) -> Vec<VersionedHandler> {
        let now = chrono::Utc::now().timestamp_millis();
        match self.handlers.get_mut(name) {
            Some(entry) => {
                let matching: Vec<_> = entry
                    .items
                    .iter()
                    .filter(|h| h.version == version)
                    .cloned()
                    .collect();
                if !matching.is_empty() {
                    entry.last_used = Some(now);
                    entry.usage_count += 1;
                }
                matching
            }
            None => Vec::new(),
        }
    }

    pub fn get_middlewares(&mut self, name: &str) -> Vec<Middleware> {
        let now = chrono::Utc::now().timestamp_millis();
        match self.middlewares.get_mut(name) {
            Some(entry) => {
                if !entry.items.is_empty() {
                    entry.last_used = Some(now);
                    entry.usage_count += 1;
                }
                entry.items.clone()
            }
            None => Vec::new(),
        }
    }

    pub fn get_latest_version(&self, name: &str) -> u32 {
        self.handlers
            .get(name)
            .and_then(|entry| entry.items.iter().map(|h| h.version).max())
            .unwrap_or(1)
    }

    /// Walk the migrator chain from `ctx.version` to the latest registered
    /// handler version for `name` (§4.3 "Migration walk"). Stops at the
    /// first missing migrator or at a version revisit (cycle guard).
    pub fn migrate_context(&self, name: &str, mut ctx: EventContext) -> EventContext {
        let latest = self.get_latest_version(name);
        let mut seen = std::collections::HashSet::new();
        seen.insert(ctx.version);
        while ctx.version < latest {
            let Some(migrator) = self.migrators.get(&(name.to_string(), ctx.version)) else {
                break;
            };
            ctx = migrator(ctx);
            if !seen.insert(ctx.version) {
                // Cycle: a migrator revisited an already-seen version.
                break;
            }
        }
        ctx
    }

    /// Remove registrations whose `last_used` is older than `threshold_ms`
    /// ago (or never used). Per §4.3 "periodic cleanup(thresholds)".
    pub fn cleanup(&mut self, threshold_ms: i64) {
        let now = chrono::Utc::now().timestamp_millis();
        self.handlers.retain(|_, entry| match entry.last_used {
            Some(last) => now - last < threshold_ms,
            None => true,
        });
        self.middlewares.retain(|_, entry| match entry.last_used {
            Some(last) => now - last < threshold_ms,
            None => true,
        });
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.get(name).map(|e| e.items.len()).unwrap_or(0)
    }

    /// Registered handler count per event name (SPEC_FULL §3 SUPPLEMENT
    /// Diagnostics).
    pub fn handler_counts(&self) -> HashMap<String, usize> {
        self.handlers.iter().map(|(name, entry)| (name.clone(), entry.items.len())).collect()
    }

    /// Registered middleware count per event name (SPEC_FULL §3 SUPPLEMENT
    /// Diagnostics).
    pub fn middleware_counts(&self) -> HashMap<String, usize> {
        self.middlewares.iter().map(|(name, entry)| (name.clone(), entry.items.len())).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(RegistryCaps::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> HandlerFn<EventContext, serde_json::Value> {
        Arc::new(|_ctx, _sig| Box::pin(async move { Ok(serde_json::json!(null)) }))
    }

    #[test]
    fn insertion_order_preserved() {
        let mut reg = HandlerRegistry::default();
        for _ in 0..3 {
            reg.on("e", noop_handler(), 1).unwrap();
        }
        assert_eq!(reg.get_handlers("e", 1).len(), 3);
    }

    #[test]
    fn handler_cap_enforced() {
        let mut reg = HandlerRegistry::new(RegistryCaps {
            max_handlers_per_event: 1,
            max_middleware_per_event: 1,
        });
        reg.on("e", noop_handler(), 1).unwrap();
        let err = reg.on("e", noop_handler(), 1).unwrap_err();
        assert!(matches!(err, RegistrationError::HandlerCapExceeded { .. }));
    }

    #[test]
    fn migration_walk_stops_at_gap() {
        let mut reg = HandlerRegistry::default();
        reg.on("e", noop_handler(), 3).unwrap();
        reg.register_migrator(
            "e",
            1,
            Arc::new(|mut c| {
                c.version = 2;
                c
            }),
        )
        .unwrap();
        // No migrator registered for version 2 -> 3: walk stops at 2.
        let ctx = EventContext::new("e", serde_json::json!(null));
        let migrated = reg.migrate_context("e", ctx);
        assert_eq!(migrated.version, 2);
    }

    #[test]
    fn migration_walk_completes_when_chain_is_full() {
        let mut reg = HandlerRegistry::default();
        reg.on("e", noop_handler(), 3).unwrap();
        reg.register_migrator(
            "e",
            1,
            Arc::new(|mut c| {
                c.version = 2;
                c
            }),
        )
        .unwrap();
        reg.register_migrator(
            "e",
            2,
            Arc::new(|mut c| {
                c.version = 3;
                c
            }),
        )
        .unwrap();
        let ctx = EventContext::new("e", serde_json::json!(null));
        let migrated = reg.migrate_context("e", ctx);
        assert_eq!(migrated.version, 3);
    }

    #[test]
    fn cleanup_removes_stale_registrations() {
        let mut reg = HandlerRegistry::default();
        reg.on("e", noop_handler(), 1).unwrap();
        reg.get_handlers("e", 1); // marks last_used = now
        reg.cleanup(-1); // threshold in the past relative to "now" marks stale
        assert_eq!(reg.handler_count("e"), 0);
    }
}
