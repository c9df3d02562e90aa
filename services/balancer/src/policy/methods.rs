//! Per-method backend sets.
//!
//! The method table is derived from registry state and swapped atomically:
//! calls in flight keep the snapshot they loaded, updates never block them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::call::{CallArgs, RoutingKey};

use super::{BackendAddr, LatencyTable, Policy, PolicyError};

type MethodSnapshot = HashMap<String, Vec<BackendAddr>>;

/// Policy answering from a method → backends table.
///
/// Known methods get their backends ranked by observed latency and cut to
/// the fan-out width. Unknown methods have no candidates.
pub struct MethodRouter {
    snapshot: ArcSwap<MethodSnapshot>,
    width: Option<usize>,
    table: Arc<LatencyTable>,
}

impl MethodRouter {
    /// Create an empty router racing up to `width` backends per call
    /// (zero means all of a method's backends).
    pub fn new(width: usize) -> Self {
        Self::with_table(width, Arc::new(LatencyTable::new()))
    }

    /// Share an existing feedback table.
    pub fn with_table(width: usize, table: Arc<LatencyTable>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(MethodSnapshot::new()),
            width: (width > 0).then_some(width),
            table,
        }
    }

    /// Set the backends of one method.
    pub fn update(&self, method: &str, backends: Vec<BackendAddr>) {
        let backend_count = backends.len();
        self.snapshot.rcu(|current| {
            let mut next = MethodSnapshot::clone(current);
            next.insert(method.to_string(), backends.clone());
            next
        });
        debug!(method = %method, backend_count, "Method backends updated");
    }

    /// Replace the whole table in a single swap.
    pub fn replace_all(&self, methods: MethodSnapshot) {
        let method_count = methods.len();
        self.snapshot.store(Arc::new(methods));
        info!(method_count, "Method table replaced");
    }

    /// Forget a method.
    pub fn remove(&self, method: &str) {
        self.snapshot.rcu(|current| {
            let mut next = MethodSnapshot::clone(current);
            next.remove(method);
            next
        });
    }

    /// Backends currently registered for a method.
    pub fn backends(&self, method: &str) -> Option<Vec<BackendAddr>> {
        self.snapshot.load().get(method).cloned()
    }

    pub fn methods(&self) -> Vec<String> {
        self.snapshot.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

impl Policy for MethodRouter {
    fn choose_candidates(
        &self,
        key: &RoutingKey,
        _args: &CallArgs,
    ) -> Result<Vec<BackendAddr>, PolicyError> {
        let snapshot = self.snapshot.load();
        let backends = snapshot
            .get(key.as_str())
            .ok_or_else(|| PolicyError::UnknownKey(key.to_string()))?;
        if backends.is_empty() {
            return Err(PolicyError::NoBackends);
        }

        let mut ranked = self.table.rank(backends);
        if let Some(width) = self.width {
            ranked.truncate(width);
        }
        Ok(ranked)
    }

    fn register_latency(&self, backend: &BackendAddr, latency: Duration) {
        self.table.record(backend, latency);
    }

    fn name(&self) -> &'static str {
        "methods"
    }
}
