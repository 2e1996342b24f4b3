// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-stage observational metrics.
//!
//! Every stage registers a fixed set of gauges and counters when it is
//! created and releases them again when it shuts down. Gauges read the live
//! stage state; nothing here is sampled or cached.

use core::fmt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

pub const GROUP: &str = "stagepool.metrics";
pub const TYPE: &str = "stages";
pub const PATH: &str = "executors";

pub const ACTIVE_TASKS: &str = "ActiveTasks";
pub const PENDING_TASKS: &str = "PendingTasks";
pub const COMPLETED_TASKS: &str = "CompletedTasks";
pub const TOTAL_BLOCKED_TASKS: &str = "TotalBlockedTasks";
pub const CURRENTLY_BLOCKED_TASKS: &str = "CurrentlyBlockedTasks";
pub const MAX_POOL_SIZE: &str = "MaxPoolSize";

/// Fully qualified metric identity:
/// `(group, type, path, pool, scope = stage name, name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricId {
    pub group: &'static str,
    pub ty: &'static str,
    pub path: &'static str,
    pub pool: String,
    pub scope: String,
    pub name: &'static str,
}

impl MetricId {
    /// The dotted rendering used by observability sinks.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "{}:{}.{}.{}.{}.{}",
            self.group, self.ty, self.path, self.pool, self.scope, self.name
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MetricKind {
    /// Reads a live value.
    Gauge,
    /// Reads a cumulative count.
    Counter,
}

/// Reads the current value of a metric.
pub type Reader = Box<dyn Fn() -> u64 + Send + Sync>;

struct MetricCell {
    kind: MetricKind,
    read: Reader,
}

/// Process-wide metric registry.
pub struct MetricsRegistry {
    cells: Mutex<HashMap<MetricId, MetricCell>>,
}

impl MetricsRegistry {
    fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: MetricId, kind: MetricKind, read: Reader) {
        let replaced = self
            .cells
            .lock()
            .insert(id.clone(), MetricCell { kind, read });
        if replaced.is_some() {
            tracing::warn!(metric = %id.render(), "metric re-registered, replacing");
        }
    }

    /// Remove a single metric. Returns `true` if it was registered.
    pub fn deregister(&self, id: &MetricId) -> bool {
        self.cells.lock().remove(id).is_some()
    }

    /// Remove every metric registered for one stage of one pool.
    pub fn deregister_scope(&self, pool: &str, scope: &str) {
        self.cells
            .lock()
            .retain(|id, _| !(id.pool == pool && id.scope == scope));
    }

    /// Read one metric.
    #[must_use]
    pub fn value(&self, id: &MetricId) -> Option<u64> {
        self.cells.lock().get(id).map(|cell| (cell.read)())
    }

    #[must_use]
    pub fn kind(&self, id: &MetricId) -> Option<MetricKind> {
        self.cells.lock().get(id).map(|cell| cell.kind)
    }

    /// Read every registered metric, keyed by rendered name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.cells
            .lock()
            .iter()
            .map(|(id, cell)| (id.render(), (cell.read)()))
            .collect()
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("len", &self.cells.lock().len())
            .finish_non_exhaustive()
    }
}

/// The process-wide registry.
pub fn registry() -> &'static MetricsRegistry {
    static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();
    REGISTRY.get_or_init(MetricsRegistry::new)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn id(pool: &str, scope: &str, name: &'static str) -> MetricId {
        MetricId {
            group: GROUP,
            ty: TYPE,
            path: PATH,
            pool: pool.to_string(),
            scope: scope.to_string(),
            name,
        }
    }

    #[test]
    fn rendering_is_the_full_tuple() {
        let id = id("pool-a", "stage-b", ACTIVE_TASKS);
        assert_eq!(
            id.render(),
            "stagepool.metrics:stages.executors.pool-a.stage-b.ActiveTasks"
        );
    }

    #[test]
    fn gauges_read_live_values() {
        let source = Arc::new(AtomicU64::new(3));
        let reader = source.clone();
        let metric = id("metrics-live", "s", PENDING_TASKS);

        registry().register(
            metric.clone(),
            MetricKind::Gauge,
            Box::new(move || reader.load(Ordering::SeqCst)),
        );

        assert_eq!(registry().value(&metric), Some(3));
        source.store(9, Ordering::SeqCst);
        assert_eq!(registry().value(&metric), Some(9));
        assert_eq!(registry().kind(&metric), Some(MetricKind::Gauge));

        assert!(registry().deregister(&metric));
        assert_eq!(registry().value(&metric), None);
    }

    #[test]
    fn deregistering_a_scope_removes_all_of_its_metrics() {
        for name in [ACTIVE_TASKS, PENDING_TASKS, COMPLETED_TASKS] {
            registry().register(
                id("metrics-scope", "doomed", name),
                MetricKind::Gauge,
                Box::new(|| 0),
            );
        }
        registry().register(
            id("metrics-scope", "survivor", ACTIVE_TASKS),
            MetricKind::Gauge,
            Box::new(|| 0),
        );

        registry().deregister_scope("metrics-scope", "doomed");

        assert_eq!(
            registry().value(&id("metrics-scope", "doomed", ACTIVE_TASKS)),
            None
        );
        assert_eq!(
            registry().value(&id("metrics-scope", "survivor", ACTIVE_TASKS)),
            Some(0)
        );
    }
}
