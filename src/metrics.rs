//! Per-operation call counters and cumulative latency.
//!
//! Cheap enough to record on every host callback; rendered as a debug map
//! through the `tsumufs.metrics` control xattr.

use std::fmt::Write as _;
use std::time::Duration;

use dashmap::DashMap;

#[derive(Debug, Default, Copy, Clone)]
struct OpMetric {
    calls: u64,
    total: Duration,
}

#[derive(Default)]
pub struct Metrics {
    ops: DashMap<&'static str, OpMetric>,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    pub fn observe(&self, op: &'static str, elapsed: Duration) {
        let mut entry = self.ops.entry(op).or_default();
        entry.calls += 1;
        entry.total += elapsed;
    }

    pub fn calls(&self, op: &str) -> u64 {
        self.ops.get(op).map(|m| m.calls).unwrap_or(0)
    }

    /// `{ 'op': mean_seconds (calls), ... }`, ops sorted by name.
    pub fn describe(&self) -> String {
        let mut entries: Vec<(&'static str, OpMetric)> =
            self.ops.iter().map(|e| (*e.key(), *e.value())).collect();
        if entries.is_empty() {
            return "{}".to_owned();
        }
        entries.sort_by_key(|(name, _)| *name);

        let mut out = String::from("{ ");
        for (idx, (name, metric)) in entries.iter().enumerate() {
            if idx > 0 {
                out.push_str(", ");
            }
            let mean = metric.total.as_secs_f64() / metric.calls as f64;
            let _ = write!(out, "'{}': {:.6} ({})", name, mean, metric.calls);
        }
        out.push_str(" }");
        out
    }
}

/// Control attribute dumping the metrics map.
pub fn register_xattrs(registry: &mut crate::xattr::XattrRegistry) {
    use crate::xattr::XattrScope;

    registry.register(
        XattrScope::Root,
        "metrics",
        Box::new(|ctx, _path| Ok(ctx.metrics.describe())),
    );
}
