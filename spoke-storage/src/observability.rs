//! In-process operation and cache metrics.
//!
//! The core does not ship a collector; it keeps counters and latency
//! records in memory and renders them as Prometheus-style exposition text
//! for whatever scrapes the process. Every facade operation also emits a
//! structured tracing event carrying the operation, backend, outcome and
//! request id.

use crate::errors::StorageError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket upper bounds, in milliseconds.
pub const LATENCY_BUCKETS_MS: [u64; 11] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OpKey {
    operation: &'static str,
    backend: &'static str,
    outcome: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LatencyKey {
    operation: &'static str,
    backend: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheEventKey {
    level: &'static str,
    family: &'static str,
    event: &'static str,
}

#[derive(Debug, Default, Clone)]
struct LatencyRecord {
    count: u64,
    sum_ms: u64,
    buckets: [u64; LATENCY_BUCKETS_MS.len()],
}

/// Shared metric registry. One instance per storage backend, shared with
/// its cache tier and adapters.
#[derive(Debug, Default)]
pub struct StorageMetrics {
    ops: DashMap<OpKey, u64>,
    latencies: DashMap<LatencyKey, LatencyRecord>,
    cache_events: DashMap<CacheEventKey, u64>,
    unexpected: AtomicU64,
}

impl StorageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one finished operation and fold its latency into the
    /// histogram. `Internal` outcomes are additionally counted as
    /// unexpected.
    pub fn record_op(
        &self,
        operation: &'static str,
        backend: &'static str,
        outcome: &'static str,
        elapsed: Duration,
    ) {
        *self
            .ops
            .entry(OpKey {
                operation,
                backend,
                outcome,
            })
            .or_insert(0) += 1;

        let elapsed_ms = elapsed.as_millis() as u64;
        let mut record = self
            .latencies
            .entry(LatencyKey { operation, backend })
            .or_default();
        record.count += 1;
        record.sum_ms += elapsed_ms;
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if elapsed_ms <= *bound {
                record.buckets[i] += 1;
            }
        }

        if outcome == "internal" {
            self.unexpected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one cache event (`hit`, `miss`, `eviction`, `invalidation`,
    /// `error`) labeled with the cache level and key family.
    pub fn record_cache_event(
        &self,
        level: &'static str,
        family: &'static str,
        event: &'static str,
    ) {
        *self
            .cache_events
            .entry(CacheEventKey {
                level,
                family,
                event,
            })
            .or_insert(0) += 1;
    }

    pub fn op_count(&self, operation: &str, backend: &str, outcome: &str) -> u64 {
        self.ops
            .iter()
            .find(|e| {
                let k = e.key();
                k.operation == operation && k.backend == backend && k.outcome == outcome
            })
            .map(|e| *e.value())
            .unwrap_or(0)
    }

    pub fn cache_event_count(&self, level: &str, family: &str, event: &str) -> u64 {
        self.cache_events
            .iter()
            .find(|e| {
                let k = e.key();
                k.level == level && k.family == family && k.event == event
            })
            .map(|e| *e.value())
            .unwrap_or(0)
    }

    pub fn unexpected_count(&self) -> u64 {
        self.unexpected.load(Ordering::Relaxed)
    }

    /// Render every counter in Prometheus exposition format for the
    /// external collector.
    pub fn render_prometheus_text(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP spoke_storage_operations_total Operations by operation, backend and outcome\n");
        out.push_str("# TYPE spoke_storage_operations_total counter\n");
        for entry in self.ops.iter() {
            let k = entry.key();
            out.push_str(&format!(
                "spoke_storage_operations_total{{operation=\"{}\",backend=\"{}\",outcome=\"{}\"}} {}\n",
                k.operation,
                k.backend,
                k.outcome,
                entry.value()
            ));
        }

        out.push_str("# HELP spoke_storage_operation_duration_ms Operation latency in milliseconds\n");
        out.push_str("# TYPE spoke_storage_operation_duration_ms histogram\n");
        for entry in self.latencies.iter() {
            let k = entry.key();
            let rec = entry.value();
            for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
                out.push_str(&format!(
                    "spoke_storage_operation_duration_ms_bucket{{operation=\"{}\",backend=\"{}\",le=\"{}\"}} {}\n",
                    k.operation, k.backend, bound, rec.buckets[i]
                ));
            }
            out.push_str(&format!(
                "spoke_storage_operation_duration_ms_bucket{{operation=\"{}\",backend=\"{}\",le=\"+Inf\"}} {}\n",
                k.operation, k.backend, rec.count
            ));
            out.push_str(&format!(
                "spoke_storage_operation_duration_ms_sum{{operation=\"{}\",backend=\"{}\"}} {}\n",
                k.operation, k.backend, rec.sum_ms
            ));
            out.push_str(&format!(
                "spoke_storage_operation_duration_ms_count{{operation=\"{}\",backend=\"{}\"}} {}\n",
                k.operation, k.backend, rec.count
            ));
        }

        out.push_str("# HELP spoke_storage_cache_events_total Cache events by level, key family and event\n");
        out.push_str("# TYPE spoke_storage_cache_events_total counter\n");
        for entry in self.cache_events.iter() {
            let k = entry.key();
            out.push_str(&format!(
                "spoke_storage_cache_events_total{{cache_level=\"{}\",key_family=\"{}\",event=\"{}\"}} {}\n",
                k.level,
                k.family,
                k.event,
                entry.value()
            ));
        }

        out.push_str("# HELP spoke_storage_unexpected_errors_total Errors surfaced as internal\n");
        out.push_str("# TYPE spoke_storage_unexpected_errors_total counter\n");
        out.push_str(&format!(
            "spoke_storage_unexpected_errors_total {}\n",
            self.unexpected.load(Ordering::Relaxed)
        ));

        out
    }
}

/// Outcome label for a finished operation.
pub fn outcome_label<T>(result: &Result<T, StorageError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind_label(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_counter_accumulates() {
        let metrics = StorageMetrics::new();
        metrics.record_op("get_module", "hybrid", "ok", Duration::from_millis(3));
        metrics.record_op("get_module", "hybrid", "ok", Duration::from_millis(7));
        metrics.record_op("get_module", "hybrid", "not_found", Duration::from_millis(1));

        assert_eq!(metrics.op_count("get_module", "hybrid", "ok"), 2);
        assert_eq!(metrics.op_count("get_module", "hybrid", "not_found"), 1);
        assert_eq!(metrics.op_count("get_module", "hybrid", "internal"), 0);
    }

    #[test]
    fn test_internal_outcomes_count_as_unexpected() {
        let metrics = StorageMetrics::new();
        metrics.record_op("get_module", "hybrid", "internal", Duration::from_millis(1));
        assert_eq!(metrics.unexpected_count(), 1);
    }

    #[test]
    fn test_prometheus_rendering_contains_series() {
        let metrics = StorageMetrics::new();
        metrics.record_op("create_module", "filesystem", "ok", Duration::from_millis(12));
        metrics.record_cache_event("l1", "module", "hit");

        let text = metrics.render_prometheus_text();
        assert!(text.contains(
            "spoke_storage_operations_total{operation=\"create_module\",backend=\"filesystem\",outcome=\"ok\"} 1"
        ));
        assert!(text.contains(
            "spoke_storage_cache_events_total{cache_level=\"l1\",key_family=\"module\",event=\"hit\"} 1"
        ));
        assert!(text.contains("le=\"+Inf\"} 1"));
    }

    #[test]
    fn test_outcome_label() {
        let ok: Result<(), StorageError> = Ok(());
        assert_eq!(outcome_label(&ok), "ok");
        let err: Result<(), StorageError> = Err(StorageError::Canceled);
        assert_eq!(outcome_label(&err), "canceled");
    }
}
