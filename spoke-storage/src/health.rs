//! Health aggregation over the attached substrates.
//!
//! The aggregator probes every registered substrate in parallel under one
//! shared deadline and folds the results into a composite status. The
//! metadata store is mandatory: when it is down the whole backend is
//! unhealthy. The cache and object store are optional: their failure
//! downgrades the backend to degraded but requests keep being served by
//! falling through to the authoritative stores.

use crate::context::OpContext;
use crate::errors::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default shared deadline for one aggregate probe pass.
pub const DEFAULT_PROBE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Probe outcome for one substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
}

/// Composite report returned by `HealthChecker::health_check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<DependencyHealth>,
}

impl HealthReport {
    pub fn check(&self, name: &str) -> Option<&DependencyHealth> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// One probeable substrate. Implementations should answer quickly; the
/// aggregator enforces the shared deadline regardless.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(status)` for a reachable substrate (a metadata store with a
    /// dead replica reports `Degraded` here), `Err` for an unreachable
    /// one.
    async fn probe(&self, ctx: &OpContext) -> Result<HealthStatus, StorageError>;
}

struct ProbeEntry {
    probe: Arc<dyn HealthProbe>,
    required: bool,
}

/// Probes all substrates in parallel and composes the overall status.
pub struct HealthAggregator {
    probes: Vec<ProbeEntry>,
    deadline: Duration,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self {
            probes: Vec::new(),
            deadline: DEFAULT_PROBE_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// A required substrate drags the overall status to unhealthy when
    /// it fails; an optional one only degrades it.
    pub fn register(mut self, probe: Arc<dyn HealthProbe>, required: bool) -> Self {
        self.probes.push(ProbeEntry { probe, required });
        self
    }

    pub async fn check(&self, ctx: &OpContext) -> HealthReport {
        let deadline = ctx.query_deadline(self.deadline);
        let checks = futures::future::join_all(self.probes.iter().map(|entry| {
            let probe = Arc::clone(&entry.probe);
            let ctx = ctx.clone();
            async move {
                let started = Instant::now();
                let outcome = ctx.bound_within(deadline, probe.probe(&ctx)).await;
                let latency_ms = started.elapsed().as_millis() as u64;
                let (status, message) = match outcome {
                    Ok(Ok(status)) => (status, None),
                    Ok(Err(e)) => (HealthStatus::Unhealthy, Some(e.to_string())),
                    Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
                };
                DependencyHealth {
                    name: probe.name().to_string(),
                    status,
                    message,
                    latency_ms,
                    checked_at: Utc::now(),
                }
            }
        }))
        .await;

        let mut overall = HealthStatus::Healthy;
        for (entry, check) in self.probes.iter().zip(&checks) {
            match (entry.required, check.status) {
                (_, HealthStatus::Healthy) => {}
                (true, HealthStatus::Unhealthy) => overall = HealthStatus::Unhealthy,
                _ => {
                    if overall == HealthStatus::Healthy {
                        overall = HealthStatus::Degraded;
                    }
                }
            }
        }

        HealthReport {
            status: overall,
            checks,
        }
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        name: &'static str,
        outcome: Result<HealthStatus, ()>,
        delay: Duration,
    }

    #[async_trait]
    impl HealthProbe for FixedProbe {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn probe(&self, _ctx: &OpContext) -> Result<HealthStatus, StorageError> {
            tokio::time::sleep(self.delay).await;
            self.outcome
                .map_err(|_| StorageError::Unavailable(format!("{} down", self.name)))
        }
    }

    fn probe(
        name: &'static str,
        outcome: Result<HealthStatus, ()>,
    ) -> Arc<dyn HealthProbe> {
        Arc::new(FixedProbe {
            name,
            outcome,
            delay: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let agg = HealthAggregator::new()
            .register(probe("metadata", Ok(HealthStatus::Healthy)), true)
            .register(probe("object_store", Ok(HealthStatus::Healthy)), false);
        let report = agg.check(&OpContext::background()).await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_optional_failure_degrades() {
        let agg = HealthAggregator::new()
            .register(probe("metadata", Ok(HealthStatus::Healthy)), true)
            .register(probe("object_store", Err(())), false);
        let report = agg.check(&OpContext::background()).await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(
            report.check("object_store").unwrap().status,
            HealthStatus::Unhealthy
        );
        assert_eq!(
            report.check("metadata").unwrap().status,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_required_failure_is_unhealthy() {
        let agg = HealthAggregator::new()
            .register(probe("metadata", Err(())), true)
            .register(probe("cache", Ok(HealthStatus::Healthy)), false);
        let report = agg.check(&OpContext::background()).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_required_degraded_stays_degraded() {
        let agg = HealthAggregator::new()
            .register(probe("metadata", Ok(HealthStatus::Degraded)), true);
        let report = agg.check(&OpContext::background()).await;
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_slow_probe_is_cut_off_by_deadline() {
        let slow = Arc::new(FixedProbe {
            name: "metadata",
            outcome: Ok(HealthStatus::Healthy),
            delay: Duration::from_secs(10),
        });
        let agg = HealthAggregator::new()
            .with_deadline(Duration::from_millis(20))
            .register(slow, true);
        let report = agg.check(&OpContext::background()).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.check("metadata").unwrap().message.is_some());
    }
}
