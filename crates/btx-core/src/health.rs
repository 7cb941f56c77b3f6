//! Health gate: compare an operational snapshot against rollout thresholds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Point-in-time operational metrics, fetched fresh for every gate decision.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Fraction of failed requests (0.0..=1.0).
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    /// Fraction of the provider quota consumed (0.0..=1.0).
    pub quota_usage: f64,
}

/// One tier of limits. Every comparison is strict: a metric equal to its
/// limit is a breach.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricThresholds {
    pub max_error_rate: f64,
    pub max_p95_latency_ms: f64,
    pub max_quota_usage: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutThresholds {
    pub critical: MetricThresholds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<MetricThresholds>,
}

impl Default for RolloutThresholds {
    fn default() -> Self {
        Self {
            critical: MetricThresholds {
                max_error_rate: 0.05,
                max_p95_latency_ms: 5000.0,
                max_quota_usage: 0.90,
            },
            warning: None,
        }
    }
}

impl RolloutThresholds {
    pub fn critical(critical: MetricThresholds) -> Self {
        Self {
            critical,
            warning: None,
        }
    }

    pub fn with_warning(mut self, warning: MetricThresholds) -> Self {
        self.warning = Some(warning);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthMetric {
    ErrorRate,
    P95LatencyMs,
    QuotaUsage,
}

impl HealthMetric {
    pub fn name(self) -> &'static str {
        match self {
            HealthMetric::ErrorRate => "errorRate",
            HealthMetric::P95LatencyMs => "p95LatencyMs",
            HealthMetric::QuotaUsage => "quotaUsage",
        }
    }
}

impl fmt::Display for HealthMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breach {
    pub metric: HealthMetric,
    pub value: f64,
    pub limit: f64,
    pub severity: Severity,
}

impl Breach {
    fn describe(&self) -> String {
        format!("{} {} >= {}", self.metric, self.value, self.limit)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    /// Critical breaches, one line per metric.
    pub reasons: Vec<String>,
    /// Warning-tier breaches; recorded but never fail the gate.
    pub warnings: Vec<String>,
    pub breaches: Vec<Breach>,
}

impl HealthReport {
    pub fn breached(&self, metric: HealthMetric) -> bool {
        self.breaches
            .iter()
            .any(|b| b.metric == metric && b.severity == Severity::Critical)
    }
}

/// Evaluate `snapshot` against both threshold tiers.
///
/// Healthy iff every metric is strictly below its critical limit. NaN values
/// are treated as breaches.
pub fn is_healthy(snapshot: &HealthSnapshot, thresholds: &RolloutThresholds) -> HealthReport {
    let mut breaches = tier_breaches(snapshot, &thresholds.critical, Severity::Critical);
    if let Some(warning) = &thresholds.warning {
        // A metric already over the critical limit is reported once, as critical.
        let extra: Vec<Breach> = tier_breaches(snapshot, warning, Severity::Warning)
            .into_iter()
            .filter(|w| !breaches.iter().any(|c| c.metric == w.metric))
            .collect();
        breaches.extend(extra);
    }

    let reasons = breaches
        .iter()
        .filter(|b| b.severity == Severity::Critical)
        .map(Breach::describe)
        .collect::<Vec<_>>();
    let warnings = breaches
        .iter()
        .filter(|b| b.severity == Severity::Warning)
        .map(Breach::describe)
        .collect();

    HealthReport {
        healthy: reasons.is_empty(),
        reasons,
        warnings,
        breaches,
    }
}

fn tier_breaches(
    snapshot: &HealthSnapshot,
    limits: &MetricThresholds,
    severity: Severity,
) -> Vec<Breach> {
    [
        (
            HealthMetric::ErrorRate,
            snapshot.error_rate,
            limits.max_error_rate,
        ),
        (
            HealthMetric::P95LatencyMs,
            snapshot.p95_latency_ms,
            limits.max_p95_latency_ms,
        ),
        (
            HealthMetric::QuotaUsage,
            snapshot.quota_usage,
            limits.max_quota_usage,
        ),
    ]
    .into_iter()
    // `!(v < limit)` rather than `v >= limit` so NaN fails the check.
    .filter(|(_, value, limit)| !(value < limit))
    .map(|(metric, value, limit)| Breach {
        metric,
        value,
        limit,
        severity,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(error_rate: f64, p95: f64, quota: f64) -> HealthSnapshot {
        HealthSnapshot {
            error_rate,
            p95_latency_ms: p95,
            quota_usage: quota,
        }
    }

    #[test]
    fn all_metrics_below_limits_is_healthy() {
        let r = is_healthy(&snap(0.002, 850.0, 0.35), &RolloutThresholds::default());
        assert!(r.healthy);
        assert!(r.reasons.is_empty());
    }

    #[test]
    fn any_single_breach_is_unhealthy() {
        let t = RolloutThresholds::default();

        let r = is_healthy(&snap(0.06, 100.0, 0.1), &t);
        assert!(!r.healthy);
        assert!(r.breached(HealthMetric::ErrorRate));
        assert_eq!(r.reasons.len(), 1);
        assert!(r.reasons[0].contains("errorRate"));

        assert!(!is_healthy(&snap(0.0, 6000.0, 0.1), &t).healthy);
        assert!(!is_healthy(&snap(0.0, 100.0, 0.95), &t).healthy);
    }

    #[test]
    fn equal_to_limit_is_a_breach() {
        let t = RolloutThresholds::default();
        assert!(!is_healthy(&snap(0.05, 0.0, 0.0), &t).healthy);
        assert!(!is_healthy(&snap(0.0, 5000.0, 0.0), &t).healthy);
        assert!(!is_healthy(&snap(0.0, 0.0, 0.90), &t).healthy);
    }

    #[test]
    fn nan_is_a_breach() {
        let r = is_healthy(&snap(f64::NAN, 0.0, 0.0), &RolloutThresholds::default());
        assert!(!r.healthy);
    }

    #[test]
    fn warning_tier_does_not_fail_the_gate() {
        let t = RolloutThresholds::default().with_warning(MetricThresholds {
            max_error_rate: 0.01,
            max_p95_latency_ms: 2000.0,
            max_quota_usage: 0.75,
        });

        let r = is_healthy(&snap(0.02, 2500.0, 0.1), &t);
        assert!(r.healthy);
        assert_eq!(r.warnings.len(), 2);

        // Critical breaches are not double-reported as warnings.
        let r = is_healthy(&snap(0.07, 100.0, 0.1), &t);
        assert!(!r.healthy);
        assert!(r.warnings.is_empty());
        assert_eq!(r.breaches.len(), 1);
    }

    #[test]
    fn snapshot_uses_camel_case_wire_names() {
        let v = serde_json::to_value(snap(0.1, 2.0, 0.3)).unwrap();
        assert_eq!(
            v,
            serde_json::json!({ "errorRate": 0.1, "p95LatencyMs": 2.0, "quotaUsage": 0.3 })
        );
    }
}
