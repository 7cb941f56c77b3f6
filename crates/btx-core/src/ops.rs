//! In-process operational metrics over model calls.
//!
//! Feeds `GET /api/admin/status` and serves as the metrics source for
//! rollouts started from the admin API.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{health::HealthSnapshot, ports::MetricsSource, Result};

pub const DEFAULT_METRICS_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_QUOTA_PER_HOUR: u64 = 1000;

const QUOTA_PERIOD: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug)]
struct Sample {
    at: Instant,
    latency_ms: f64,
    ok: bool,
}

/// Rolling window of model-call samples.
///
/// Error rate and p95 are computed over `window`; quota usage counts every
/// call in the last hour against `quota_per_hour`.
pub struct OpsMetrics {
    window: Duration,
    quota_per_hour: u64,
    samples: Mutex<VecDeque<Sample>>,
}

impl Default for OpsMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_WINDOW, DEFAULT_QUOTA_PER_HOUR)
    }
}

impl OpsMetrics {
    pub fn new(window: Duration, quota_per_hour: u64) -> Self {
        Self {
            window,
            quota_per_hour,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_call(&self, latency: Duration, ok: bool) {
        self.record_call_at(latency, ok, Instant::now());
    }

    pub fn record_call_at(&self, latency: Duration, ok: bool, now: Instant) {
        let mut samples = match self.samples.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        samples.push_back(Sample {
            at: now,
            latency_ms: latency.as_secs_f64() * 1000.0,
            ok,
        });
        let retain = self.window.max(QUOTA_PERIOD);
        while let Some(front) = samples.front() {
            if now.saturating_duration_since(front.at) > retain {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> HealthSnapshot {
        let samples = match self.samples.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let in_window = |s: &&Sample| now.saturating_duration_since(s.at) <= self.window;
        let total = samples.iter().filter(in_window).count();
        let failed = samples.iter().filter(in_window).filter(|s| !s.ok).count();
        let mut latencies: Vec<f64> = samples
            .iter()
            .filter(in_window)
            .map(|s| s.latency_ms)
            .collect();
        let last_hour = samples
            .iter()
            .filter(|s| now.saturating_duration_since(s.at) <= QUOTA_PERIOD)
            .count();

        let error_rate = if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        };
        let quota_usage = if self.quota_per_hour == 0 {
            0.0
        } else {
            last_hour as f64 / self.quota_per_hour as f64
        };

        HealthSnapshot {
            error_rate,
            p95_latency_ms: percentile(&mut latencies, 95.0),
            quota_usage,
        }
    }

    pub fn sample_count(&self) -> usize {
        match self.samples.lock() {
            Ok(g) => g.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Nearest-rank percentile; 0.0 for an empty set.
fn percentile(values: &mut [f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = ((pct / 100.0) * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

#[async_trait]
impl MetricsSource for OpsMetrics {
    async fn fetch_health_snapshot(&self) -> Result<HealthSnapshot> {
        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_is_all_zero() {
        let m = OpsMetrics::default();
        let s = m.snapshot();
        assert_eq!(s.error_rate, 0.0);
        assert_eq!(s.p95_latency_ms, 0.0);
        assert_eq!(s.quota_usage, 0.0);
    }

    #[test]
    fn error_rate_and_p95() {
        let m = OpsMetrics::new(Duration::from_secs(300), 100);
        let now = Instant::now();
        for i in 1..=20u64 {
            m.record_call_at(Duration::from_millis(i * 100), i != 20, now);
        }
        let s = m.snapshot_at(now);
        assert!((s.error_rate - 0.05).abs() < 1e-9);
        // 95th of 20 samples by nearest rank is the 19th.
        assert_eq!(s.p95_latency_ms, 1900.0);
        assert!((s.quota_usage - 0.2).abs() < 1e-9);
    }

    #[test]
    fn old_samples_leave_the_window_but_count_toward_quota() {
        let m = OpsMetrics::new(Duration::from_secs(60), 10);
        let t0 = Instant::now();
        m.record_call_at(Duration::from_millis(10), false, t0);
        let later = t0 + Duration::from_secs(120);
        m.record_call_at(Duration::from_millis(10), true, later);

        let s = m.snapshot_at(later);
        assert_eq!(s.error_rate, 0.0);
        assert!((s.quota_usage - 0.2).abs() < 1e-9);

        let much_later = t0 + Duration::from_secs(2 * 3600);
        m.record_call_at(Duration::from_millis(10), true, much_later);
        assert_eq!(m.sample_count(), 1);
    }

    #[test]
    fn percentile_nearest_rank() {
        assert_eq!(percentile(&mut [5.0], 95.0), 5.0);
        assert_eq!(percentile(&mut [3.0, 1.0, 2.0], 50.0), 2.0);
        assert_eq!(percentile(&mut [], 95.0), 0.0);
    }
}
