//! Staged rollout with a health gate before and after every activation.
//!
//! One run walks its stages strictly in order:
//! `Pending -> Waiting(i) -> Validating(i) -> Activating(i) -> PostValidating(i)`,
//! then either the next stage, `Completed`, or `Aborted`. Every transition is
//! published on a watch channel and kept in the run's history.

use std::{fmt, future::Future, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    activation::{ActivationReport, ActivationRequest, ClientError, DEFAULT_ACTIVATION_SPACING},
    domain::{parse_client_list, ClientId},
    health::{is_healthy, HealthMetric, HealthReport, HealthSnapshot, RolloutThresholds},
    ports::{ActivationSink, MetricsSource},
    utils::{format_duration_ms, now_ms, parse_duration_ms},
};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(300_000);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStage {
    pub clients: Vec<ClientId>,
    pub delay_ms: u64,
}

impl RolloutStage {
    pub fn new(clients: Vec<ClientId>, delay: Duration) -> Self {
        Self {
            clients,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// `client7,client8@30m`; the delay part is optional and defaults to zero.
impl FromStr for RolloutStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (clients, delay) = match s.rsplit_once('@') {
            Some((c, d)) => {
                let ms = parse_duration_ms(d).ok_or_else(|| format!("invalid stage delay: {d}"))?;
                (c, ms)
            }
            None => (s, 0),
        };
        let clients = parse_client_list(clients);
        if clients.is_empty() {
            return Err(format!("stage has no clients: {s}"));
        }
        Ok(Self {
            clients,
            delay_ms: delay,
        })
    }
}

impl fmt::Display for RolloutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.clients.iter().map(ClientId::as_str).collect();
        write!(f, "{}@{}", ids.join(","), format_duration_ms(self.delay_ms))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutPlan {
    pub feature: String,
    pub model: String,
    pub stages: Vec<RolloutStage>,
    #[serde(default)]
    pub dry_run: bool,
}

impl RolloutPlan {
    /// Third wave: client7+client8 now, client9 after 30 minutes, client10 after an hour.
    pub fn wave3(feature: impl Into<String>, model: impl Into<String>) -> Self {
        let ids = |names: &[&str]| -> Vec<ClientId> {
            names.iter().map(|n| ClientId::from(*n)).collect()
        };
        Self {
            feature: feature.into(),
            model: model.into(),
            stages: vec![
                RolloutStage::new(ids(&["client7", "client8"]), Duration::ZERO),
                RolloutStage::new(ids(&["client9"]), Duration::from_secs(30 * 60)),
                RolloutStage::new(ids(&["client10"]), Duration::from_secs(60 * 60)),
            ],
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err("plan has no stages".to_string());
        }
        if let Some(i) = self.stages.iter().position(|s| s.clients.is_empty()) {
            return Err(format!("stage {} has no clients", i + 1));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RolloutSettings {
    pub cooldown: Duration,
    /// Bound on each metrics fetch and on each per-client activation call.
    pub call_timeout: Duration,
    /// Pause between consecutive clients of one stage.
    pub activation_spacing: Duration,
    pub thresholds: RolloutThresholds,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            activation_spacing: DEFAULT_ACTIVATION_SPACING,
            thresholds: RolloutThresholds::default(),
        }
    }
}

/// Stage indices are zero-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum RolloutPhase {
    Pending,
    Waiting { stage: usize },
    Validating { stage: usize },
    Activating { stage: usize },
    PostValidating { stage: usize },
    Completed,
    Aborted { stage: usize },
}

impl RolloutPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RolloutPhase::Completed | RolloutPhase::Aborted { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RolloutError {
    #[error("invalid rollout plan: {reason}")]
    InvalidPlan { reason: String },

    #[error("stage {}: health check failed before activation: {}", .stage + 1, .report.reasons.join("; "))]
    PreActivationHealth {
        stage: usize,
        snapshot: HealthSnapshot,
        report: HealthReport,
    },

    #[error("stage {}: health regressed after activation: {}", .stage + 1, .report.reasons.join("; "))]
    PostActivationRegression {
        stage: usize,
        snapshot: HealthSnapshot,
        report: HealthReport,
    },

    #[error("stage {}: activation failed: {reason}", .stage + 1)]
    Activation {
        stage: usize,
        reason: String,
        report: Option<ActivationReport>,
    },

    #[error("stage {}: metrics unavailable: {reason}", .stage + 1)]
    MetricsUnavailable { stage: usize, reason: String },

    #[error("stage {}: cancelled", .stage + 1)]
    Cancelled { stage: usize },
}

impl RolloutError {
    pub fn stage(&self) -> usize {
        match self {
            RolloutError::InvalidPlan { .. } => 0,
            RolloutError::PreActivationHealth { stage, .. }
            | RolloutError::PostActivationRegression { stage, .. }
            | RolloutError::Activation { stage, .. }
            | RolloutError::MetricsUnavailable { stage, .. }
            | RolloutError::Cancelled { stage } => *stage,
        }
    }

    /// Metrics over their critical limit, for the health-gate variants.
    pub fn breached_metrics(&self) -> Vec<HealthMetric> {
        match self {
            RolloutError::PreActivationHealth { report, .. }
            | RolloutError::PostActivationRegression { report, .. } => {
                [
                    HealthMetric::ErrorRate,
                    HealthMetric::P95LatencyMs,
                    HealthMetric::QuotaUsage,
                ]
                .into_iter()
                .filter(|m| report.breached(*m))
                .collect()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseChange {
    #[serde(flatten)]
    pub phase: RolloutPhase,
    pub at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutReport {
    pub feature: String,
    pub model: String,
    pub dry_run: bool,
    pub phase: RolloutPhase,
    pub stages_completed: usize,
    pub activations: Vec<ActivationReport>,
    pub history: Vec<PhaseChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RolloutError>,
}

impl RolloutReport {
    pub fn is_completed(&self) -> bool {
        self.phase == RolloutPhase::Completed
    }

    /// Stage indices in the order they reached `Activating`.
    pub fn activated_stages(&self) -> Vec<usize> {
        self.history
            .iter()
            .filter_map(|c| match c.phase {
                RolloutPhase::Activating { stage } => Some(stage),
                _ => None,
            })
            .collect()
    }
}

struct Run<'a> {
    tx: &'a watch::Sender<RolloutPhase>,
    report: RolloutReport,
}

impl<'a> Run<'a> {
    fn enter(&mut self, phase: RolloutPhase) {
        self.report.phase = phase;
        self.report.history.push(PhaseChange {
            phase,
            at_ms: now_ms(),
        });
        self.tx.send_replace(phase);
    }
}

/// Drives one rollout plan against a metrics source and an activation sink.
pub struct RolloutOrchestrator {
    metrics: Arc<dyn MetricsSource>,
    sink: Arc<dyn ActivationSink>,
    settings: RolloutSettings,
    phase_tx: watch::Sender<RolloutPhase>,
}

impl RolloutOrchestrator {
    pub fn new(
        metrics: Arc<dyn MetricsSource>,
        sink: Arc<dyn ActivationSink>,
        settings: RolloutSettings,
    ) -> Self {
        let (phase_tx, _) = watch::channel(RolloutPhase::Pending);
        Self {
            metrics,
            sink,
            settings,
            phase_tx,
        }
    }

    /// Live phase updates for the next (or current) run.
    pub fn subscribe(&self) -> watch::Receiver<RolloutPhase> {
        self.phase_tx.subscribe()
    }

    /// Run `plan` to a terminal phase. Never panics on collaborator failure;
    /// the outcome and its diagnostics are carried on the report.
    pub async fn run(&self, plan: &RolloutPlan, cancel: CancellationToken) -> RolloutReport {
        let mut run = Run {
            tx: &self.phase_tx,
            report: RolloutReport {
                feature: plan.feature.clone(),
                model: plan.model.clone(),
                dry_run: plan.dry_run,
                phase: RolloutPhase::Pending,
                stages_completed: 0,
                activations: Vec::new(),
                history: Vec::new(),
                error: None,
            },
        };
        run.enter(RolloutPhase::Pending);

        if let Err(reason) = plan.validate() {
            return self.abort(run, RolloutError::InvalidPlan { reason });
        }

        info!(
            feature = %plan.feature,
            model = %plan.model,
            stages = plan.stages.len(),
            dry_run = plan.dry_run,
            "rollout started"
        );

        for (idx, stage) in plan.stages.iter().enumerate() {
            if let Err(e) = self.run_stage(idx, stage, plan, &cancel, &mut run).await {
                return self.abort(run, e);
            }
            run.report.stages_completed = idx + 1;
            info!(stage = idx + 1, "stage complete");
        }

        run.enter(RolloutPhase::Completed);
        info!(stages = plan.stages.len(), "rollout completed");
        run.report
    }

    fn abort(&self, mut run: Run<'_>, err: RolloutError) -> RolloutReport {
        warn!(error = %err, "rollout aborted");
        run.enter(RolloutPhase::Aborted { stage: err.stage() });
        run.report.error = Some(err);
        run.report
    }

    async fn run_stage(
        &self,
        stage: usize,
        def: &RolloutStage,
        plan: &RolloutPlan,
        cancel: &CancellationToken,
        run: &mut Run<'_>,
    ) -> Result<(), RolloutError> {
        run.enter(RolloutPhase::Waiting { stage });
        if !def.delay().is_zero() {
            info!(stage = stage + 1, delay = %format_duration_ms(def.delay_ms), "waiting before stage");
        }
        sleep_or_cancel(def.delay(), cancel)
            .await
            .ok_or(RolloutError::Cancelled { stage })?;

        run.enter(RolloutPhase::Validating { stage });
        let snapshot = self.fetch_snapshot(stage, cancel).await?;
        let report = self.evaluate(stage, &snapshot);
        if !report.healthy {
            return Err(RolloutError::PreActivationHealth {
                stage,
                snapshot,
                report,
            });
        }

        run.enter(RolloutPhase::Activating { stage });
        let req = ActivationRequest {
            client_ids: def.clients.clone(),
            feature: plan.feature.clone(),
            model: plan.model.clone(),
            dry_run: plan.dry_run,
        };
        let (activation, failure) = self.activate(stage, &req, cancel).await;
        let enabled = activation.changes.len();
        if !activation.is_empty() {
            run.report.activations.push(activation);
        }
        if let Some(err) = failure {
            return Err(err);
        }
        info!(stage = stage + 1, clients = enabled, dry_run = plan.dry_run, "stage activated");

        run.enter(RolloutPhase::PostValidating { stage });
        sleep_or_cancel(self.settings.cooldown, cancel)
            .await
            .ok_or(RolloutError::Cancelled { stage })?;
        let snapshot = self.fetch_snapshot(stage, cancel).await?;
        let report = self.evaluate(stage, &snapshot);
        if !report.healthy {
            return Err(RolloutError::PostActivationRegression {
                stage,
                snapshot,
                report,
            });
        }
        Ok(())
    }

    fn evaluate(&self, stage: usize, snapshot: &HealthSnapshot) -> HealthReport {
        let report = is_healthy(snapshot, &self.settings.thresholds);
        for w in &report.warnings {
            warn!(stage = stage + 1, warning = %w, "health warning");
        }
        report
    }

    async fn fetch_snapshot(
        &self,
        stage: usize,
        cancel: &CancellationToken,
    ) -> Result<HealthSnapshot, RolloutError> {
        let fetched = bounded(
            self.settings.call_timeout,
            cancel,
            self.metrics.fetch_health_snapshot(),
        )
        .await
        .ok_or(RolloutError::Cancelled { stage })?;

        match fetched {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => Err(RolloutError::MetricsUnavailable {
                stage,
                reason: e.to_string(),
            }),
            Err(_) => Err(RolloutError::MetricsUnavailable {
                stage,
                reason: format!("timed out after {:?}", self.settings.call_timeout),
            }),
        }
    }

    /// Activate the stage one client at a time, each call under its own
    /// timeout. Stops at the first failure; the returned report always holds
    /// what was done before it, so a partial stage stays on the record.
    async fn activate(
        &self,
        stage: usize,
        req: &ActivationRequest,
        cancel: &CancellationToken,
    ) -> (ActivationReport, Option<RolloutError>) {
        let mut done = ActivationReport::new(req.dry_run);

        for (idx, id) in req.client_ids.iter().enumerate() {
            if idx > 0 && sleep_or_cancel(self.settings.activation_spacing, cancel).await.is_none() {
                return (done, Some(RolloutError::Cancelled { stage }));
            }

            let one = ActivationRequest {
                client_ids: vec![id.clone()],
                feature: req.feature.clone(),
                model: req.model.clone(),
                dry_run: req.dry_run,
            };
            let Some(outcome) =
                bounded(self.settings.call_timeout, cancel, self.sink.activate_clients(&one)).await
            else {
                return (done, Some(RolloutError::Cancelled { stage }));
            };

            let failure = match outcome {
                Ok(Ok(report)) => {
                    done.merge(report);
                    None
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("timed out after {:?}", self.settings.call_timeout)),
            };
            if let Some(error) = failure {
                done.errors.push(ClientError {
                    client_id: id.clone(),
                    error,
                });
            }

            if let Some(first) = done.errors.first() {
                let reason = format!("client {} failed: {}", first.client_id, first.error);
                let err = RolloutError::Activation {
                    stage,
                    reason,
                    report: Some(done.clone()),
                };
                return (done, Some(err));
            }
        }

        (done, None)
    }
}

/// `None` when cancelled.
async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> Option<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        _ = tokio::time::sleep(d) => Some(()),
    }
}

/// Run `fut` under a timeout; `None` when cancelled first.
async fn bounded<F: Future>(
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Option<Result<F::Output, tokio::time::error::Elapsed>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        r = tokio::time::timeout(limit, fut) => Some(r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActivationService, Activator};
    use crate::ports::ClientModelBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::errors::Error;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn snap(error_rate: f64) -> HealthSnapshot {
        HealthSnapshot {
            error_rate,
            p95_latency_ms: 800.0,
            quota_usage: 0.3,
        }
    }

    /// Pops scripted snapshots; repeats the last one when the script runs out.
    struct ScriptedMetrics {
        script: Mutex<VecDeque<HealthSnapshot>>,
        last: Mutex<HealthSnapshot>,
    }

    impl ScriptedMetrics {
        fn new(script: Vec<HealthSnapshot>) -> Self {
            let last = *script.last().unwrap();
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(last),
            }
        }
    }

    #[async_trait]
    impl MetricsSource for ScriptedMetrics {
        async fn fetch_health_snapshot(&self) -> crate::Result<HealthSnapshot> {
            let next = self.script.lock().unwrap().pop_front();
            Ok(next.unwrap_or(*self.last.lock().unwrap()))
        }
    }

    struct HangingMetrics;

    #[async_trait]
    impl MetricsSource for HangingMetrics {
        async fn fetch_health_snapshot(&self) -> crate::Result<HealthSnapshot> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<Vec<ClientId>>>,
        fail: bool,
        hang_for: Option<ClientId>,
    }

    #[async_trait]
    impl ActivationSink for RecordingSink {
        async fn activate_clients(&self, req: &ActivationRequest) -> crate::Result<ActivationReport> {
            self.calls.lock().unwrap().push(req.client_ids.clone());
            if self.hang_for.as_ref().is_some_and(|id| req.client_ids.contains(id)) {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(Error::Http {
                    status: 502,
                    body: "bad gateway".to_string(),
                });
            }
            let mut report = ActivationReport::dry_run(req);
            report.dry_run = false;
            Ok(report)
        }
    }

    fn three_stage_plan() -> RolloutPlan {
        RolloutPlan {
            feature: "sonnet-3-5".to_string(),
            model: "claude-sonnet-3.5".to_string(),
            stages: vec![
                RolloutStage::new(vec!["a".into()], Duration::ZERO),
                RolloutStage::new(vec!["b".into()], Duration::from_millis(1_800_000)),
                RolloutStage::new(vec!["c".into()], Duration::from_millis(3_600_000)),
            ],
            dry_run: false,
        }
    }

    fn orchestrator(
        metrics: Arc<dyn MetricsSource>,
        sink: Arc<dyn ActivationSink>,
    ) -> RolloutOrchestrator {
        RolloutOrchestrator::new(metrics, sink, RolloutSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_run_visits_every_stage_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(Arc::new(ScriptedMetrics::new(vec![snap(0.01)])), sink.clone());
        let phases = orch.subscribe();

        let started = tokio::time::Instant::now();
        let report = orch.run(&three_stage_plan(), CancellationToken::new()).await;

        assert!(report.is_completed(), "{:?}", report.error);
        assert_eq!(report.activated_stages(), vec![0, 1, 2]);
        assert_eq!(report.stages_completed, 3);
        assert_eq!(
            *sink.calls.lock().unwrap(),
            vec![vec![ClientId::from("a")], vec!["b".into()], vec!["c".into()]]
        );
        assert_eq!(*phases.borrow(), RolloutPhase::Completed);
        // Stage delays plus three cooldowns.
        assert!(started.elapsed() >= Duration::from_millis(5_400_000 + 3 * 300_000));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_before_first_activation_aborts() {
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(Arc::new(ScriptedMetrics::new(vec![snap(0.06)])), sink.clone());

        let report = orch.run(&three_stage_plan(), CancellationToken::new()).await;

        assert_eq!(report.phase, RolloutPhase::Aborted { stage: 0 });
        assert!(report.activated_stages().is_empty());
        assert!(sink.calls.lock().unwrap().is_empty());
        let err = report.error.unwrap();
        assert!(matches!(err, RolloutError::PreActivationHealth { stage: 0, .. }));
        assert_eq!(err.breached_metrics(), vec![HealthMetric::ErrorRate]);
        assert!(err.to_string().contains("errorRate"));
    }

    #[tokio::test(start_paused = true)]
    async fn regression_after_activation_is_distinct() {
        let sink = Arc::new(RecordingSink::default());
        // Pre-check healthy, post-check breaches p95.
        let bad = HealthSnapshot {
            error_rate: 0.0,
            p95_latency_ms: 7000.0,
            quota_usage: 0.1,
        };
        let orch = orchestrator(
            Arc::new(ScriptedMetrics::new(vec![snap(0.0), bad])),
            sink.clone(),
        );

        let report = orch.run(&three_stage_plan(), CancellationToken::new()).await;

        assert_eq!(report.activated_stages(), vec![0]);
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
        let err = report.error.unwrap();
        assert!(matches!(err, RolloutError::PostActivationRegression { stage: 0, .. }));
        assert_eq!(err.breached_metrics(), vec![HealthMetric::P95LatencyMs]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_activation_aborts_the_stage() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let orch = orchestrator(Arc::new(ScriptedMetrics::new(vec![snap(0.0)])), sink);

        let report = orch.run(&three_stage_plan(), CancellationToken::new()).await;
        assert!(matches!(
            report.error,
            Some(RolloutError::Activation { stage: 0, .. })
        ));
        assert_eq!(report.stages_completed, 0);
    }

    #[derive(Default)]
    struct CountingBackend {
        enabled: AtomicUsize,
    }

    #[async_trait]
    impl ClientModelBackend for CountingBackend {
        async fn enable_model(&self, _client_id: &ClientId, _model: &str) -> crate::Result<()> {
            self.enabled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn single_stage(ids: &[&str]) -> RolloutPlan {
        RolloutPlan {
            feature: "sonnet-3-5".to_string(),
            model: "claude-sonnet-3.5".to_string(),
            stages: vec![RolloutStage::new(
                ids.iter().map(|s| ClientId::from(*s)).collect(),
                Duration::ZERO,
            )],
            dry_run: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn large_stage_is_not_bounded_by_a_single_call_timeout() {
        let backend = Arc::new(CountingBackend::default());
        let service = ActivationService::new(Some(backend.clone()), vec![]);
        let orch = orchestrator(
            Arc::new(ScriptedMetrics::new(vec![snap(0.0)])),
            Arc::new(service),
        );
        let ids: Vec<String> = (0..40).map(|i| format!("client{i}")).collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

        let report = orch.run(&single_stage(&ids), CancellationToken::new()).await;

        assert!(report.is_completed(), "{:?}", report.error);
        assert_eq!(backend.enabled.load(Ordering::SeqCst), 40);
        assert_eq!(report.activations.len(), 1);
        assert_eq!(report.activations[0].changes.len(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn activation_timeout_keeps_the_partial_record() {
        let sink = Arc::new(RecordingSink {
            hang_for: Some(ClientId::from("b")),
            ..Default::default()
        });
        let orch = orchestrator(Arc::new(ScriptedMetrics::new(vec![snap(0.0)])), sink.clone());

        let report = orch.run(&single_stage(&["a", "b", "c"]), CancellationToken::new()).await;

        let Some(RolloutError::Activation { stage: 0, reason, report: Some(partial) }) = &report.error
        else {
            panic!("unexpected outcome: {:?}", report.error);
        };
        assert!(reason.contains("timed out"));
        assert_eq!(partial.changes.len(), 1);
        assert_eq!(partial.changes[0].client_id, ClientId::from("a"));
        assert_eq!(partial.errors[0].client_id, ClientId::from("b"));
        assert_eq!(report.activations, vec![partial.clone()]);
        // Activation stops at the failing client.
        assert_eq!(sink.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_activation_keeps_the_partial_record() {
        let sink = Arc::new(RecordingSink {
            hang_for: Some(ClientId::from("b")),
            ..Default::default()
        });
        let settings = RolloutSettings {
            call_timeout: Duration::from_secs(120),
            ..RolloutSettings::default()
        };
        let orch = Arc::new(RolloutOrchestrator::new(
            Arc::new(ScriptedMetrics::new(vec![snap(0.0)])),
            sink.clone(),
            settings,
        ));
        let cancel = CancellationToken::new();

        let task = {
            let orch = orch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.run(&single_stage(&["a", "b", "c"]), cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        let report = task.await.unwrap();

        assert!(matches!(report.error, Some(RolloutError::Cancelled { stage: 0 })));
        assert_eq!(report.activations.len(), 1);
        assert_eq!(report.activations[0].changes.len(), 1);
        assert_eq!(report.activations[0].changes[0].client_id, ClientId::from("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_timeout_is_never_healthy() {
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(Arc::new(HangingMetrics), sink.clone());

        let report = orch.run(&three_stage_plan(), CancellationToken::new()).await;
        assert!(matches!(
            report.error,
            Some(RolloutError::MetricsUnavailable { stage: 0, .. })
        ));
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_stage_delay() {
        let sink = Arc::new(RecordingSink::default());
        let orch = Arc::new(orchestrator(
            Arc::new(ScriptedMetrics::new(vec![snap(0.0)])),
            sink.clone(),
        ));
        let cancel = CancellationToken::new();

        let task = {
            let orch = orch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.run(&three_stage_plan(), cancel).await })
        };

        // Stage 0 finishes after its cooldown; stage 1 is then waiting 30 minutes.
        tokio::time::sleep(Duration::from_secs(600)).await;
        cancel.cancel();
        let report = task.await.unwrap();

        assert_eq!(report.phase, RolloutPhase::Aborted { stage: 1 });
        assert!(matches!(report.error, Some(RolloutError::Cancelled { stage: 1 })));
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_plan_never_reaches_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(
            Arc::new(ScriptedMetrics::new(vec![snap(0.0)])),
            Arc::new(Activator::new(sink.clone())),
        );

        let report = orch
            .run(&three_stage_plan().with_dry_run(true), CancellationToken::new())
            .await;

        assert!(report.is_completed());
        assert!(report.activations.iter().all(|a| a.dry_run));
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let orch = orchestrator(
            Arc::new(ScriptedMetrics::new(vec![snap(0.0)])),
            Arc::new(RecordingSink::default()),
        );
        let mut plan = three_stage_plan();
        plan.stages.clear();
        let report = orch.run(&plan, CancellationToken::new()).await;
        assert!(matches!(report.error, Some(RolloutError::InvalidPlan { .. })));
    }

    #[test]
    fn stage_parsing() {
        let s: RolloutStage = "client7, client8@30m".parse().unwrap();
        assert_eq!(s.clients, vec![ClientId::from("client7"), ClientId::from("client8")]);
        assert_eq!(s.delay(), Duration::from_secs(1800));
        assert_eq!(s.to_string(), "client7,client8@30m");

        let s: RolloutStage = "client9".parse().unwrap();
        assert_eq!(s.delay_ms, 0);

        assert!("@1h".parse::<RolloutStage>().is_err());
        assert!("a@soon".parse::<RolloutStage>().is_err());
    }

    #[test]
    fn wave3_plan_shape() {
        let plan = RolloutPlan::wave3("sonnet-3-5", "claude-sonnet-3.5");
        let delays: Vec<u64> = plan.stages.iter().map(|s| s.delay_ms).collect();
        assert_eq!(delays, vec![0, 1_800_000, 3_600_000]);
        assert_eq!(plan.stages[0].clients.len(), 2);
    }

    #[test]
    fn phase_wire_format() {
        let v = serde_json::to_value(RolloutPhase::Activating { stage: 2 }).unwrap();
        assert_eq!(v, serde_json::json!({ "phase": "activating", "stage": 2 }));
        let v = serde_json::to_value(RolloutPhase::Completed).unwrap();
        assert_eq!(v, serde_json::json!({ "phase": "completed" }));
    }
}
