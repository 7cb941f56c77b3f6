//! Owns the (at most one) background rollout started from the admin API.

use std::sync::Arc;

use btx_core::{
    ports::{ActivationSink, MetricsSource},
    rollout::{RolloutOrchestrator, RolloutPhase, RolloutPlan, RolloutReport, RolloutSettings},
    utils::iso_timestamp_utc,
};
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

struct ActiveRun {
    plan: RolloutPlan,
    started_at: String,
    cancel: CancellationToken,
    phase: watch::Receiver<RolloutPhase>,
    handle: JoinHandle<()>,
}

impl ActiveRun {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    pub active: bool,
    pub phase: RolloutPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<RolloutPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<RolloutReport>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning(RolloutPhase),
}

pub struct RolloutSupervisor {
    metrics: Arc<dyn MetricsSource>,
    sink: Arc<dyn ActivationSink>,
    settings: RolloutSettings,
    shutdown: CancellationToken,
    current: Mutex<Option<ActiveRun>>,
    last: Arc<Mutex<Option<RolloutReport>>>,
}

impl RolloutSupervisor {
    /// Runs are cancelled together with `shutdown`.
    pub fn new(
        metrics: Arc<dyn MetricsSource>,
        sink: Arc<dyn ActivationSink>,
        settings: RolloutSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            metrics,
            sink,
            settings,
            shutdown,
            current: Mutex::new(None),
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &RolloutSettings {
        &self.settings
    }

    pub async fn start(&self, plan: RolloutPlan) -> StartOutcome {
        let mut current = self.current.lock().await;
        if let Some(run) = current.as_ref().filter(|r| r.is_running()) {
            return StartOutcome::AlreadyRunning(*run.phase.borrow());
        }

        let orchestrator =
            RolloutOrchestrator::new(self.metrics.clone(), self.sink.clone(), self.settings);
        let phase = orchestrator.subscribe();
        let cancel = self.shutdown.child_token();
        let last = self.last.clone();

        let handle = {
            let plan = plan.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let report = orchestrator.run(&plan, cancel).await;
                *last.lock().await = Some(report);
            })
        };

        info!(feature = %plan.feature, stages = plan.stages.len(), "background rollout started");
        *current = Some(ActiveRun {
            plan,
            started_at: iso_timestamp_utc(),
            cancel,
            phase,
            handle,
        });
        StartOutcome::Started
    }

    /// Fire the active run's cancellation token. False when nothing is running.
    pub async fn cancel(&self) -> bool {
        let current = self.current.lock().await;
        match current.as_ref().filter(|r| r.is_running()) {
            Some(run) => {
                run.cancel.cancel();
                info!("rollout cancellation requested");
                true
            }
            None => false,
        }
    }

    pub async fn status(&self) -> RolloutStatus {
        let current = self.current.lock().await;
        let last_report = self.last.lock().await.clone();
        match current.as_ref() {
            Some(run) => RolloutStatus {
                active: run.is_running(),
                phase: *run.phase.borrow(),
                plan: Some(run.plan.clone()),
                started_at: Some(run.started_at.clone()),
                last_report,
            },
            None => RolloutStatus {
                active: false,
                phase: RolloutPhase::Pending,
                plan: None,
                started_at: None,
                last_report,
            },
        }
    }
}
