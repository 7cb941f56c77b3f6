//! Feature/model activation for rollout clients, with an end-to-end dry-run mode.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    domain::ClientId,
    errors::Error,
    ports::{ActivationSink, ClientModelBackend},
    utils::iso_timestamp_utc,
    Result,
};

/// Spacing between per-client enablement calls.
pub const DEFAULT_ACTIVATION_SPACING: Duration = Duration::from_millis(500);
/// Upper bound on a single backend enablement call.
pub const DEFAULT_ENABLE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationRequest {
    pub client_ids: Vec<ClientId>,
    pub feature: String,
    pub model: String,
    pub dry_run: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    WouldEnable,
    Enabled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientChange {
    pub client_id: ClientId,
    pub model: String,
    pub status: ChangeStatus,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientError {
    pub client_id: ClientId,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationReport {
    pub success: bool,
    pub dry_run: bool,
    pub changes: Vec<ClientChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ClientError>,
    #[serde(default)]
    pub timestamp: String,
}

impl ActivationReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            success: true,
            dry_run,
            changes: Vec::new(),
            errors: Vec::new(),
            timestamp: iso_timestamp_utc(),
        }
    }

    /// Fold another report's changes and errors into this one.
    pub fn merge(&mut self, other: ActivationReport) {
        self.changes.extend(other.changes);
        self.errors.extend(other.errors);
        self.timestamp = other.timestamp;
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.errors.is_empty()
    }

    /// True when every requested client was handled without error.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// The report a dry run produces: every client `would_enable`, nothing called.
    pub fn dry_run(req: &ActivationRequest) -> Self {
        Self {
            success: true,
            dry_run: true,
            changes: req
                .client_ids
                .iter()
                .map(|id| ClientChange {
                    client_id: id.clone(),
                    model: req.model.clone(),
                    status: ChangeStatus::WouldEnable,
                    dry_run: true,
                    timestamp: None,
                })
                .collect(),
            errors: Vec::new(),
            timestamp: iso_timestamp_utc(),
        }
    }
}

/// Pick the clients an activation targets.
///
/// Explicit clients win over the known list; `canary_count > 0` keeps only the
/// first N. Duplicates are dropped, order is preserved.
pub fn select_clients(
    explicit: &[ClientId],
    known: &[ClientId],
    canary_count: usize,
) -> Vec<ClientId> {
    let base = if explicit.is_empty() { known } else { explicit };
    let mut out: Vec<ClientId> = Vec::with_capacity(base.len());
    for id in base {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    if canary_count > 0 {
        out.truncate(canary_count);
    }
    out
}

/// Dry-run gate in front of any [`ActivationSink`].
///
/// Dry-run requests are answered locally and never reach the inner sink.
#[derive(Clone)]
pub struct Activator {
    sink: Option<Arc<dyn ActivationSink>>,
}

impl Activator {
    pub fn new(sink: Arc<dyn ActivationSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// An activator with nothing behind it; applied requests are refused.
    pub fn dry_run_only() -> Self {
        Self { sink: None }
    }
}

#[async_trait]
impl ActivationSink for Activator {
    async fn activate_clients(&self, req: &ActivationRequest) -> Result<ActivationReport> {
        if req.dry_run {
            for id in &req.client_ids {
                info!(client = %id, model = %req.model, "[dry-run] would enable");
            }
            return Ok(ActivationReport::dry_run(req));
        }
        match &self.sink {
            Some(sink) => sink.activate_clients(req).await,
            None => Err(Error::Config(
                "no activation sink configured for an applied request".to_string(),
            )),
        }
    }
}

/// Server-side activation: validates the model and enables it client by client.
///
/// Per-client failures are collected into the report rather than failing the
/// whole request; callers decide whether a partial report is acceptable.
pub struct ActivationService {
    backend: Option<Arc<dyn ClientModelBackend>>,
    allowed_models: Vec<String>,
    spacing: Duration,
    call_timeout: Duration,
}

impl ActivationService {
    pub fn new(backend: Option<Arc<dyn ClientModelBackend>>, allowed_models: Vec<String>) -> Self {
        Self {
            backend,
            allowed_models,
            spacing: DEFAULT_ACTIVATION_SPACING,
            call_timeout: DEFAULT_ENABLE_TIMEOUT,
        }
    }

    pub fn with_spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn allowed_models(&self) -> &[String] {
        &self.allowed_models
    }

    fn validate(&self, req: &ActivationRequest) -> Result<()> {
        if req.model.trim().is_empty() {
            return Err(Error::InvalidRequest("model parameter is required".to_string()));
        }
        if !self.allowed_models.is_empty() && !self.allowed_models.contains(&req.model) {
            return Err(Error::InvalidRequest(format!(
                "invalid model {}; allowed: {}",
                req.model,
                self.allowed_models.join(", ")
            )));
        }
        if req.client_ids.is_empty() {
            return Err(Error::InvalidRequest("no clients to process".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ActivationSink for ActivationService {
    async fn activate_clients(&self, req: &ActivationRequest) -> Result<ActivationReport> {
        self.validate(req)?;
        if req.dry_run {
            return Ok(ActivationReport::dry_run(req));
        }

        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| Error::Config("ADMIN_API_BASE is not configured".to_string()))?;

        let mut changes = Vec::new();
        let mut errors = Vec::new();
        for (idx, id) in req.client_ids.iter().enumerate() {
            if idx > 0 && !self.spacing.is_zero() {
                tokio::time::sleep(self.spacing).await;
            }
            let enabled = tokio::time::timeout(self.call_timeout, backend.enable_model(id, &req.model))
                .await
                .unwrap_or(Err(Error::Timeout(self.call_timeout)));
            match enabled {
                Ok(()) => {
                    info!(client = %id, model = %req.model, feature = %req.feature, "model enabled");
                    changes.push(ClientChange {
                        client_id: id.clone(),
                        model: req.model.clone(),
                        status: ChangeStatus::Enabled,
                        dry_run: false,
                        timestamp: Some(iso_timestamp_utc()),
                    });
                }
                Err(e) => {
                    warn!(client = %id, error = %e, "model enablement failed");
                    errors.push(ClientError {
                        client_id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(ActivationReport {
            success: true,
            dry_run: false,
            changes,
            errors,
            timestamp: iso_timestamp_utc(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActivationSink for CountingSink {
        async fn activate_clients(&self, req: &ActivationRequest) -> Result<ActivationReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut report = ActivationReport::dry_run(req);
            report.dry_run = false;
            Ok(report)
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        enabled: Mutex<Vec<String>>,
        fail_for: Option<String>,
        hang_for: Option<String>,
    }

    #[async_trait]
    impl ClientModelBackend for FakeBackend {
        async fn enable_model(&self, client_id: &ClientId, _model: &str) -> Result<()> {
            if self.hang_for.as_deref() == Some(client_id.as_str()) {
                std::future::pending::<()>().await;
            }
            if self.fail_for.as_deref() == Some(client_id.as_str()) {
                return Err(Error::Http {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            self.enabled.lock().unwrap().push(client_id.0.clone());
            Ok(())
        }
    }

    fn request(ids: &[&str], dry_run: bool) -> ActivationRequest {
        ActivationRequest {
            client_ids: ids.iter().map(|s| ClientId::from(*s)).collect(),
            feature: "sonnet-3-5".to_string(),
            model: "m".to_string(),
            dry_run,
        }
    }

    #[tokio::test]
    async fn dry_run_reports_would_enable_without_calling_sink() {
        let sink = Arc::new(CountingSink::default());
        let activator = Activator::new(sink.clone());

        let report = activator
            .activate_clients(&request(&["a", "b"], true))
            .await
            .unwrap();

        assert_eq!(report.changes.len(), 2);
        assert!(report
            .changes
            .iter()
            .all(|c| c.status == ChangeStatus::WouldEnable && c.model == "m"));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);

        let v = serde_json::to_value(&report.changes[0]).unwrap();
        assert_eq!(v["status"], "would_enable");
        assert_eq!(v["clientId"], "a");
    }

    #[tokio::test]
    async fn applied_requests_reach_the_sink() {
        let sink = Arc::new(CountingSink::default());
        let activator = Activator::new(sink.clone());
        activator
            .activate_clients(&request(&["a"], false))
            .await
            .unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dry_run_only_activator_refuses_applied_requests() {
        let activator = Activator::dry_run_only();
        assert!(activator
            .activate_clients(&request(&["a"], true))
            .await
            .is_ok());
        let err = activator
            .activate_clients(&request(&["a"], false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn service_collects_per_client_errors() {
        let backend = Arc::new(FakeBackend {
            fail_for: Some("b".to_string()),
            ..Default::default()
        });
        let svc = ActivationService::new(Some(backend.clone()), vec!["m".to_string()]);

        let report = svc
            .activate_clients(&request(&["a", "b", "c"], false))
            .await
            .unwrap();

        assert_eq!(report.changes.len(), 2);
        assert!(report.changes.iter().all(|c| c.status == ChangeStatus::Enabled));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].client_id, ClientId::from("b"));
        assert!(!report.is_complete());
        assert_eq!(*backend.enabled.lock().unwrap(), vec!["a", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_call_is_recorded_as_a_client_error() {
        let backend = Arc::new(FakeBackend {
            hang_for: Some("b".to_string()),
            ..Default::default()
        });
        let svc = ActivationService::new(Some(backend.clone()), vec![])
            .with_call_timeout(Duration::from_secs(2));

        let report = svc
            .activate_clients(&request(&["a", "b", "c"], false))
            .await
            .unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].client_id, ClientId::from("b"));
        assert!(report.errors[0].error.contains("timed out"));
        assert_eq!(*backend.enabled.lock().unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn merged_reports_keep_every_change_and_error() {
        let mut stage = ActivationReport::new(false);
        assert!(stage.is_empty());

        let mut first = ActivationReport::dry_run(&request(&["a"], false));
        first.dry_run = false;
        stage.merge(first);
        stage.merge(ActivationReport {
            errors: vec![ClientError {
                client_id: ClientId::from("b"),
                error: "boom".to_string(),
            }],
            ..ActivationReport::new(false)
        });

        assert_eq!(stage.changes.len(), 1);
        assert_eq!(stage.errors.len(), 1);
        assert!(!stage.is_complete());
        assert!(!stage.dry_run);
    }

    #[tokio::test]
    async fn service_rejects_disallowed_model_and_missing_backend() {
        let svc = ActivationService::new(None, vec!["claude-sonnet-3.5".to_string()]);
        let err = svc
            .activate_clients(&request(&["a"], true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let svc = ActivationService::new(None, vec![]);
        assert!(svc.activate_clients(&request(&["a"], true)).await.is_ok());
        let err = svc
            .activate_clients(&request(&["a"], false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn client_selection() {
        let known: Vec<ClientId> = ["c1", "c2", "c3"].iter().map(|s| ClientId::from(*s)).collect();
        let explicit = vec![ClientId::from("x"), ClientId::from("x"), ClientId::from("y")];

        assert_eq!(select_clients(&[], &known, 2), known[..2].to_vec());
        assert_eq!(select_clients(&[], &known, 0), known);
        assert_eq!(
            select_clients(&explicit, &known, 0),
            vec![ClientId::from("x"), ClientId::from("y")]
        );
        assert_eq!(select_clients(&explicit, &known, 1), vec![ClientId::from("x")]);
    }
}
