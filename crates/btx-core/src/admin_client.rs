//! HTTP clients for the admin API (metrics + activation) and the per-client
//! model enablement backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    activation::{ActivationReport, ActivationRequest},
    domain::ClientId,
    errors::Error,
    health::HealthSnapshot,
    ports::{ActivationSink, ClientModelBackend, MetricsSource},
    security::API_KEY_HEADER,
    utils::truncate_text,
    Result,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::Config(format!("http client build: {e}")))
}

fn trim_base(base: &str) -> String {
    base.trim().trim_end_matches('/').to_string()
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Http {
        status: status.as_u16(),
        body: truncate_text(&body, 200),
    })
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    metrics: Option<HealthSnapshot>,
}

/// Extract the snapshot from a `GET /api/admin/status` body.
///
/// A body without a complete `metrics` object is an error, never a default.
pub fn parse_status_body(body: &str) -> Result<HealthSnapshot> {
    let parsed: StatusBody = serde_json::from_str(body)?;
    parsed
        .metrics
        .ok_or_else(|| Error::External("status response has no metrics".to_string()))
}

/// Client for a remote admin API (`/api/admin/status`, `/api/admin/canary/enable`).
#[derive(Clone, Debug)]
pub struct AdminApiClient {
    base: String,
    api_key: String,
    http: reqwest::Client,
}

impl AdminApiClient {
    pub fn new(base: &str, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base: trim_base(base),
            api_key: api_key.into(),
            http: http_client()?,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }
}

#[async_trait]
impl MetricsSource for AdminApiClient {
    async fn fetch_health_snapshot(&self) -> Result<HealthSnapshot> {
        let url = format!("{}/api/admin/status", self.base);
        let resp = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| Error::External(format!("status request error: {e}")))?;
        let body = error_for_status(resp)
            .await?
            .text()
            .await
            .map_err(|e| Error::External(format!("status body error: {e}")))?;
        let snapshot = parse_status_body(&body)?;
        debug!(?snapshot, "fetched health snapshot");
        Ok(snapshot)
    }
}

#[async_trait]
impl ActivationSink for AdminApiClient {
    async fn activate_clients(&self, req: &ActivationRequest) -> Result<ActivationReport> {
        let url = format!("{}/api/admin/canary/enable", self.base);
        let resp = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&json!({
                "clientIds": req.client_ids,
                "feature": req.feature,
                "model": req.model,
                "dryRun": req.dry_run,
                "apply": !req.dry_run,
            }))
            .send()
            .await
            .map_err(|e| Error::External(format!("activation request error: {e}")))?;
        let body = error_for_status(resp)
            .await?
            .text()
            .await
            .map_err(|e| Error::External(format!("activation body error: {e}")))?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// `POST {base}/clients/{id}/models` with bearer auth.
#[derive(Clone, Debug)]
pub struct HttpModelBackend {
    base: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpModelBackend {
    pub fn new(base: &str, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base: trim_base(base),
            api_key: api_key.into(),
            http: http_client()?,
        })
    }
}

#[async_trait]
impl ClientModelBackend for HttpModelBackend {
    async fn enable_model(&self, client_id: &ClientId, model: &str) -> Result<()> {
        let url = format!("{}/clients/{}/models", self.base, client_id);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": model, "enabled": true }))
            .send()
            .await
            .map_err(|e| Error::External(format!("enable request error: {e}")))?;
        error_for_status(resp).await?;
        Ok(())
    }
}
