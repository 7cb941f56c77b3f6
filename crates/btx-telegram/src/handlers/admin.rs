//! Admin API: status, canary activation, and background rollouts.
//!
//! Every route except the CORS preflight requires the shared secret in
//! `X-API-Key`; the check runs before the body is looked at.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use btx_core::{
    activation::{select_clients, ActivationRequest},
    domain::{parse_client_list, ClientId},
    errors::Error,
    health::is_healthy,
    ports::ActivationSink,
    rollout::{RolloutPlan, RolloutStage},
    security::{check_shared_secret, API_KEY_HEADER},
    utils::iso_timestamp_utc,
};

use crate::router::{AdminState, AppState};
use crate::supervisor::StartOutcome;

const DEFAULT_CANARY_COUNT: usize = 2;

fn reply(status: StatusCode, body: Value) -> Response {
    (
        status,
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(body),
    )
        .into_response()
}

fn authorize(admin: &AdminState, headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    match check_shared_secret(provided, admin.api_key.as_deref()) {
        Ok(()) => Ok(()),
        Err(Error::Config(msg)) => {
            warn!(error = %msg, "admin request rejected: no secret configured");
            Err(reply(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "Admin API is not configured" }),
            ))
        }
        Err(e) => {
            warn!(error = %e, "admin request rejected");
            Err(reply(StatusCode::FORBIDDEN, json!({ "error": "Forbidden" })))
        }
    }
}

/// An empty body reads as `{}`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        reply(
            StatusCode::BAD_REQUEST,
            json!({ "error": format!("invalid JSON body: {e}") }),
        )
    })
}

fn error_response(e: &Error) -> Response {
    let status = match e {
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    reply(
        status,
        json!({ "error": e.to_string(), "timestamp": iso_timestamp_utc() }),
    )
}

pub async fn preflight() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, X-API-Key"),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
    )
}

pub async fn status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let admin = &state.admin;
    if let Err(resp) = authorize(admin, &headers) {
        return resp;
    }

    let metrics = admin.ops.snapshot();
    let health = is_healthy(&metrics, &admin.rollouts.settings().thresholds);
    let rollout = admin.rollouts.status().await;

    reply(
        StatusCode::OK,
        json!({
            "success": true,
            "metrics": metrics,
            "healthStatus": if health.healthy { "healthy" } else { "degraded" },
            "health": health,
            "rollout": rollout,
            "knownClients": admin.known_clients,
            "allowedModels": admin.activation.allowed_models(),
            "timestamp": iso_timestamp_utc(),
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientList {
    Csv(String),
    List(Vec<String>),
}

impl ClientList {
    fn into_ids(self) -> Vec<ClientId> {
        match self {
            ClientList::Csv(s) => parse_client_list(&s),
            ClientList::List(v) => parse_client_list(&v.join(",")),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanaryBody {
    model: Option<String>,
    #[serde(alias = "clientIds", alias = "client_ids")]
    clients: Option<ClientList>,
    #[serde(alias = "canary_count")]
    canary_count: Option<usize>,
    apply: Option<bool>,
    #[serde(alias = "dry_run")]
    dry_run: Option<bool>,
    feature: Option<String>,
}

/// `dryRun` wins when given; otherwise only `apply: true` applies.
fn dry_run_of(dry_run: Option<bool>, apply: Option<bool>) -> bool {
    dry_run.unwrap_or(!apply.unwrap_or(false))
}

pub async fn canary_enable(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let admin = &state.admin;
    if let Err(resp) = authorize(admin, &headers) {
        return resp;
    }
    let body: CanaryBody = match parse_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let explicit = body.clients.map(ClientList::into_ids).unwrap_or_default();
    let canary_count = body.canary_count.unwrap_or(if explicit.is_empty() {
        DEFAULT_CANARY_COUNT
    } else {
        0
    });
    let req = ActivationRequest {
        client_ids: select_clients(&explicit, &admin.known_clients, canary_count),
        feature: body
            .feature
            .unwrap_or_else(|| admin.rollout_defaults.feature.clone()),
        model: body.model.unwrap_or_default(),
        dry_run: dry_run_of(body.dry_run, body.apply),
    };

    info!(
        model = %req.model,
        clients = req.client_ids.len(),
        dry_run = req.dry_run,
        "canary enable requested"
    );
    match admin.activation.activate_clients(&req).await {
        Ok(report) => reply(StatusCode::OK, json!(report)),
        Err(e) => {
            warn!(error = %e, "canary enable failed");
            error_response(&e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RolloutStartBody {
    feature: Option<String>,
    model: Option<String>,
    /// `client7,client8@30m` per stage; the built-in plan when absent.
    stages: Option<Vec<String>>,
    #[serde(alias = "dry_run")]
    dry_run: Option<bool>,
    apply: Option<bool>,
}

fn plan_from(admin: &AdminState, body: RolloutStartBody) -> Result<RolloutPlan, Error> {
    let defaults = &admin.rollout_defaults;
    let feature = body.feature.unwrap_or_else(|| defaults.feature.clone());
    let model = body.model.unwrap_or_else(|| defaults.model.clone());

    let allowed = admin.activation.allowed_models();
    if !allowed.is_empty() && !allowed.contains(&model) {
        return Err(Error::InvalidRequest(format!(
            "invalid model {model}; allowed: {}",
            allowed.join(", ")
        )));
    }

    let dry_run = dry_run_of(body.dry_run, body.apply);
    let plan = match body.stages {
        Some(raw) => RolloutPlan {
            feature,
            model,
            stages: raw
                .iter()
                .map(|s| s.parse::<RolloutStage>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(Error::InvalidRequest)?,
            dry_run,
        },
        None => RolloutPlan::wave3(feature, model).with_dry_run(dry_run),
    };
    if plan.stages.is_empty() {
        return Err(Error::InvalidRequest("plan has no stages".to_string()));
    }
    Ok(plan)
}

pub async fn rollout_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let admin = &state.admin;
    if let Err(resp) = authorize(admin, &headers) {
        return resp;
    }
    let body: RolloutStartBody = match parse_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let plan = match plan_from(admin, body) {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };

    match admin.rollouts.start(plan).await {
        StartOutcome::Started => reply(
            StatusCode::ACCEPTED,
            json!({ "success": true, "rollout": admin.rollouts.status().await }),
        ),
        StartOutcome::AlreadyRunning(phase) => reply(
            StatusCode::CONFLICT,
            json!({ "error": "a rollout is already running", "phase": phase }),
        ),
    }
}

pub async fn rollout_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let admin = &state.admin;
    if let Err(resp) = authorize(admin, &headers) {
        return resp;
    }
    reply(StatusCode::OK, json!(admin.rollouts.status().await))
}

pub async fn rollout_cancel(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let admin = &state.admin;
    if let Err(resp) = authorize(admin, &headers) {
        return resp;
    }
    if admin.rollouts.cancel().await {
        reply(StatusCode::OK, json!({ "success": true, "cancelled": true }))
    } else {
        reply(
            StatusCode::NOT_FOUND,
            json!({ "error": "no rollout is running" }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_resolution() {
        assert!(dry_run_of(None, None));
        assert!(!dry_run_of(None, Some(true)));
        assert!(dry_run_of(Some(true), Some(true)));
        assert!(!dry_run_of(Some(false), None));
    }

    #[test]
    fn canary_body_accepts_every_client_spelling() {
        for body in [
            r#"{"model":"m","clients":"a, b"}"#,
            r#"{"model":"m","clientIds":["a","b"]}"#,
            r#"{"model":"m","client_ids":"a,b"}"#,
        ] {
            let parsed: CanaryBody = serde_json::from_str(body).unwrap();
            assert_eq!(
                parsed.clients.unwrap().into_ids(),
                vec![ClientId::from("a"), ClientId::from("b")]
            );
        }
    }
}
