use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::{debug, warn};

use btx_core::{
    dispatcher::DispatchOutcome, messaging::types::InboundUpdate, security::secrets_match,
};

use crate::router::AppState;

const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";
const MAX_UPDATE_BYTES: usize = 1024 * 1024;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Static echo; never touches the limiter.
pub async fn webhook_get() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// Always 200: Telegram retries anything else, and throttled or failed
/// updates must not be redelivered.
pub async fn webhook_post(State(state): State<AppState>, req: Request) -> impl IntoResponse {
    let source = source_of(req.headers(), req.extensions().get::<ConnectInfo<SocketAddr>>());

    if let Some(expected) = state.webhook_secret.as_deref() {
        let provided = req
            .headers()
            .get(SECRET_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !secrets_match(provided, expected) {
            warn!(source = %source, "webhook secret mismatch");
            return ack(DispatchOutcome::Ignored);
        }
    }

    let body = match axum::body::to_bytes(req.into_body(), MAX_UPDATE_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            warn!(source = %source, error = %e, "failed to read webhook body");
            return ack(DispatchOutcome::Ignored);
        }
    };
    let update: InboundUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => {
            warn!(source = %source, error = %e, "malformed update");
            return ack(DispatchOutcome::Ignored);
        }
    };

    let outcome = state.dispatcher.dispatch(&source, &update).await;
    debug!(update_id = update.update_id, ?outcome, "update dispatched");
    ack(outcome)
}

fn ack(outcome: DispatchOutcome) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "outcome": outcome }))
}

/// Rate-limit identity of the caller.
///
/// The peer address is authoritative. `x-forwarded-for` is read only when the
/// peer is a loopback or private address (a reverse proxy in front of the
/// gateway), and then only its last hop: the address that proxy connected from.
/// Earlier hops are client-supplied and never used.
fn source_of(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    let Some(ConnectInfo(addr)) = peer else {
        return "unknown".to_string();
    };
    let ip = addr.ip();
    if is_trusted_proxy(ip) {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit(',').next())
            .map(str::trim)
            .and_then(|hop| hop.parse::<IpAddr>().ok());
        if let Some(client) = forwarded {
            return client.to_string();
        }
    }
    ip.to_string()
}

fn is_trusted_proxy(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|m| m.is_loopback() || m.is_private())
        }
    }
}
