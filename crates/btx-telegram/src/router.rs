use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use btx_core::{
    activation::ActivationService,
    admin_client::HttpModelBackend,
    config::{Config, RolloutDefaults},
    dispatcher::WebhookDispatcher,
    domain::ClientId,
    messaging::port::MessagingPort,
    ops::OpsMetrics,
    ports::{ClientModelBackend, ResponseGenerator},
};

use crate::handlers::{admin, webhook};
use crate::supervisor::RolloutSupervisor;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the admin routes need.
pub struct AdminState {
    pub api_key: Option<String>,
    pub known_clients: Vec<ClientId>,
    pub rollout_defaults: RolloutDefaults,
    pub activation: Arc<ActivationService>,
    pub ops: Arc<OpsMetrics>,
    pub rollouts: RolloutSupervisor,
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<WebhookDispatcher>,
    pub admin: Arc<AdminState>,
    pub webhook_secret: Option<String>,
}

impl AppState {
    /// Wire the stores, services, and rollout supervisor from configuration.
    pub fn from_config(
        cfg: &Config,
        messenger: Arc<dyn MessagingPort>,
        generator: Option<Arc<dyn ResponseGenerator>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let ops = Arc::new(cfg.ops_metrics());
        let dispatcher = Arc::new(WebhookDispatcher::new(
            Arc::new(cfg.rate_limiter()),
            Arc::new(cfg.activity_recorder()),
            messenger,
            generator,
            ops.clone(),
        ));

        let backend: Option<Arc<dyn ClientModelBackend>> =
            match (&cfg.admin_api_base, &cfg.admin_api_key) {
                (Some(base), Some(key)) => Some(Arc::new(HttpModelBackend::new(base, key.clone())?)),
                _ => None,
            };
        let activation = Arc::new(ActivationService::new(
            backend,
            cfg.admin_allowed_models.clone(),
        ));
        let rollouts = RolloutSupervisor::new(
            ops.clone(),
            activation.clone(),
            cfg.rollout.settings,
            shutdown,
        );

        Ok(Self {
            dispatcher,
            admin: Arc::new(AdminState {
                api_key: cfg.admin_api_key.clone(),
                known_clients: cfg.admin_clients.clone(),
                rollout_defaults: cfg.rollout.clone(),
                activation,
                ops,
                rollouts,
            }),
            webhook_secret: cfg.telegram_webhook_secret.clone(),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let hook = || get(webhook::webhook_get).post(webhook::webhook_post);

    Router::new()
        .route("/health", get(webhook::health))
        .route("/api/bot/webhook", hook())
        .route("/api/telegram/webhook", hook())
        .route("/api/webhook", hook())
        .route(
            "/api/admin/status",
            get(admin::status).options(admin::preflight),
        )
        .route(
            "/api/admin/canary/enable",
            post(admin::canary_enable).options(admin::preflight),
        )
        .route(
            "/api/admin/rollout",
            get(admin::rollout_status).options(admin::preflight),
        )
        .route(
            "/api/admin/rollout/start",
            post(admin::rollout_start).options(admin::preflight),
        )
        .route(
            "/api/admin/rollout/cancel",
            post(admin::rollout_cancel).options(admin::preflight),
        )
        .with_state(state)
}

/// Periodically drop expired limiter counters and activity logs.
pub fn spawn_sweeper(state: &AppState, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let now = std::time::Instant::now();
                    let counters = dispatcher.limiter().purge_expired(now);
                    let logs = dispatcher.activity().purge_expired(now);
                    if counters + logs > 0 {
                        let tracked = dispatcher.limiter().tracked_keys();
                        debug!(counters, logs, tracked, "purged expired entries");
                    }
                }
            }
        }
    })
}

/// Serve until `shutdown` fires.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let sweeper = spawn_sweeper(&state, shutdown.clone());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");

    let graceful = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { graceful.cancelled().await })
    .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweeper task failed");
    }
    info!("server stopped");
    Ok(())
}
