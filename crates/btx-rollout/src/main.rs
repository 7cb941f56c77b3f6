//! Operator CLI: one-shot canary activation or a staged, health-gated rollout
//! against a running admin API. Dry run unless `--apply` is given.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use btx_core::{
    activation::{select_clients, ActivationRequest, Activator},
    admin_client::AdminApiClient,
    domain::{parse_client_list, ClientId},
    health::{MetricThresholds, RolloutThresholds},
    ports::ActivationSink,
    rollout::{RolloutOrchestrator, RolloutPlan, RolloutSettings, RolloutStage},
    utils::{format_duration_ms, parse_duration_ms},
};

#[derive(Parser, Debug)]
#[command(name = "btx-rollout")]
#[command(about = "Canary activation and staged rollouts for BETRIX clients")]
struct Cli {
    #[command(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Args, Debug)]
struct Common {
    /// Base URL of the admin API
    #[arg(long, env = "BTX_API_BASE", default_value = "http://localhost:3000", global = true)]
    api_base: String,

    /// Shared secret sent as X-API-Key
    #[arg(long, env = "ADMIN_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// Comma-separated client ids
    #[arg(long, env = "ROLLOUT_CLIENTS", global = true)]
    clients: Option<String>,

    /// Pick the first N clients (of --clients, or of the known list)
    #[arg(long, default_value_t = 0, global = true)]
    canary_count: usize,

    /// Known client ids used when --clients is absent
    #[arg(long, env = "ADMIN_CLIENTS", global = true)]
    known_clients: Option<String>,

    #[arg(long, env = "ROLLOUT_MODEL", default_value = "claude-sonnet-3.5", global = true)]
    model: String,

    #[arg(long, env = "ROLLOUT_FEATURE", default_value = "sonnet-3-5", global = true)]
    feature: String,

    /// Actually enable; without this every change is reported as would_enable
    #[arg(long, global = true)]
    apply: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Enable the model for the selected clients in one step
    Activate,
    /// Run a staged plan with health checks before and after each stage
    Rollout(RolloutArgs),
}

#[derive(Args, Debug)]
struct RolloutArgs {
    /// Stage as `client7,client8@30m`; repeat for more stages
    #[arg(long = "stage")]
    stages: Vec<RolloutStage>,

    /// Wait after each activation before re-checking health [default: 5m]
    #[arg(long, env = "ROLLOUT_COOLDOWN_MS", value_parser = parse_duration)]
    cooldown: Option<Duration>,

    /// Bound on each metrics fetch / per-client activation call [default: 15s]
    #[arg(long, env = "ROLLOUT_CALL_TIMEOUT_MS", value_parser = parse_duration)]
    call_timeout: Option<Duration>,

    #[arg(long, env = "ROLLOUT_MAX_ERROR_RATE", default_value_t = 0.05)]
    max_error_rate: f64,

    #[arg(long, env = "ROLLOUT_MAX_P95_LATENCY_MS", default_value_t = 5000.0)]
    max_p95_latency_ms: f64,

    #[arg(long, env = "ROLLOUT_MAX_QUOTA_USAGE", default_value_t = 0.90)]
    max_quota_usage: f64,

    /// Warning tier; breaches are logged but do not stop the rollout
    #[arg(long)]
    warn_error_rate: Option<f64>,

    #[arg(long)]
    warn_p95_latency_ms: Option<f64>,

    #[arg(long)]
    warn_quota_usage: Option<f64>,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    parse_duration_ms(s)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("invalid duration: {s} (use 250ms, 30s, 5m, 1h)"))
}

impl Common {
    fn known(&self) -> Vec<ClientId> {
        match &self.known_clients {
            Some(raw) => parse_client_list(raw),
            None => (1..=10).map(|i| ClientId::new(format!("client{i}"))).collect(),
        }
    }

    fn selected_clients(&self) -> Vec<ClientId> {
        let explicit = self
            .clients
            .as_deref()
            .map(parse_client_list)
            .unwrap_or_default();
        select_clients(&explicit, &self.known(), self.canary_count)
    }

    fn client(&self) -> anyhow::Result<AdminApiClient> {
        let key = self
            .api_key
            .clone()
            .context("--api-key (or ADMIN_API_KEY) is required")?;
        Ok(AdminApiClient::new(&self.api_base, key)?)
    }
}

impl RolloutArgs {
    fn settings(&self) -> RolloutSettings {
        let critical = MetricThresholds {
            max_error_rate: self.max_error_rate,
            max_p95_latency_ms: self.max_p95_latency_ms,
            max_quota_usage: self.max_quota_usage,
        };
        let mut thresholds = RolloutThresholds::critical(critical);
        if self.warn_error_rate.is_some()
            || self.warn_p95_latency_ms.is_some()
            || self.warn_quota_usage.is_some()
        {
            thresholds = thresholds.with_warning(MetricThresholds {
                max_error_rate: self.warn_error_rate.unwrap_or(critical.max_error_rate),
                max_p95_latency_ms: self
                    .warn_p95_latency_ms
                    .unwrap_or(critical.max_p95_latency_ms),
                max_quota_usage: self.warn_quota_usage.unwrap_or(critical.max_quota_usage),
            });
        }
        let defaults = RolloutSettings::default();
        RolloutSettings {
            cooldown: self.cooldown.unwrap_or(defaults.cooldown),
            call_timeout: self.call_timeout.unwrap_or(defaults.call_timeout),
            thresholds,
            ..defaults
        }
    }

    /// Explicit stages, else one stage of the selected clients when given, else wave 3.
    fn plan(&self, common: &Common) -> RolloutPlan {
        let stages = if !self.stages.is_empty() {
            self.stages.clone()
        } else if common.clients.is_some() || common.canary_count > 0 {
            vec![RolloutStage::new(common.selected_clients(), Duration::ZERO)]
        } else {
            RolloutPlan::wave3(&common.feature, &common.model).stages
        };
        RolloutPlan {
            feature: common.feature.clone(),
            model: common.model.clone(),
            stages,
            dry_run: !common.apply,
        }
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });
}

async fn activate(common: &Common) -> anyhow::Result<()> {
    // A dry run never reaches the admin API, so it needs no credentials.
    let activator = if common.apply {
        Activator::new(Arc::new(common.client()?))
    } else {
        Activator::dry_run_only()
    };
    let req = ActivationRequest {
        client_ids: common.selected_clients(),
        feature: common.feature.clone(),
        model: common.model.clone(),
        dry_run: !common.apply,
    };
    anyhow::ensure!(!req.client_ids.is_empty(), "no clients selected");

    info!(
        clients = req.client_ids.len(),
        model = %req.model,
        dry_run = req.dry_run,
        "activating"
    );
    let report = activator.activate_clients(&req).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    anyhow::ensure!(
        report.is_complete(),
        "{} client(s) failed",
        report.errors.len()
    );
    Ok(())
}

async fn rollout(common: &Common, args: &RolloutArgs) -> anyhow::Result<()> {
    let client = Arc::new(common.client()?);
    let plan = args.plan(common);
    let settings = args.settings();

    for (i, stage) in plan.stages.iter().enumerate() {
        info!(stage = i + 1, plan = %stage, "planned stage");
    }
    info!(
        cooldown = %format_duration_ms(settings.cooldown.as_millis() as u64),
        dry_run = plan.dry_run,
        "starting rollout"
    );

    let orchestrator = RolloutOrchestrator::new(
        client.clone(),
        Arc::new(Activator::new(client)),
        settings,
    );

    let mut phases = orchestrator.subscribe();
    let watcher = tokio::spawn(async move {
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            info!(?phase, "phase");
            if phase.is_terminal() {
                break;
            }
        }
    });

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());
    let report = orchestrator.run(&plan, cancel).await;
    drop(orchestrator);
    let _ = watcher.await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    match report.error {
        Some(err) => Err(err).context("rollout aborted"),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    btx_core::logging::init("btx-rollout")?;
    let cli = Cli::parse();

    match &cli.command {
        Cmd::Activate => activate(&cli.common).await,
        Cmd::Rollout(args) => rollout(&cli.common, args).await,
    }
}
