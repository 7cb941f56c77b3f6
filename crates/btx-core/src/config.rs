use std::{
    env, fs,
    net::SocketAddr,
    path::Path,
    str::FromStr,
    time::Duration,
};

use crate::{
    activation::DEFAULT_ACTIVATION_SPACING,
    activity::{ActivityRecorder, DEFAULT_MAX_ENTRIES, DEFAULT_TTL},
    domain::{parse_client_list, ClientId},
    errors::Error,
    health::{MetricThresholds, RolloutThresholds},
    ops::{OpsMetrics, DEFAULT_METRICS_WINDOW, DEFAULT_QUOTA_PER_HOUR},
    rollout::{RolloutSettings, DEFAULT_CALL_TIMEOUT, DEFAULT_COOLDOWN},
    security::{LimitRule, RateLimiter, LIMIT_CHAT, LIMIT_WEBHOOK},
    Result,
};

const DEFAULT_PORT: u16 = 3000;

#[derive(Clone, Debug)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct RolloutDefaults {
    pub feature: String,
    pub model: String,
    pub settings: RolloutSettings,
}

/// Typed process configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub telegram_webhook_secret: Option<String>,
    pub listen_addr: SocketAddr,

    pub openai: OpenAiSettings,

    // Admin surface
    pub admin_api_key: Option<String>,
    pub admin_api_base: Option<String>,
    pub admin_allowed_models: Vec<String>,
    pub admin_clients: Vec<ClientId>,

    // Rate limiting / activity
    pub webhook_limit: LimitRule,
    pub chat_limit: LimitRule,
    pub activity_max_entries: usize,
    pub activity_ttl: Duration,

    // Rollout + ops metrics
    pub rollout: RolloutDefaults,
    pub llm_quota_per_hour: u64,
    pub metrics_window: Duration,
}

impl Config {
    /// Load from the process environment, after a best-effort `.env`.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").ok_or_else(|| {
            Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
        })?;

        let listen_addr = match get("LISTEN_ADDR") {
            Some(raw) => raw
                .trim()
                .parse::<SocketAddr>()
                .map_err(|e| Error::Config(format!("LISTEN_ADDR {raw:?}: {e}")))?,
            None => {
                let port = parse_num::<u16>(&get, "PORT")?.unwrap_or(DEFAULT_PORT);
                SocketAddr::from(([0, 0, 0, 0], port))
            }
        };

        let openai = OpenAiSettings {
            api_key: get("OPENAI_API_KEY"),
            model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4".to_string()),
            max_tokens: parse_num(&get, "OPENAI_MAX_TOKENS")?.unwrap_or(800),
        };

        let admin_allowed_models = parse_csv(
            get("ADMIN_ALLOWED_MODELS").unwrap_or_else(|| "claude-sonnet-3.5".to_string()),
        );
        let admin_clients = match get("ADMIN_CLIENTS") {
            Some(raw) => parse_client_list(&raw),
            None => (1..=10).map(|i| ClientId::new(format!("client{i}"))).collect(),
        };

        let webhook_limit = LimitRule::new(
            parse_num(&get, "RATE_LIMIT_WEBHOOK_MAX")?.unwrap_or(30),
            Duration::from_millis(parse_num(&get, "RATE_LIMIT_WEBHOOK_WINDOW_MS")?.unwrap_or(60_000)),
        );
        let chat_limit = LimitRule::new(
            parse_num(&get, "RATE_LIMIT_CHAT_MAX")?.unwrap_or(10),
            Duration::from_millis(parse_num(&get, "RATE_LIMIT_CHAT_WINDOW_MS")?.unwrap_or(60_000)),
        );

        let activity_max_entries =
            parse_num(&get, "ACTIVITY_MAX_ENTRIES")?.unwrap_or(DEFAULT_MAX_ENTRIES);
        let activity_ttl = parse_num(&get, "ACTIVITY_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TTL);

        let critical = RolloutThresholds::default().critical;
        let thresholds = RolloutThresholds::critical(MetricThresholds {
            max_error_rate: parse_num(&get, "ROLLOUT_MAX_ERROR_RATE")?
                .unwrap_or(critical.max_error_rate),
            max_p95_latency_ms: parse_num(&get, "ROLLOUT_MAX_P95_LATENCY_MS")?
                .unwrap_or(critical.max_p95_latency_ms),
            max_quota_usage: parse_num(&get, "ROLLOUT_MAX_QUOTA_USAGE")?
                .unwrap_or(critical.max_quota_usage),
        });
        let rollout = RolloutDefaults {
            feature: get("ROLLOUT_FEATURE").unwrap_or_else(|| "sonnet-3-5".to_string()),
            model: get("ROLLOUT_MODEL").unwrap_or_else(|| "claude-sonnet-3.5".to_string()),
            settings: RolloutSettings {
                cooldown: parse_num(&get, "ROLLOUT_COOLDOWN_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_COOLDOWN),
                call_timeout: parse_num(&get, "ROLLOUT_CALL_TIMEOUT_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_CALL_TIMEOUT),
                activation_spacing: parse_num(&get, "ROLLOUT_ACTIVATION_SPACING_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_ACTIVATION_SPACING),
                thresholds,
            },
        };

        Ok(Self {
            telegram_bot_token,
            telegram_webhook_secret: get("TELEGRAM_WEBHOOK_SECRET"),
            listen_addr,
            openai,
            admin_api_key: get("ADMIN_API_KEY"),
            admin_api_base: get("ADMIN_API_BASE"),
            admin_allowed_models,
            admin_clients,
            webhook_limit,
            chat_limit,
            activity_max_entries,
            activity_ttl,
            rollout,
            llm_quota_per_hour: parse_num(&get, "LLM_QUOTA_PER_HOUR")?
                .unwrap_or(DEFAULT_QUOTA_PER_HOUR),
            metrics_window: parse_num(&get, "METRICS_WINDOW_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_METRICS_WINDOW),
        })
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new([
            (LIMIT_WEBHOOK.to_string(), self.webhook_limit),
            (LIMIT_CHAT.to_string(), self.chat_limit),
        ])
    }

    pub fn activity_recorder(&self) -> ActivityRecorder {
        ActivityRecorder::new(self.activity_max_entries, self.activity_ttl)
    }

    pub fn ops_metrics(&self) -> OpsMetrics {
        OpsMetrics::new(self.metrics_window, self.llm_quota_per_hour)
    }
}

fn parse_num<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn parse_csv(v: String) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
