use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use btx_core::{
    config::Config,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    ports::ResponseGenerator,
};
use btx_openai::OpenAiClient;
use btx_telegram::{router::AppState, TelegramMessenger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    btx_core::logging::init("btx")?;

    let cfg = Arc::new(Config::load()?);

    // Space out outbound calls so a progress notice plus reply does not trip 429s.
    let raw: Arc<dyn MessagingPort> =
        Arc::new(TelegramMessenger::from_token(cfg.telegram_bot_token.clone()));
    let messenger: Arc<dyn MessagingPort> =
        Arc::new(ThrottledMessenger::new(raw, ThrottleConfig::default()));

    let generator: Option<Arc<dyn ResponseGenerator>> = match &cfg.openai.api_key {
        Some(key) => Some(Arc::new(
            OpenAiClient::new(key.clone(), cfg.openai.model.clone(), cfg.openai.max_tokens)
                .context("building OpenAI client")?,
        )),
        None => {
            warn!("OPENAI_API_KEY is not set; model-backed commands will report unavailable");
            None
        }
    };

    if cfg.admin_api_key.is_none() {
        warn!("ADMIN_API_KEY is not set; admin routes will answer 503");
    }

    let shutdown = CancellationToken::new();
    let state = AppState::from_config(&cfg, messenger, generator, shutdown.clone())?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
            shutdown.cancel();
        });
    }

    info!(
        addr = %cfg.listen_addr,
        webhook_limit = cfg.webhook_limit.max_requests,
        chat_limit = cfg.chat_limit.max_requests,
        clients = cfg.admin_clients.len(),
        "btx starting"
    );
    btx_telegram::router::serve(cfg.listen_addr, state, shutdown).await
}
