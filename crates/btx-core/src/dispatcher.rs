//! Webhook dispatch: rate limits, activity, command routing, model calls.

use std::{sync::Arc, time::Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    activity::ActivityRecorder,
    commands::{
        parse_command, Command, QueryKind, AI_UNAVAILABLE_TEXT, ERROR_TEXT, HELP_TEXT,
        RATE_LIMITED_TEXT, WELCOME_TEXT,
    },
    domain::ChatId,
    messaging::{
        port::MessagingPort,
        types::{InboundUpdate, ResolvedMessage, TextFormat},
    },
    ops::OpsMetrics,
    ports::ResponseGenerator,
    security::{RateLimiter, LIMIT_CHAT, LIMIT_WEBHOOK},
    Result,
};

/// What happened to one inbound update. The HTTP layer acknowledges all of
/// them with 200.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchOutcome {
    Throttled,
    Ignored,
    Handled,
    Failed,
}

pub struct WebhookDispatcher {
    limiter: Arc<RateLimiter>,
    activity: Arc<ActivityRecorder>,
    messenger: Arc<dyn MessagingPort>,
    generator: Option<Arc<dyn ResponseGenerator>>,
    ops: Arc<OpsMetrics>,
}

impl WebhookDispatcher {
    pub fn new(
        limiter: Arc<RateLimiter>,
        activity: Arc<ActivityRecorder>,
        messenger: Arc<dyn MessagingPort>,
        generator: Option<Arc<dyn ResponseGenerator>>,
        ops: Arc<OpsMetrics>,
    ) -> Self {
        Self {
            limiter,
            activity,
            messenger,
            generator,
            ops,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn activity(&self) -> &ActivityRecorder {
        &self.activity
    }

    pub fn ops(&self) -> &OpsMetrics {
        &self.ops
    }

    /// Handle one update from `source` (the caller's address).
    pub async fn dispatch(&self, source: &str, update: &InboundUpdate) -> DispatchOutcome {
        if !self.limiter.check_limit(LIMIT_WEBHOOK, source) {
            warn!(source = %source, "webhook rate limit exceeded");
            return DispatchOutcome::Throttled;
        }

        let Some(msg) = update.resolve() else {
            debug!(update_id = update.update_id, kind = update.kind(), "update without chat, ignoring");
            return DispatchOutcome::Ignored;
        };

        let chat_key = msg.chat_id.to_string();
        if !self.limiter.check_limit(LIMIT_CHAT, &chat_key) {
            let status = self.limiter.status_at(LIMIT_CHAT, &chat_key, Instant::now());
            warn!(
                chat_id = %msg.chat_id,
                count = status.count,
                max = status.max,
                resets_in_ms = status.resets_in.map(|d| d.as_millis() as u64),
                "chat rate limit exceeded"
            );
            if let Err(e) = self
                .messenger
                .send_text(msg.chat_id, RATE_LIMITED_TEXT, TextFormat::Plain)
                .await
            {
                warn!(chat_id = %msg.chat_id, error = %e, "failed to send rate limit notice");
            }
            return DispatchOutcome::Throttled;
        }

        let command = parse_command(&msg.text);
        let message_type = if msg.text.trim_start().starts_with('/') {
            "command"
        } else {
            "message"
        };
        self.activity.record_activity(
            LIMIT_CHAT,
            &chat_key,
            json!({
                "messageType": message_type,
                "updateKind": update.kind(),
                "command": command.label(),
                "userId": msg.user_id.map(|u| u.0),
            }),
        );

        let caps = self.messenger.capabilities();
        if let Some(cb) = msg.callback_id.as_ref().filter(|_| caps.supports_callbacks) {
            if let Err(e) = self.messenger.answer_callback_query(cb, None).await {
                debug!(error = %e, "answerCallbackQuery failed");
            }
        }

        match self.route(&msg, command).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(chat_id = %msg.chat_id, error = %e, "update handling failed");
                if let Err(e) = self
                    .messenger
                    .send_text(msg.chat_id, ERROR_TEXT, TextFormat::Plain)
                    .await
                {
                    warn!(chat_id = %msg.chat_id, error = %e, "failed to send error notice");
                }
                DispatchOutcome::Failed
            }
        }
    }

    /// Markdown where the messenger renders it, plain text otherwise.
    fn rich_format(&self) -> TextFormat {
        if self.messenger.capabilities().supports_markdown {
            TextFormat::Markdown
        } else {
            TextFormat::Plain
        }
    }

    async fn route(&self, msg: &ResolvedMessage, command: Command) -> Result<DispatchOutcome> {
        let chat_id = msg.chat_id;
        match command {
            Command::Start => {
                self.messenger
                    .send_text(chat_id, WELCOME_TEXT, TextFormat::Plain)
                    .await?;
            }
            Command::Help => {
                self.messenger
                    .send_text(chat_id, HELP_TEXT, self.rich_format())
                    .await?;
            }
            Command::MissingArgument { kind } => {
                self.messenger
                    .send_text(chat_id, kind.usage(), TextFormat::Plain)
                    .await?;
            }
            Command::Query { kind, text } => return self.answer(chat_id, kind, &text).await,
            Command::Unknown { name } => {
                debug!(chat_id = %chat_id, command = %name, "unknown command");
                return Ok(DispatchOutcome::Ignored);
            }
            Command::Empty => return Ok(DispatchOutcome::Ignored),
        }
        Ok(DispatchOutcome::Handled)
    }

    async fn answer(&self, chat_id: ChatId, kind: QueryKind, text: &str) -> Result<DispatchOutcome> {
        self.messenger
            .send_text(chat_id, kind.progress_notice(), TextFormat::Plain)
            .await?;

        let Some(generator) = &self.generator else {
            warn!("no response generator configured");
            self.messenger
                .send_text(chat_id, AI_UNAVAILABLE_TEXT, TextFormat::Plain)
                .await?;
            return Ok(DispatchOutcome::Failed);
        };

        let started = Instant::now();
        let generated = generator.generate(text, kind).await;
        self.ops.record_call(started.elapsed(), generated.is_ok());

        match generated {
            Ok(body) => {
                info!(chat_id = %chat_id, kind = kind.as_str(), "model reply sent");
                self.messenger
                    .send_text(chat_id, &kind.format_reply(&body), self.rich_format())
                    .await?;
                Ok(DispatchOutcome::Handled)
            }
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "model call failed");
                self.messenger
                    .send_text(chat_id, AI_UNAVAILABLE_TEXT, TextFormat::Plain)
                    .await?;
                Ok(DispatchOutcome::Failed)
            }
        }
    }
}
