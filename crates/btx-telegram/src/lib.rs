//! Telegram adapter: teloxide messenger plus the axum webhook/admin surface.

use async_trait::async_trait;

use teloxide::{prelude::*, types::ParseMode};

use tokio::time::sleep;
use tracing::{debug, warn};

pub mod handlers;
pub mod router;
pub mod supervisor;

use btx_core::{
    domain::ChatId,
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{MessagingCapabilities, TextFormat},
    },
    Result,
};

const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self::new(Bot::new(token))
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(
        &self,
        mut op: impl FnMut() -> Fut,
    ) -> std::result::Result<T, teloxide::RequestError>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Err(teloxide::RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    debug!(retry_after = ?d, "telegram flood control, retrying");
                    sleep(d).await;
                }
                other => return other,
            }
        }
    }

    // Legacy Markdown matches what the reply templates are written in.
    #[allow(deprecated)]
    async fn send_chunk(&self, chat_id: ChatId, text: &str, format: TextFormat) -> Result<()> {
        let chat = Self::tg_chat(chat_id);
        if format == TextFormat::Markdown {
            let sent = self
                .with_retry(|| {
                    self.bot
                        .send_message(chat, text.to_string())
                        .parse_mode(ParseMode::Markdown)
                })
                .await;
            match sent {
                Ok(_) => return Ok(()),
                // Model output is not always valid Markdown; resend verbatim.
                Err(teloxide::RequestError::Api(e)) => {
                    warn!(chat_id = %chat_id, error = %e, "markdown rejected, sending plain text");
                }
                Err(e) => return Err(Self::map_err(e)),
            }
        }

        self.with_retry(|| self.bot.send_message(chat, text.to_string()))
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }
}

/// Split `text` into pieces of at most `max` chars, preferring line breaks.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    if text.chars().count() <= max {
        return vec![text.to_string()];
    }

    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > max && !current.is_empty() {
            out.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max) {
                out.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_markdown: true,
            supports_callbacks: true,
        }
    }

    async fn send_text(&self, chat_id: ChatId, text: &str, format: TextFormat) -> Result<()> {
        for chunk in split_message(text, TELEGRAM_MESSAGE_LIMIT) {
            self.send_chunk(chat_id, &chunk, format).await?;
        }
        Ok(())
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.with_retry(|| {
            let mut req = self.bot.answer_callback_query(callback_id.to_string());
            if let Some(t) = text {
                req = req.text(t.to_string());
            }
            req
        })
        .await
        .map_err(Self::map_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(split_message("hi", 10), vec!["hi".to_string()]);
    }

    #[test]
    fn long_messages_split_on_lines() {
        let text = "aaaa\nbbbb\ncccc";
        let parts = split_message(text, 10);
        assert_eq!(parts, vec!["aaaa\nbbbb\n".to_string(), "cccc".to_string()]);
        assert!(parts.iter().all(|p| p.chars().count() <= 10));
    }

    #[test]
    fn oversized_lines_are_hard_split() {
        let parts = split_message(&"x".repeat(25), 10);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.concat(), "x".repeat(25));
    }
}
