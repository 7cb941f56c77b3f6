use async_trait::async_trait;

use crate::{
    domain::ChatId,
    messaging::types::{MessagingCapabilities, TextFormat},
    Result,
};

/// Outbound messenger port used by the webhook dispatcher.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_text(&self, chat_id: ChatId, text: &str, format: TextFormat) -> Result<()>;

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()>;
}
