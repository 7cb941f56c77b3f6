use serde::Deserialize;

use crate::domain::{ChatId, UserId};

/// Inbound webhook update (the subset of a Telegram `Update` we act on).
///
/// Every field is optional so that unknown or partial payloads deserialize and
/// can be acknowledged instead of rejected.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InboundUpdate {
    #[serde(default)]
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<InboundMessage>,
    #[serde(default)]
    pub callback_query: Option<InboundCallback>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub message_id: i64,
    #[serde(default)]
    pub chat: Option<InboundChat>,
    #[serde(default)]
    pub from: Option<InboundUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InboundChat {
    pub id: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InboundUser {
    pub id: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InboundCallback {
    pub id: String,
    #[serde(default)]
    pub from: Option<InboundUser>,
    #[serde(default)]
    pub message: Option<InboundMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

/// A message or callback flattened to what the dispatcher needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMessage {
    pub chat_id: ChatId,
    pub user_id: Option<UserId>,
    pub text: String,
    pub callback_id: Option<String>,
}

impl InboundUpdate {
    pub fn kind(&self) -> &'static str {
        if self.message.is_some() {
            "message"
        } else if self.callback_query.is_some() {
            "callback_query"
        } else {
            "other"
        }
    }

    /// Resolve the chat the update belongs to. Callback queries use the
    /// message they are attached to, with the callback `data` as the text.
    pub fn resolve(&self) -> Option<ResolvedMessage> {
        if let Some(msg) = &self.message {
            let chat = msg.chat.as_ref()?;
            return Some(ResolvedMessage {
                chat_id: ChatId(chat.id),
                user_id: msg.from.as_ref().map(|u| UserId(u.id)),
                text: msg.text.clone().unwrap_or_default(),
                callback_id: None,
            });
        }

        let cb = self.callback_query.as_ref()?;
        let msg = cb.message.as_ref()?;
        let chat = msg.chat.as_ref()?;
        let from = cb.from.as_ref().or(msg.from.as_ref());
        Some(ResolvedMessage {
            chat_id: ChatId(chat.id),
            user_id: from.map(|u| UserId(u.id)),
            text: cb
                .data
                .clone()
                .or_else(|| msg.text.clone())
                .unwrap_or_default(),
            callback_id: Some(cb.id.clone()),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Markdown,
}

/// Capabilities / feature flags of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    /// Without it, replies that would be Markdown go out as plain text.
    pub supports_markdown: bool,
    /// Without it, callback queries are routed but never answered.
    pub supports_callbacks: bool,
}
