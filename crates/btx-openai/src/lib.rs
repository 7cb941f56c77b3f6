//! OpenAI adapter: chat completions behind the `ResponseGenerator` port.

use std::time::Duration;

use async_trait::async_trait;
use btx_core::{commands::QueryKind, errors::Error, ports::ResponseGenerator, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const TEMPERATURE: f32 = 0.7;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const BASE_PROMPT: &str = "You are BETRIX AI, an expert betting analysis system.";

/// System prompt per query kind.
pub fn system_prompt(kind: QueryKind) -> String {
    let focus = match kind {
        QueryKind::Predict => {
            "Provide precise, data-driven match predictions with detailed reasoning."
        }
        QueryKind::Analyze => {
            "Focus on in-depth statistical analysis of teams and players. Consider recent form, \
             head-to-head records, and relevant performance metrics."
        }
        QueryKind::General => "Provide precise, data-driven predictions and analysis.",
    };
    format!("{BASE_PROMPT} {focus}")
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

fn extract_content(body: &str) -> Result<String> {
    let resp: ChatResponse = serde_json::from_str(body)?;
    let text = resp
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(Error::External(
            "openai completion returned empty text".to_string(),
        ));
    }
    Ok(text)
}

#[derive(Clone, Debug)]
pub struct OpenAiClient {
    api_key: String,
    model: String,
    max_tokens: u32,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, max_tokens: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("reqwest client build: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
            http,
        })
    }

    fn request<'a>(&'a self, query: &str, kind: QueryKind) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt(kind),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: query.to_string(),
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl ResponseGenerator for OpenAiClient {
    async fn generate(&self, query: &str, kind: QueryKind) -> Result<String> {
        debug!(kind = kind.as_str(), model = %self.model, "openai completion");
        let resp = self
            .http
            .post(COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&self.request(query, kind))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(REQUEST_TIMEOUT)
                } else {
                    Error::External(format!("openai request error: {e}"))
                }
            })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::External(format!("openai body error: {e}")))?;
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        extract_content(&body)
    }
}
