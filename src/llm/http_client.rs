//! HTTP chat collaborator (Anthropic Messages API shape)

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::{ChatCollaborator, ChatError, ChatReply, ChatRequest};
use crate::config::CONFIG;

pub struct HttpChatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl HttpChatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
        })
    }

    pub fn from_global() -> anyhow::Result<Self> {
        Self::new(
            CONFIG.llm_base_url.clone(),
            CONFIG.llm_api_key.clone(),
            CONFIG.llm_model.clone(),
            CONFIG.llm_max_tokens,
            Duration::from_secs(CONFIG.llm_timeout_secs),
        )
    }

    pub fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[async_trait]
impl ChatCollaborator for HttpChatClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply, ChatError> {
        if self.api_key.is_empty() {
            return Err(ChatError(
                "ANTHROPIC_API_KEY not set; collaborator unavailable".to_string(),
            ));
        }

        let mut messages: Vec<WireMessage> = request
            .history
            .iter()
            .map(|m| WireMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect();
        messages.push(WireMessage {
            role: "user".to_string(),
            content: request.message,
        });

        let body = WireRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            temperature: request.temperature,
            system: request.system_prompt,
        };

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let mut attempt = 0;
        let max_attempts = 3;

        loop {
            let response = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send()
                .await
                .map_err(|e| ChatError(format!("request failed: {e}")))?;

            match response.status().as_u16() {
                200 => {
                    let parsed: WireResponse = response
                        .json()
                        .await
                        .map_err(|e| ChatError(format!("failed to parse response: {e}")))?;
                    let text = parsed.text();
                    if text.is_empty() {
                        return Err(ChatError("empty collaborator reply".to_string()));
                    }
                    let tokens = parsed
                        .usage
                        .map(|u| u.input_tokens + u.output_tokens);
                    return Ok(ChatReply {
                        message: text,
                        tokens_used: tokens,
                    });
                }
                429 => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(ChatError(format!(
                            "rate limited after {max_attempts} attempts"
                        )));
                    }
                    let wait = Duration::from_secs(2u64.pow(attempt));
                    warn!(?wait, "Collaborator rate limited, backing off");
                    sleep(wait).await;
                }
                code => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(ChatError(format!("API error {code}: {text}")));
                }
            }
        }
    }
}

// ----- Wire types -----

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct WireResponse {
    content: Vec<WireBlock>,
    usage: Option<WireUsage>,
}

impl WireResponse {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Deserialize)]
struct WireBlock {
    #[serde(rename = "type")]
    _block_type: Option<String>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}
