//! Language-model collaborator
//!
//! The agent depends only on the narrow [`ChatCollaborator`] contract;
//! provider selection and context assembly live behind it.

mod http_client;

pub use http_client::HttpChatClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One prior exchange message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A chat request to the collaborator
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub message: String,
    pub history: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }
}

/// A successful collaborator reply
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub message: String,
    pub tokens_used: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ChatError(pub String);

#[async_trait]
pub trait ChatCollaborator: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply, ChatError>;
}
