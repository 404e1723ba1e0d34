pub mod tensorzero;

pub use tensorzero::{LlmClient, LlmConfig};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A chat-style model behind a named gateway function.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(
        &self,
        function_name: &str,
        messages: &[LlmMessage],
    ) -> Result<LlmResponse, LlmError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: MessageContent,
}

impl LlmMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".into(),
            content: MessageContent::Blocks(blocks),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { url: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Remote URL or a `data:` URL carrying base64 image bytes.
    pub fn image_url(url: impl Into<String>) -> Self {
        ContentBlock::Image { url: url.into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default)]
    pub usage: Option<LlmUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// Decode a JSON object out of a model reply. Tries the raw text, then the
/// body of a markdown fence, then the outermost `{...}` span.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    let unfenced = strip_markdown_fence(trimmed);
    if let Ok(value) = serde_json::from_str(&unfenced) {
        return Ok(value);
    }
    let span = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(LlmError::InvalidResponse(
                "reply contains no JSON object".into(),
            ));
        }
    };
    serde_json::from_str(span).map_err(|err| LlmError::InvalidResponse(err.to_string()))
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let mut body = Vec::new();
    for line in trimmed[start..].lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}
