use crate::http::build_client;
use crate::llm::{ChatModel, LlmError, LlmMessage, LlmResponse, LlmUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(config.timeout, config.connect_timeout),
            config,
        }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn chat(
        &self,
        function_name: &str,
        messages: &[LlmMessage],
    ) -> Result<LlmResponse, LlmError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(LlmError::MissingGateway);
        }

        let body = ChatRequest {
            function_name: function_name.to_string(),
            model_name: self.config.model.clone(),
            input: ChatInput {
                messages: messages.to_vec(),
            },
        };

        let mut request = self.http.post(format!("{gateway}/inference")).json(&body);

        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: TensorZeroResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        let text = payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .and_then(|item| item.text)
            .ok_or_else(|| LlmError::InvalidResponse("missing text".into()))?;

        if let Some(usage) = &payload.usage {
            debug!(
                target = "furnish.llm",
                function = function_name,
                input_tokens = usage.input_tokens.unwrap_or(0),
                output_tokens = usage.output_tokens.unwrap_or(0),
                "llm_usage"
            );
        }

        Ok(LlmResponse {
            text,
            usage: payload.usage,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: ChatInput,
}

#[derive(Debug, Serialize)]
struct ChatInput {
    messages: Vec<LlmMessage>,
}

#[derive(Debug, Deserialize)]
struct TensorZeroResponse {
    content: Vec<ResponseContent>,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ContentBlock;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, api_key: Option<&str>) -> LlmClient {
        LlmClient::new(LlmConfig {
            gateway_url: server.uri(),
            api_key: api_key.map(str::to_string),
            model: Some("gpt-4o-mini".into()),
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
        })
    }

    #[tokio::test]
    async fn chat_posts_inference_and_reads_text_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inference"))
            .and(header("X-API-Key", "secret"))
            .and(body_partial_json(json!({
                "function_name": "furniture_vision",
                "model_name": "gpt-4o-mini",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "inference_id": "0192",
                "content": [
                    {"type": "thought", "text": null},
                    {"type": "text", "text": "{\"furniture_type\":\"Chair\"}"}
                ],
                "usage": {"input_tokens": 12, "output_tokens": 7}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("secret"));
        let messages = vec![LlmMessage::user_blocks(vec![
            ContentBlock::text("describe"),
            ContentBlock::image_url("https://cdn.example.com/a.jpg"),
        ])];
        let reply = client
            .chat("furniture_vision", &messages)
            .await
            .expect("chat reply");
        assert_eq!(reply.text, "{\"furniture_type\":\"Chair\"}");
        assert_eq!(reply.usage.and_then(|u| u.output_tokens), Some(7));
    }

    #[tokio::test]
    async fn non_success_status_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inference"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client
            .chat("furniture_listing", &[LlmMessage::user("hi")])
            .await
            .expect_err("gateway error");
        assert!(matches!(err, LlmError::Http(ref msg) if msg.contains("502")));
    }

    #[tokio::test]
    async fn missing_text_block_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inference"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"content": []})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client
            .chat("furniture_grouping", &[LlmMessage::user("hi")])
            .await
            .expect_err("no text");
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn blank_gateway_is_rejected_without_network() {
        let client = LlmClient::new(LlmConfig {
            gateway_url: "  ".into(),
            api_key: None,
            model: None,
            timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
        });
        let err = client
            .chat("furniture_vision", &[LlmMessage::user("hi")])
            .await
            .expect_err("missing gateway");
        assert!(matches!(err, LlmError::MissingGateway));
    }
}
