use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{BotError, BotResult, LlmError};
use crate::utils::parse_model_json;

#[derive(Debug, Clone, PartialEq)]
pub enum UserContent {
    Text(String),
    TextWithImage { text: String, image_url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: UserContent,
    pub max_tokens: u32,
    pub temperature: f32,
    pub json_output: bool,
}

impl CompletionRequest {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn plain_text(mut self) -> Self {
        self.json_output = false;
        self
    }
}

/// The one capability the bot needs from a language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    async fn check_connection(&self) -> Result<(), LlmError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAIClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAIClient {
    pub fn new(api_key: &str, model: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("HTTP client: {}", e))?;
        Ok(OpenAIClient {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_request<'a>(&'a self, request: &'a CompletionRequest) -> ChatRequest<'a> {
        let user = match &request.user {
            UserContent::Text(text) => MessageContent::Text(text),
            UserContent::TextWithImage { text, image_url } => MessageContent::Parts(vec![
                ContentPart::Text { text },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: image_url },
                },
            ]),
        };

        ChatRequest {
            model: &self.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: vec![
                Message {
                    role: "system",
                    content: MessageContent::Text(&request.system),
                },
                Message {
                    role: "user",
                    content: user,
                },
            ],
            response_format: request.json_output.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAIClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = self.build_request(request);
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let body: ChatResponse = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(content)
    }

    async fn check_connection(&self) -> Result<(), LlmError> {
        let response = self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(LlmError::Api { status, body })
        }
    }
}

/// Shared front door to the model: applies defaults, the per-call timeout
/// and the schema check with a single repair round.
#[derive(Clone)]
pub struct LlmService {
    model: Arc<dyn ChatModel>,
    max_tokens: u32,
    timeout: Duration,
}

impl LlmService {
    pub fn new(model: Arc<dyn ChatModel>, max_tokens: u32, timeout: Duration) -> Self {
        LlmService {
            model,
            max_tokens,
            timeout,
        }
    }

    pub fn json_request(&self, system: impl Into<String>, user: UserContent) -> CompletionRequest {
        CompletionRequest {
            system: system.into(),
            user,
            max_tokens: self.max_tokens,
            temperature: 0.1,
            json_output: true,
        }
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        match tokio::time::timeout(self.timeout, self.model.complete(&request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        }
    }

    pub async fn check_connection(&self) -> Result<(), LlmError> {
        match tokio::time::timeout(self.timeout, self.model.check_connection()).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        }
    }

    /// Asks for a JSON document matching `schema`. A reply that fails to
    /// parse or validate is sent back once to be fixed.
    pub async fn complete_json(
        &self,
        request: CompletionRequest,
        schema: &JSONSchema,
    ) -> BotResult<Value> {
        let raw = self.complete(request.clone()).await?;
        match parse_model_json(&raw) {
            Ok(value) if schema.is_valid(&value) => return Ok(value),
            Ok(_) => warn!("Model reply does not match the schema, asking for a fix"),
            Err(err) => warn!(error = %err, "Model reply is not JSON, asking for a fix"),
        }

        let fix_request = CompletionRequest {
            user: UserContent::Text(format!(
                "Fix this JSON so that it matches the requested structure exactly. Output JSON only. JSON:\n{}",
                raw
            )),
            ..request
        };
        let raw = self.complete(fix_request).await?;
        debug!(reply = %raw, "Repaired model reply");
        let value = parse_model_json(&raw).map_err(|e| BotError::extraction(e.to_string()))?;
        if !schema.is_valid(&value) {
            return Err(BotError::extraction("JSON validation failed"));
        }
        Ok(value)
    }
}

pub fn compile_schema(schema: &Value) -> Result<JSONSchema> {
    JSONSchema::compile(schema).map_err(|e| anyhow!("Invalid JSON schema: {}", e))
}
