//! Vision model client: sends a document image with the extraction prompt
//! and returns the model's free-form answer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ProviderConfig;
use crate::image_input::ImagePayload;

const MAX_TOKENS: u32 = 4096;

/// Anything that can turn an image plus an instruction into text.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn describe(&self, image: &ImagePayload, prompt: &str) -> Result<String>;
}

/// Mistral chat-completions client (pixtral models accept inline images).
#[derive(Clone)]
pub struct MistralClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl MistralClient {
    /// Build a client whose every request is bounded by `config.timeout`.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client for vision provider")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl VisionProvider for MistralClient {
    fn name(&self) -> &str {
        "mistral"
    }

    async fn describe(&self, image: &ImagePayload, prompt: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::user_with_image(prompt, image)],
            max_tokens: Some(MAX_TOKENS),
        };

        debug!(
            "Sending {} image ({} bytes) to {}: model={}",
            image.mime_type,
            image.data.len(),
            self.endpoint,
            request.model
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to vision provider")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Vision provider API error ({}): {}", status, error_text);
        }

        let response: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse vision provider response")?;

        if let Some(usage) = &response.usage {
            info!(
                "Vision response: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }

        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

/// True when any error in the chain is an HTTP timeout.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map_or(false, reqwest::Error::is_timeout)
    })
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: String },
}

impl Message {
    fn user_with_image(prompt: &str, image: &ImagePayload) -> Self {
        Self {
            role: "user",
            content: vec![
                ContentPart::Text {
                    text: prompt.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: image.to_data_uri(),
                },
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
