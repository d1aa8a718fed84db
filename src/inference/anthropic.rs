use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{InferenceRequest, InferenceService};

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicConfig {
    #[serde(default = "default_api_key_env")]
    /// The environment variable holding the Anthropic API key.
    ///
    /// Read on every call.
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    /// The token ceiling for standard reports.
    pub max_tokens: u32,

    #[serde(default = "default_deep_dive_max_tokens")]
    /// The token ceiling for deep dive reports.
    pub deep_dive_max_tokens: u32,

    #[serde(default = "default_timeout")]
    /// The maximum time a single analysis may take in seconds.
    ///
    /// Defaults to 10 minutes, this must stay below the session ttl.
    pub timeout_secs: u64,

    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

const fn default_max_tokens() -> u32 {
    6000
}

const fn default_deep_dive_max_tokens() -> u32 {
    8000
}

const fn default_timeout() -> u64 {
    10 * 60
}

fn default_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<MessageParam<'a>>,
}

#[derive(Debug, Serialize)]
struct MessageParam<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Image { source: ImageSource<'a> },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlockResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockResponse {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Sends images to the Anthropic Messages API.
pub struct AnthropicBackend {
    cfg: AnthropicConfig,
    http_client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(cfg: AnthropicConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("Failed to create HTTP client for the inference service")?;

        Ok(Self { cfg, http_client })
    }

    fn api_key(&self) -> anyhow::Result<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("Inference API key is not configured ({} is unset)", self.cfg.api_key_env))
    }
}

#[async_trait]
impl InferenceService for AnthropicBackend {
    async fn analyse(&self, request: InferenceRequest) -> anyhow::Result<String> {
        let api_key = self.api_key()?;

        let body = MessagesRequest {
            model: &self.cfg.model,
            max_tokens: request.max_tokens,
            system: &request.instructions.system,
            messages: vec![MessageParam {
                role: "user",
                content: vec![
                    ContentBlock::Image {
                        source: ImageSource {
                            source_type: "base64",
                            media_type: &request.mime_type,
                            data: &request.image_base64,
                        },
                    },
                    ContentBlock::Text {
                        text: &request.instructions.user,
                    },
                ],
            }],
        };

        let response = self
            .http_client
            .post(format!("{}/messages", self.cfg.base_url.trim_end_matches('/')))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to send request to the inference service")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Inference request failed: {} - {}",
                status,
                error_text
            ));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse the inference service response")?;

        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|b| match b {
                ContentBlockResponse::Text { text } => Some(text),
                ContentBlockResponse::Other => None,
            })
            .collect();

        if text.trim().is_empty() {
            return Err(anyhow!("Inference service returned no text"));
        }

        Ok(text)
    }
}
