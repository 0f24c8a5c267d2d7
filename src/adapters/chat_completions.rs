use crate::domain::ports::{AnalysisBackend, ChatPrompt};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const QWEN_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// 直接呼叫 OpenAI 相容的 /chat/completions 端點
pub struct ChatCompletionsBackend {
    client: Client,
    provider: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatCompletionsBackend {
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            provider: provider.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.0,
            max_tokens: 8192,
        })
    }

    pub fn with_generation(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn error(&self, message: String, raw_response: Option<String>) -> EtlError {
        EtlError::BackendError {
            provider: self.provider.clone(),
            message,
            raw_response,
        }
    }
}

#[async_trait]
impl AnalysisBackend for ChatCompletionsBackend {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, prompt: &ChatPrompt) -> Result<String> {
        let payload = CompletionRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &prompt.system,
                },
                Message {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        tracing::debug!("📡 POST {}/chat/completions (model {})", self.base_url, self.model);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.error(e.to_string(), None))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.error(e.to_string(), None))?;

        if !status.is_success() {
            return Err(self.error(format!("HTTP {}", status), Some(body)));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body)
            .map_err(|e| self.error(format!("Unreadable response: {}", e), Some(body.clone())))?;

        match parsed.choices.into_iter().next().and_then(|c| c.message.content) {
            Some(content) if !content.is_empty() => Ok(content),
            _ => Err(self.error("Response contained no message content".to_string(), Some(body))),
        }
    }
}
