use crate::domain::ports::{AnalysisBackend, ChatPrompt};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    Human,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
        }
    }
}

/// 對話模型抽象：輸入訊息列表，回傳一則 assistant 訊息
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<ChatMessage>;
}

/// 透過 ChatModel 抽象呼叫模型的分析後端
pub struct ChatModelBackend<M: ChatModel> {
    provider: String,
    model: M,
}

impl<M: ChatModel> ChatModelBackend<M> {
    pub fn new(provider: impl Into<String>, model: M) -> Self {
        Self {
            provider: provider.into(),
            model,
        }
    }
}

#[async_trait]
impl<M: ChatModel> AnalysisBackend for ChatModelBackend<M> {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, prompt: &ChatPrompt) -> Result<String> {
        let messages = [
            ChatMessage::system(&prompt.system),
            ChatMessage::human(&prompt.user),
        ];
        tracing::debug!("🤖 Invoking chat model {}", self.model.name());

        let reply = self.model.invoke(&messages).await.map_err(|e| match e {
            EtlError::BackendError { .. } => e,
            other => EtlError::BackendError {
                provider: self.provider.clone(),
                message: other.to_string(),
                raw_response: None,
            },
        })?;
        Ok(reply.content)
    }
}

/// Gemini generateContent 模型
pub struct GeminiChatModel {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

impl GeminiChatModel {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.0,
            max_output_tokens: 8192,
        })
    }

    pub fn with_generation(mut self, temperature: f32, max_output_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_output_tokens = max_output_tokens;
        self
    }

    fn backend_error(&self, message: String, raw_response: Option<String>) -> EtlError {
        EtlError::BackendError {
            provider: format!("gemini:{}", self.model),
            message,
            raw_response,
        }
    }
}

#[async_trait]
impl ChatModel for GeminiChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        // system 訊息合併為 systemInstruction，其餘依序成為 contents
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<_> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::Assistant { "model" } else { "user" };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens,
            },
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
        }

        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.backend_error(e.to_string(), None))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.backend_error(e.to_string(), None))?;
        if !status.is_success() {
            return Err(self.backend_error(format!("HTTP {}", status), Some(text)));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&text)
            .map_err(|e| self.backend_error(format!("Unreadable response: {}", e), Some(text.clone())))?;
        let content: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(self.backend_error("Response contained no text".to_string(), Some(text)));
        }

        Ok(ChatMessage {
            role: Role::Assistant,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoModel {
        seen: Mutex<Vec<ChatMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl ChatModel for EchoModel {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
            self.seen.lock().unwrap().extend(messages.iter().cloned());
            if self.fail {
                return Err(EtlError::ParseError {
                    message: "boom".to_string(),
                });
            }
            Ok(ChatMessage {
                role: Role::Assistant,
                content: "[]".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_backend_sends_system_then_human() {
        let backend = ChatModelBackend::new(
            "gemini",
            EchoModel {
                seen: Mutex::new(Vec::new()),
                fail: false,
            },
        );
        let prompt = ChatPrompt {
            system: "rendered".to_string(),
            user: "go".to_string(),
        };

        assert_eq!(backend.complete(&prompt).await.unwrap(), "[]");
        let seen = backend.model.seen.lock().unwrap();
        assert_eq!(seen[0], ChatMessage::system("rendered"));
        assert_eq!(seen[1], ChatMessage::human("go"));
    }

    #[tokio::test]
    async fn test_backend_wraps_model_errors() {
        let backend = ChatModelBackend::new(
            "gemini",
            EchoModel {
                seen: Mutex::new(Vec::new()),
                fail: true,
            },
        );
        let prompt = ChatPrompt {
            system: "s".to_string(),
            user: "u".to_string(),
        };

        let err = backend.complete(&prompt).await.unwrap_err();
        assert!(matches!(err, EtlError::BackendError { ref provider, .. } if provider == "gemini"));
    }
}
