pub mod chat_completions;
pub mod chat_model;
pub mod feishu;
pub mod storage;

use crate::domain::ports::AnalysisBackend;
use crate::utils::error::{EtlError, Result};
use chat_completions::{ChatCompletionsBackend, DEEPSEEK_BASE_URL, QWEN_BASE_URL};
use chat_model::{ChatModelBackend, GeminiChatModel, GEMINI_BASE_URL};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// 可選的分析模型供應商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// 經由 ChatModel 抽象呼叫 Gemini
    Gemini,
    /// OpenAI 相容的 chat completions
    Deepseek,
    Qwen,
    ChatCompletions,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::Deepseek => "deepseek",
            Provider::Qwen => "qwen",
            Provider::ChatCompletions => "chat_completions",
        }
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Provider::Gemini => Some(GEMINI_BASE_URL),
            Provider::Deepseek => Some(DEEPSEEK_BASE_URL),
            Provider::Qwen => Some(QWEN_BASE_URL),
            Provider::ChatCompletions => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Provider::Gemini),
            "deepseek" => Ok(Provider::Deepseek),
            "qwen" => Ok(Provider::Qwen),
            "chat_completions" | "openai" => Ok(Provider::ChatCompletions),
            other => Err(EtlError::InvalidConfigValueError {
                field: "analysis.provider".to_string(),
                value: other.to_string(),
                reason: "Supported providers: gemini, deepseek, qwen, chat_completions".to_string(),
            }),
        }
    }
}

/// 建立分析後端所需的已解析設定
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub provider: Provider,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout: Duration,
}

/// 依供應商建立對應的分析後端
pub fn build_backend(settings: &BackendSettings) -> Result<Arc<dyn AnalysisBackend>> {
    let base_url = settings
        .base_url
        .clone()
        .or_else(|| settings.provider.default_base_url().map(str::to_string))
        .ok_or_else(|| EtlError::MissingConfigError {
            field: "analysis.base_url".to_string(),
        })?;

    tracing::info!(
        "🤖 Analysis backend: {} (model {}, temperature {}, max tokens {})",
        settings.provider,
        settings.model,
        settings.temperature,
        settings.max_output_tokens
    );

    let backend: Arc<dyn AnalysisBackend> = match settings.provider {
        Provider::Gemini => {
            let model = GeminiChatModel::new(
                base_url,
                settings.api_key.clone(),
                settings.model.clone(),
                settings.timeout,
            )?
            .with_generation(settings.temperature, settings.max_output_tokens);
            Arc::new(ChatModelBackend::new(settings.provider.as_str(), model))
        }
        Provider::Deepseek | Provider::Qwen | Provider::ChatCompletions => Arc::new(
            ChatCompletionsBackend::new(
                settings.provider.as_str(),
                base_url,
                settings.api_key.clone(),
                settings.model.clone(),
                settings.timeout,
            )?
            .with_generation(settings.temperature, settings.max_output_tokens),
        ),
    };

    Ok(backend)
}
