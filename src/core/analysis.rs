use crate::core::normalizer::ResponseNormalizer;
use crate::domain::model::{AnalysisFailure, AnalysisOutcome, Batch};
use crate::domain::ports::{AnalysisBackend, ChatPrompt};
use crate::utils::error::{EtlError, Result};

pub const DEFAULT_PLACEHOLDER: &str = "{{TRANSACTION}}";

/// 使用者輪次的固定指示，批次資料已嵌入系統提示中
pub const USER_DIRECTIVE: &str =
    "Analyze the data provided in the system instructions and respond in the required format.";

/// 含單一佔位符的指令模板
#[derive(Debug, Clone)]
pub struct InstructionTemplate {
    text: String,
    placeholder: String,
}

impl InstructionTemplate {
    pub fn new(text: impl Into<String>, placeholder: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let placeholder = placeholder.into();

        if placeholder.is_empty() {
            return Err(EtlError::ConfigError {
                message: "Instruction template placeholder cannot be empty".to_string(),
            });
        }
        match text.matches(placeholder.as_str()).count() {
            1 => Ok(Self { text, placeholder }),
            n => Err(EtlError::ConfigValidationError {
                field: "analysis.template_path".to_string(),
                message: format!(
                    "Template must contain exactly one '{}' placeholder, found {}",
                    placeholder, n
                ),
            }),
        }
    }

    pub fn render(&self, batch_json: &str) -> String {
        self.text.replace(&self.placeholder, batch_json)
    }

    pub fn prompt_for(&self, batch: &Batch) -> Result<ChatPrompt> {
        Ok(ChatPrompt {
            system: self.render(&batch.to_json()?),
            user: USER_DIRECTIVE.to_string(),
        })
    }
}

/// 呼叫分析後端並正規化其輸出；後端錯誤轉為 Failed，不向外傳遞
pub async fn analyze(
    backend: &dyn AnalysisBackend,
    normalizer: &ResponseNormalizer,
    batch: &Batch,
    template: &InstructionTemplate,
) -> (AnalysisOutcome, Option<String>) {
    let prompt = match template.prompt_for(batch) {
        Ok(prompt) => prompt,
        Err(e) => {
            return (
                AnalysisOutcome::Failed(AnalysisFailure {
                    category: e.category(),
                    message: e.to_string(),
                    raw_text: None,
                }),
                None,
            )
        }
    };

    tracing::info!(
        "🤖 Batch {}: sending {} records to {}",
        batch.index,
        batch.len(),
        backend.provider()
    );

    match backend.complete(&prompt).await {
        Ok(raw_text) => {
            tracing::debug!("🤖 Batch {}: received {} chars", batch.index, raw_text.len());
            let outcome = normalizer.normalize(&raw_text);
            (outcome, Some(raw_text))
        }
        Err(e) => {
            tracing::error!("❌ Batch {}: {} call failed: {}", batch.index, backend.provider(), e);
            let raw_text = e.raw_response().map(str::to_string);
            (
                AnalysisOutcome::Failed(AnalysisFailure {
                    category: e.category(),
                    message: e.to_string(),
                    raw_text: raw_text.clone(),
                }),
                raw_text,
            )
        }
    }
}
