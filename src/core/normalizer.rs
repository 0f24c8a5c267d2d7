use crate::domain::model::AnalysisOutcome;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn formal_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<formal>\s*(.*?)\s*</formal>").expect("valid regex"))
}

fn json_fenced_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?si)```json\b[ \t]*\r?\n?(.*?)```").expect("valid regex"))
}

fn fenced_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // 任意語言標記或不帶標記的 ``` ... ```
    RE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("valid regex"))
}

/// 將模型輸出的自由文字還原為結構化記錄。
///
/// 依序嘗試 `<formal>` 區塊、標記為 json 的 code fence、其他 code fence，
/// 否則使用原文；
/// 原文無法解析時再以最外層 `[...]` 片段重試。任何失敗都回傳
/// `AnalysisOutcome::Failed` 並保留原文，不會 panic 或向外拋錯。
#[derive(Debug, Clone)]
pub struct ResponseNormalizer {
    numeric_fields: Vec<String>,
}

impl ResponseNormalizer {
    pub fn new(numeric_fields: Vec<String>) -> Self {
        Self { numeric_fields }
    }

    pub fn normalize(&self, raw_text: &str) -> AnalysisOutcome {
        let candidate = extract_payload(raw_text);

        let parsed = match serde_json::from_str::<Value>(candidate) {
            Ok(value) => value,
            Err(first_err) => match bracket_slice(candidate)
                .and_then(|slice| serde_json::from_str::<Value>(slice).ok())
            {
                Some(value) => {
                    tracing::debug!("🩹 Recovered JSON array from surrounding text");
                    value
                }
                None => {
                    tracing::warn!("⚠️ Failed to parse analysis output as JSON: {}", first_err);
                    return AnalysisOutcome::parse_error(
                        format!("Failed to parse JSON response: {}", first_err),
                        raw_text,
                    );
                }
            },
        };

        let items = match parsed {
            Value::Array(items) => items,
            Value::Object(obj) => vec![Value::Object(obj)],
            other => {
                return AnalysisOutcome::parse_error(
                    format!("Expected a JSON array or object, got {}", json_kind(&other)),
                    raw_text,
                );
            }
        };

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Object(mut obj) => {
                    self.coerce_numeric(&mut obj);
                    results.push(obj);
                }
                other => {
                    return AnalysisOutcome::parse_error(
                        format!("Expected JSON objects in the array, got {}", json_kind(&other)),
                        raw_text,
                    );
                }
            }
        }

        AnalysisOutcome::Parsed(results)
    }

    /// 字串形式的整數轉為數字；轉換失敗則保持原值
    fn coerce_numeric(&self, obj: &mut Map<String, Value>) {
        for field in &self.numeric_fields {
            if let Some(value) = obj.get_mut(field) {
                if let Some(n) = value.as_str().and_then(|s| s.trim().parse::<i64>().ok()) {
                    *value = Value::from(n);
                }
            }
        }
    }
}

fn extract_payload(raw_text: &str) -> &str {
    if let Some(inner) = formal_block().captures(raw_text).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    if let Some(inner) = json_fenced_block().captures(raw_text).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    if let Some(inner) = fenced_block().captures(raw_text).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    raw_text.trim()
}

fn bracket_slice(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
