use crate::utils::error::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 一列資料：欄位名稱 → 純量或 null，保留遠端回傳的欄位順序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub data: Map<String, Value>,
}

impl Record {
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// 取得識別欄位的值；缺少或為 null 時回傳 None
    pub fn key(&self, key_field: &str) -> Option<&Value> {
        self.data.get(key_field).filter(|v| !v.is_null())
    }
}

impl From<Map<String, Value>> for Record {
    fn from(data: Map<String, Value>) -> Self {
        Self { data }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub index: usize,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 序列化為 JSON 陣列，用於替換指令模板中的佔位符
    pub fn to_json(&self) -> crate::utils::error::Result<String> {
        let rows: Vec<&Map<String, Value>> = self.records.iter().map(|r| &r.data).collect();
        Ok(serde_json::to_string(&rows)?)
    }

    pub fn keys(&self, key_field: &str) -> Vec<Value> {
        self.records
            .iter()
            .filter_map(|r| r.key(key_field).cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisFailure {
    pub category: ErrorCategory,
    pub message: String,
    pub raw_text: Option<String>,
}

/// 分析結果：結構化記錄或錯誤描述，二者擇一
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Parsed(Vec<Map<String, Value>>),
    Failed(AnalysisFailure),
}

impl AnalysisOutcome {
    pub fn parse_error(message: impl Into<String>, raw_text: &str) -> Self {
        AnalysisOutcome::Failed(AnalysisFailure {
            category: ErrorCategory::Parse,
            message: message.into(),
            raw_text: Some(raw_text.to_string()),
        })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, AnalysisOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenScope {
    Read,
    Write,
}

impl std::fmt::Display for TokenScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenScope::Read => write!(f, "read"),
            TokenScope::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub value: String,
    pub scope: TokenScope,
    /// None 表示靜態 token，不追蹤過期
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

/// 單次批次寫入請求，大小受遠端 API 上限約束
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteRequest {
    pub table_id: String,
    pub records: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    Succeeded { written: usize },
    /// written 為失敗前已寫入遠端的筆數
    Failed {
        category: ErrorCategory,
        message: String,
        written: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub record_count: usize,
    /// 該批次的識別鍵，供只重跑失敗批次使用
    pub keys: Vec<Value>,
    #[serde(flatten)]
    pub status: BatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_log_warning: Option<String>,
}

impl BatchReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, BatchStatus::Succeeded { .. })
    }

    pub fn written(&self) -> usize {
        match self.status {
            BatchStatus::Succeeded { written } | BatchStatus::Failed { written, .. } => written,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub fetched: usize,
    pub unique: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub written: usize,
    pub batches: Vec<BatchReport>,
}

impl RunSummary {
    pub fn from_reports(fetched: usize, unique: usize, mut batches: Vec<BatchReport>) -> Self {
        batches.sort_by_key(|b| b.index);
        let succeeded = batches.iter().filter(|b| b.succeeded()).count();
        let written = batches.iter().map(BatchReport::written).sum();

        Self {
            fetched,
            unique,
            succeeded,
            failed: batches.len() - succeeded,
            written,
            batches,
        }
    }

    pub fn failed_batches(&self) -> impl Iterator<Item = &BatchReport> {
        self.batches.iter().filter(|b| !b.succeeded())
    }
}
