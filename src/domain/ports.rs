use crate::domain::model::{Record, Token, TokenScope, WriteRequest};
use crate::utils::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// 由 token 端點核發的原始 token
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub value: String,
    pub ttl_seconds: i64,
}

#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch_token(&self, scope: TokenScope) -> Result<IssuedToken>;
}

/// 遠端分頁查詢的單頁結果
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub items: Vec<Record>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait RecordPager: Send + Sync {
    async fn fetch_page(
        &self,
        token: &Token,
        fields: &[String],
        cursor: Option<&str>,
    ) -> Result<RecordPage>;
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, fields: &[String]) -> Result<Vec<Record>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatPrompt {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    fn provider(&self) -> &str;

    /// 送出一次對話請求並回傳模型的原始文字輸出
    async fn complete(&self, prompt: &ChatPrompt) -> Result<String>;
}

#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// 每次呼叫對應遠端一次 batch-create
    async fn batch_create(&self, request: &WriteRequest, token: &Token) -> Result<usize>;
}

#[async_trait]
pub trait LocalLog: Send + Sync {
    /// 每個值寫成一行 JSON，僅追加
    async fn append(&self, lines: &[Value]) -> Result<()>;
}

#[async_trait]
pub trait RawOutputStore: Send + Sync {
    async fn save(&self, provider: &str, batch_index: usize, raw_text: &str) -> Result<String>;
}
