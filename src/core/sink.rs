use crate::core::auth::TokenManager;
use crate::domain::model::{TokenScope, WriteRequest};
use crate::domain::ports::{LocalLog, RemoteSink};
use crate::utils::error::{EtlError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// 飛書多維表格 batch_create 單次上限
pub const REMOTE_BATCH_LIMIT: usize = 500;

/// 分析結果的落地：本地 JSONL 追加與遠端表格批次寫入
pub struct Sink {
    local: Arc<dyn LocalLog>,
    remote: Arc<dyn RemoteSink>,
    table_id: String,
    chunk_size: usize,
    field_mapping: HashMap<String, String>,
}

impl Sink {
    pub fn new(local: Arc<dyn LocalLog>, remote: Arc<dyn RemoteSink>, table_id: String) -> Self {
        Self {
            local,
            remote,
            table_id,
            chunk_size: REMOTE_BATCH_LIMIT,
            field_mapping: HashMap::new(),
        }
    }

    /// 設定每次寫入的筆數，不會超過遠端上限
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, REMOTE_BATCH_LIMIT);
        self
    }

    pub fn with_field_mapping(mut self, field_mapping: HashMap<String, String>) -> Self {
        self.field_mapping = field_mapping;
        self
    }

    /// 依 field_mapping 重新命名欄位（舊名 → 新名），保留順序。
    ///
    /// 新名稱已被同一列的其他欄位佔用時不改名，保留原欄位，不覆蓋任何值。
    pub fn apply_field_mapping(&self, records: Vec<Map<String, Value>>) -> Vec<Map<String, Value>> {
        if self.field_mapping.is_empty() {
            return records;
        }
        records
            .into_iter()
            .map(|record| self.rename_fields(record))
            .collect()
    }

    fn rename_fields(&self, record: Map<String, Value>) -> Map<String, Value> {
        let mut renamed = Map::with_capacity(record.len());
        let mut collisions = Vec::new();

        for (key, value) in &record {
            let target = match self.field_mapping.get(key) {
                Some(mapped) if self.is_free_target(&record, &renamed, key, mapped) => mapped,
                Some(mapped) => {
                    collisions.push(format!("{} → {}", key, mapped));
                    key
                }
                None => key,
            };
            if renamed.contains_key(target) {
                collisions.push(format!("{} dropped", key));
                continue;
            }
            renamed.insert(target.clone(), value.clone());
        }

        if !collisions.is_empty() {
            tracing::warn!("⚠️ Field mapping skipped, target already present: {:?}", collisions);
        }
        renamed
    }

    /// 目標名稱未被保留原名的欄位或已改名的欄位佔用
    fn is_free_target(
        &self,
        record: &Map<String, Value>,
        renamed: &Map<String, Value>,
        source: &str,
        target: &str,
    ) -> bool {
        if renamed.contains_key(target) {
            return false;
        }
        record.keys().all(|other| {
            other == source || other != target || self.field_mapping.contains_key(other)
        })
    }

    pub async fn write_local(&self, records: &[Map<String, Value>]) -> Result<()> {
        let lines: Vec<Value> = records.iter().cloned().map(Value::Object).collect();
        self.local.append(&lines).await
    }

    /// 分析失敗時寫入一行標記，保留診斷資訊
    pub async fn write_failure_marker(
        &self,
        batch_index: usize,
        category: &str,
        message: &str,
        raw_response: Option<&str>,
    ) -> Result<()> {
        let line = serde_json::json!({
            "_batch": batch_index,
            "_error": category,
            "message": message,
            "raw_response": raw_response,
        });
        self.local.append(&[line]).await
    }

    pub fn chunk(&self, records: &[Map<String, Value>]) -> Vec<WriteRequest> {
        records
            .chunks(self.chunk_size)
            .map(|chunk| WriteRequest {
                table_id: self.table_id.clone(),
                records: chunk.to_vec(),
            })
            .collect()
    }

    /// 逐塊呼叫遠端 batch-create，每塊寫入前重新取得寫入 token；
    /// 任一塊失敗即回傳該錯誤與已寫入的筆數
    pub async fn write_remote(
        &self,
        records: &[Map<String, Value>],
        tokens: &TokenManager,
    ) -> std::result::Result<usize, (usize, EtlError)> {
        let mut written = 0;
        for (i, request) in self.chunk(records).iter().enumerate() {
            let token = match tokens.acquire(TokenScope::Write).await {
                Ok(token) => token,
                Err(e) => return Err((written, e)),
            };
            match self.remote.batch_create(request, &token).await {
                Ok(count) => {
                    tracing::debug!("💾 Chunk {} wrote {} records", i, count);
                    written += count;
                }
                Err(e) => {
                    if let EtlError::FieldNameNotFound { fields, .. } = &e {
                        tracing::error!("❌ Target table is missing fields: {:?}", fields);
                    }
                    return Err((written, e));
                }
            }
        }
        Ok(written)
    }
}
