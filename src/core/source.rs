use crate::core::auth::TokenManager;
use crate::domain::model::{Record, TokenScope};
use crate::domain::ports::{RecordPager, RecordSource};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::Map;
use std::collections::HashSet;
use std::sync::Arc;

/// 以游標分頁讀取遠端表格，並只保留允許的欄位
pub struct PagedRecordSource<P: RecordPager> {
    pager: P,
    tokens: Arc<TokenManager>,
}

impl<P: RecordPager> PagedRecordSource<P> {
    pub fn new(pager: P, tokens: Arc<TokenManager>) -> Self {
        Self { pager, tokens }
    }
}

#[async_trait]
impl<P: RecordPager> RecordSource for PagedRecordSource<P> {
    async fn fetch(&self, fields: &[String]) -> Result<Vec<Record>> {
        if fields.is_empty() {
            return Err(EtlError::ConfigValidationError {
                field: "source.fields".to_string(),
                message: "Field allow-list must name at least one field".to_string(),
            });
        }

        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors = HashSet::new();
        let mut pages = 0usize;

        loop {
            // 每頁重新取得 token，長時間分頁時可跨過到期時間
            let token = self.tokens.acquire(TokenScope::Read).await?;
            let page = self
                .pager
                .fetch_page(&token, fields, cursor.as_deref())
                .await?;
            pages += 1;

            tracing::debug!(
                "📡 Page {}: {} items, has_more={}",
                pages,
                page.items.len(),
                page.has_more
            );
            let has_more = page.has_more;
            records.extend(page.items.into_iter().map(|r| filter_fields(r, fields)));

            match page.next_cursor.filter(|c| has_more && !c.is_empty()) {
                Some(next) => {
                    if !seen_cursors.insert(next.clone()) {
                        return Err(EtlError::PaginationError {
                            message: format!(
                                "Cursor '{}' was returned twice after {} pages",
                                next, pages
                            ),
                        });
                    }
                    cursor = Some(next);
                }
                None => break,
            }
        }

        tracing::info!("📥 Fetched {} records in {} pages", records.len(), pages);
        Ok(records)
    }
}

/// 依允許清單的順序重建欄位，清單外的欄位一律捨棄
pub fn filter_fields(record: Record, fields: &[String]) -> Record {
    let mut data = record.data;
    let mut filtered = Map::with_capacity(fields.len());
    for field in fields {
        if let Some(value) = data.remove(field) {
            filtered.insert(field.clone(), value);
        }
    }
    Record::new(filtered)
}
