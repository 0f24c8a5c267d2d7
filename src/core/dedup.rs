use crate::core::Record;
use std::collections::HashSet;

/// 依識別欄位去重，保留第一次出現的記錄並維持原始順序。
///
/// 缺少識別欄位（或值為 null）的記錄原樣保留，不參與比對。
/// 比對為完全相等，不做大小寫或空白正規化。
pub fn dedupe(records: Vec<Record>, key_field: &str) -> Vec<Record> {
    let original_count = records.len();
    let mut seen = HashSet::new();
    let mut passthrough = 0usize;

    let kept: Vec<Record> = records
        .into_iter()
        .filter(|record| match record.key(key_field) {
            // Value 的 JSON 表示區分 "1" 與 1
            Some(value) => seen.insert(value.to_string()),
            None => {
                passthrough += 1;
                true
            }
        })
        .collect();

    if passthrough > 0 {
        tracing::warn!(
            "⚠️ {} records have no '{}' value and were kept without deduplication",
            passthrough,
            key_field
        );
    }
    tracing::info!(
        "🔄 Deduplicated {} -> {} records by '{}'",
        original_count,
        kept.len(),
        key_field
    );

    kept
}
