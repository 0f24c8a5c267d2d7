use crate::core::{Batch, Record};
use crate::utils::error::{EtlError, Result};

/// 將去重後的記錄依序切成固定大小的批次，最後一批可能較小。
pub fn partition(records: Vec<Record>, size: usize) -> Result<Vec<Batch>> {
    if size == 0 {
        return Err(EtlError::InvalidConfigValueError {
            field: "execution.batch_size".to_string(),
            value: size.to_string(),
            reason: "Batch size must be at least 1".to_string(),
        });
    }

    let mut batches = Vec::with_capacity(records.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);

    for record in records {
        current.push(record);
        if current.len() == size {
            batches.push(Batch {
                index: batches.len(),
                records: std::mem::replace(&mut current, Vec::with_capacity(size)),
            });
        }
    }
    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            records: current,
        });
    }

    tracing::debug!("📦 Partitioned into {} batches of up to {}", batches.len(), size);
    Ok(batches)
}
