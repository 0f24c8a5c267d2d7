use crate::domain::ports::{LocalLog, RawOutputStore};
use crate::utils::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// 僅追加的 JSON Lines 檔案；多個 worker 共用時以互斥鎖序列化寫入
#[derive(Debug)]
pub struct JsonlLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LocalLog for JsonlLog {
    async fn append(&self, lines: &[Value]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        // 先組成完整內容，一次寫入，避免與其他 worker 交錯
        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(&serde_json::to_string(line)?);
            buffer.push('\n');
        }

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!("💾 Appended {} lines to {}", lines.len(), self.path.display());
        Ok(())
    }
}

/// 原始模型輸出的存檔目錄
#[derive(Debug, Clone)]
pub struct RawOutputDir {
    base_path: PathBuf,
}

impl RawOutputDir {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

#[async_trait]
impl RawOutputStore for RawOutputDir {
    async fn save(&self, provider: &str, batch_index: usize, raw_text: &str) -> Result<String> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let file_name = format!(
            "{}_raw_output_batch{}_{}.txt",
            provider.replace(['/', ':', '\\'], "_"),
            batch_index,
            timestamp
        );
        let full_path = self.base_path.join(file_name);

        fs::create_dir_all(&self.base_path).await?;
        fs::write(&full_path, raw_text).await?;

        tracing::debug!("🗂️ Raw output for batch {} saved to {}", batch_index, full_path.display());
        Ok(full_path.to_string_lossy().to_string())
    }
}
