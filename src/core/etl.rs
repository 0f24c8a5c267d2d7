use crate::core::analysis::{analyze, InstructionTemplate};
use crate::core::auth::TokenManager;
use crate::core::normalizer::ResponseNormalizer;
use crate::core::sink::Sink;
use crate::core::{batcher, dedup};
use crate::domain::model::{
    AnalysisOutcome, Batch, BatchReport, BatchStatus, RunSummary, TokenScope,
};
use crate::domain::ports::{AnalysisBackend, RawOutputStore, RecordSource};
use crate::utils::error::{EtlError, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// 已解析的執行參數
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub key_field: String,
    /// 讀取的欄位允許清單（含識別欄位）
    pub fields: Vec<String>,
    pub batch_size: usize,
    pub workers: usize,
}

/// 批次處理計畫：讀取、去重、分批後的結果
#[derive(Debug)]
pub struct RunPlan {
    pub fetched: usize,
    pub unique: usize,
    pub batches: Vec<Batch>,
}

/// 單一 worker 需要的共享元件
#[derive(Clone)]
struct BatchWorker {
    backend: Arc<dyn AnalysisBackend>,
    normalizer: Arc<ResponseNormalizer>,
    template: Arc<InstructionTemplate>,
    sink: Arc<Sink>,
    tokens: Arc<TokenManager>,
    raw_store: Option<Arc<dyn RawOutputStore>>,
    key_field: String,
}

pub struct EtlEngine {
    source: Arc<dyn RecordSource>,
    worker: BatchWorker,
    settings: PipelineSettings,
}

impl EtlEngine {
    pub fn new(
        source: Arc<dyn RecordSource>,
        backend: Arc<dyn AnalysisBackend>,
        sink: Arc<Sink>,
        tokens: Arc<TokenManager>,
        template: InstructionTemplate,
        normalizer: ResponseNormalizer,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            worker: BatchWorker {
                backend,
                normalizer: Arc::new(normalizer),
                template: Arc::new(template),
                sink,
                tokens,
                raw_store: None,
                key_field: settings.key_field.clone(),
            },
            settings,
        }
    }

    pub fn with_raw_output_store(mut self, store: Arc<dyn RawOutputStore>) -> Self {
        self.worker.raw_store = Some(store);
        self
    }

    /// 讀取、去重並分批；任何錯誤都會中止整個執行
    pub async fn plan(&self) -> Result<RunPlan> {
        let records = self.source.fetch(&self.settings.fields).await?;
        let fetched = records.len();

        let unique_records = dedup::dedupe(records, &self.settings.key_field);
        let unique = unique_records.len();

        let batches = batcher::partition(unique_records, self.settings.batch_size)?;
        tracing::info!(
            "📋 Plan: {} fetched, {} unique, {} batches (size {}, workers {})",
            fetched,
            unique,
            batches.len(),
            self.settings.batch_size,
            self.settings.workers
        );

        Ok(RunPlan {
            fetched,
            unique,
            batches,
        })
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        tracing::info!("🚀 Starting analysis run");

        // 寫入 token 先行取得，認證設定錯誤時不做任何分析
        self.worker.tokens.acquire(TokenScope::Write).await?;

        let plan = self.plan().await?;
        let reports = self.run_batches(plan.batches).await?;
        let summary = RunSummary::from_reports(plan.fetched, plan.unique, reports);

        tracing::info!(
            "🏁 Run finished in {:?}: {} succeeded, {} failed, {} records written",
            started.elapsed(),
            summary.succeeded,
            summary.failed,
            summary.written
        );
        for failed in summary.failed_batches() {
            if let BatchStatus::Failed {
                category,
                message,
                written,
            } = &failed.status
            {
                tracing::warn!(
                    "⚠️ Batch {} failed ({:?}, {} records written): {}",
                    failed.index,
                    category,
                    written,
                    message
                );
            }
        }

        Ok(summary)
    }

    /// 以固定數量的 worker 並行處理批次；單一批次的失敗不影響其他批次
    pub async fn run_batches(&self, batches: Vec<Batch>) -> Result<Vec<BatchReport>> {
        if self.settings.workers == 0 {
            return Err(EtlError::InvalidConfigValueError {
                field: "execution.workers".to_string(),
                value: "0".to_string(),
                reason: "At least one worker is required".to_string(),
            });
        }

        let permits = Arc::new(Semaphore::new(self.settings.workers));
        let mut handles = Vec::with_capacity(batches.len());

        for batch in batches {
            let permits = permits.clone();
            let worker = self.worker.clone();
            let index = batch.index;
            let record_count = batch.len();
            let keys = batch.keys(&self.settings.key_field);

            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| EtlError::WorkerError {
                        batch: index,
                        message: e.to_string(),
                    })?;
                Ok::<_, EtlError>(worker.process(batch).await)
            });
            handles.push((index, record_count, keys, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (index, record_count, keys, handle) in handles {
            let report = match handle.await {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => failed_report(index, record_count, keys, &e),
                Err(join_err) => {
                    tracing::error!("❌ Batch {} worker aborted: {}", index, join_err);
                    let e = EtlError::WorkerError {
                        batch: index,
                        message: join_err.to_string(),
                    };
                    failed_report(index, record_count, keys, &e)
                }
            };
            reports.push(report);
        }

        Ok(reports)
    }
}

fn failed_report(
    index: usize,
    record_count: usize,
    keys: Vec<serde_json::Value>,
    e: &EtlError,
) -> BatchReport {
    BatchReport {
        index,
        record_count,
        keys,
        status: BatchStatus::Failed {
            category: e.category(),
            message: e.to_string(),
            written: 0,
        },
        local_log_warning: None,
    }
}

impl BatchWorker {
    /// analyze → normalize → 本地記錄 → 遠端寫入，在 worker 內依序執行
    async fn process(&self, batch: Batch) -> BatchReport {
        let started = Instant::now();
        let mut report = BatchReport {
            index: batch.index,
            record_count: batch.len(),
            keys: batch.keys(&self.key_field),
            status: BatchStatus::Succeeded { written: 0 },
            local_log_warning: None,
        };

        let (outcome, raw_text) = analyze(
            self.backend.as_ref(),
            &self.normalizer,
            &batch,
            &self.template,
        )
        .await;

        if let (Some(store), Some(raw)) = (&self.raw_store, raw_text.as_deref()) {
            if let Err(e) = store.save(self.backend.provider(), batch.index, raw).await {
                tracing::warn!("⚠️ Batch {}: could not archive raw output: {}", batch.index, e);
            }
        }

        let results = match outcome {
            AnalysisOutcome::Parsed(results) => results,
            AnalysisOutcome::Failed(failure) => {
                if let Err(e) = self
                    .sink
                    .write_failure_marker(
                        batch.index,
                        failure.category.as_str(),
                        &failure.message,
                        failure.raw_text.as_deref(),
                    )
                    .await
                {
                    tracing::warn!("⚠️ Batch {}: local log append failed: {}", batch.index, e);
                    report.local_log_warning = Some(e.to_string());
                }
                report.status = BatchStatus::Failed {
                    category: failure.category,
                    message: failure.message,
                    written: 0,
                };
                return report;
            }
        };

        let results = self.sink.apply_field_mapping(results);
        tracing::info!(
            "🧾 Batch {}: {} analysis records from {} inputs",
            batch.index,
            results.len(),
            batch.len()
        );

        if let Err(e) = self.sink.write_local(&results).await {
            tracing::warn!("⚠️ Batch {}: local log append failed: {}", batch.index, e);
            report.local_log_warning = Some(e.to_string());
        }

        if results.is_empty() {
            return report;
        }

        report.status = match self.sink.write_remote(&results, &self.tokens).await {
            Ok(written) => {
                tracing::info!(
                    "✅ Batch {}: wrote {} records in {:?}",
                    batch.index,
                    written,
                    started.elapsed()
                );
                BatchStatus::Succeeded { written }
            }
            Err((written, e)) => {
                tracing::error!(
                    "❌ Batch {}: remote write failed after {} of {} records: {}",
                    batch.index,
                    written,
                    results.len(),
                    e
                );
                BatchStatus::Failed {
                    category: e.category(),
                    message: format!(
                        "{} ({} of {} records written before the failure)",
                        e,
                        written,
                        results.len()
                    ),
                    written,
                }
            }
        };

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::analysis::DEFAULT_PLACEHOLDER;
    use crate::domain::model::{Record, Token, WriteRequest};
    use crate::domain::ports::{ChatPrompt, IssuedToken, LocalLog, RemoteSink, TokenFetcher};
    use crate::utils::error::ErrorCategory;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct MemorySource {
        records: Vec<Record>,
    }

    #[async_trait]
    impl RecordSource for MemorySource {
        async fn fetch(&self, _fields: &[String]) -> Result<Vec<Record>> {
            Ok(self.records.clone())
        }
    }

    /// 依批次內容逐筆回傳 {id, label}；設定 first_delay 時第一次呼叫先停頓
    struct EchoBackend {
        calls: AtomicUsize,
        first_delay: Option<std::time::Duration>,
    }

    #[async_trait]
    impl AnalysisBackend for EchoBackend {
        fn provider(&self) -> &str {
            "echo"
        }

        async fn complete(&self, prompt: &ChatPrompt) -> Result<String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(delay) = self.first_delay {
                    tokio::time::sleep(delay).await;
                }
            }
            let rows: Vec<Value> = serde_json::from_str(&prompt.system)?;
            let results: Vec<Value> = rows
                .iter()
                .map(|r| json!({"id": r["id"], "label": "ok"}))
                .collect();
            Ok(Value::Array(results).to_string())
        }
    }

    #[derive(Default)]
    struct MemoryLog {
        lines: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl LocalLog for MemoryLog {
        async fn append(&self, lines: &[Value]) -> Result<()> {
            self.lines.lock().await.extend_from_slice(lines);
            Ok(())
        }
    }

    struct ReadOnlyLog;

    #[async_trait]
    impl LocalLog for ReadOnlyLog {
        async fn append(&self, _lines: &[Value]) -> Result<()> {
            Err(EtlError::IoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "results.jsonl is read-only",
            )))
        }
    }

    #[derive(Default)]
    struct RecordingRemote {
        written: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl RemoteSink for RecordingRemote {
        async fn batch_create(&self, request: &WriteRequest, _token: &Token) -> Result<usize> {
            let mut written = self.written.lock().await;
            written.extend(request.records.iter().map(|r| r["id"].clone()));
            Ok(request.records.len())
        }
    }

    /// 第一個 token 只活一秒；第 fail_on 次請求被拒，其餘核發長效 token
    struct FlakyFetcher {
        calls: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl TokenFetcher for FlakyFetcher {
        async fn fetch_token(&self, scope: TokenScope) -> Result<IssuedToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == self.fail_on {
                return Err(EtlError::AuthError {
                    scope: scope.to_string(),
                    message: "app_secret was rotated".to_string(),
                });
            }
            Ok(IssuedToken {
                value: format!("t-write-{}", n + 1),
                ttl_seconds: if n == 0 { 1 } else { 3600 },
            })
        }
    }

    fn records(ids: &[i64]) -> Vec<Record> {
        ids.iter()
            .map(|id| match json!({"id": id, "dialogue": format!("dialogue {}", id)}) {
                Value::Object(map) => Record::new(map),
                _ => unreachable!(),
            })
            .collect()
    }

    fn engine(
        ids: &[i64],
        backend: EchoBackend,
        sink: Sink,
        tokens: TokenManager,
        batch_size: usize,
    ) -> EtlEngine {
        EtlEngine::new(
            Arc::new(MemorySource {
                records: records(ids),
            }),
            Arc::new(backend),
            Arc::new(sink),
            Arc::new(tokens),
            InstructionTemplate::new(DEFAULT_PLACEHOLDER, DEFAULT_PLACEHOLDER).unwrap(),
            ResponseNormalizer::new(vec![]),
            PipelineSettings {
                key_field: "id".to_string(),
                fields: vec!["id".to_string(), "dialogue".to_string()],
                batch_size,
                workers: 1,
            },
        )
    }

    fn echo() -> EchoBackend {
        EchoBackend {
            calls: AtomicUsize::new(0),
            first_delay: None,
        }
    }

    /// 本地記錄寫入失敗只留下警告，遠端寫入照常進行
    #[tokio::test]
    async fn test_local_log_failure_does_not_block_remote_write() {
        let remote = Arc::new(RecordingRemote::default());
        let sink = Sink::new(Arc::new(ReadOnlyLog), remote.clone(), "tbl".to_string());
        let tokens = TokenManager::new(Arc::new(FlakyFetcher {
            calls: AtomicUsize::new(0),
            fail_on: 0,
        }))
        .with_static_token(TokenScope::Write, Some("t-static".to_string()));
        let engine = engine(&[1, 2], echo(), sink, tokens, 10);
        let batch = Batch {
            index: 0,
            records: records(&[1, 2]),
        };

        let reports = engine.run_batches(vec![batch]).await.unwrap();

        assert_eq!(reports[0].status, BatchStatus::Succeeded { written: 2 });
        let warning = reports[0].local_log_warning.as_deref().unwrap();
        assert!(warning.contains("read-only"));
        assert_eq!(*remote.written.lock().await, vec![json!(1), json!(2)]);
    }

    /// 寫入 token 在批次途中刷新失敗：只有該批次以認證錯誤結束
    #[tokio::test]
    async fn test_write_token_refresh_failure_fails_only_that_batch() {
        let remote = Arc::new(RecordingRemote::default());
        let log = Arc::new(MemoryLog::default());
        let sink = Sink::new(log.clone(), remote.clone(), "tbl".to_string());
        let tokens = TokenManager::new(Arc::new(FlakyFetcher {
            calls: AtomicUsize::new(0),
            fail_on: 1,
        }));
        let backend = EchoBackend {
            calls: AtomicUsize::new(0),
            first_delay: Some(std::time::Duration::from_millis(1100)),
        };
        let engine = engine(&[1, 2, 3, 4], backend, sink, tokens, 2);

        let summary = engine.run().await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.written, 2);
        let failed = summary.failed_batches().next().unwrap();
        match &failed.status {
            BatchStatus::Failed {
                category, written, ..
            } => {
                assert_eq!(*category, ErrorCategory::Auth);
                assert_eq!(*written, 0);
            }
            other => panic!("unexpected status: {:?}", other),
        }
        assert_eq!(remote.written.lock().await.len(), 2);
        // 兩個批次的分析結果都已落地
        assert_eq!(log.lines.lock().await.len(), 4);
    }
}
