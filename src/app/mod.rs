use crate::adapters::build_backend;
use crate::adapters::feishu::{BitableReader, BitableWriter, FeishuClient};
use crate::adapters::storage::{JsonlLog, RawOutputDir};
use crate::config::toml_config::TomlConfig;
use crate::core::auth::TokenManager;
use crate::core::etl::EtlEngine;
use crate::core::normalizer::ResponseNormalizer;
use crate::core::sink::Sink;
use crate::core::source::PagedRecordSource;
use crate::domain::model::TokenScope;
use crate::utils::error::Result;
use std::sync::Arc;

/// 依配置建立飛書客戶端（含讀寫兩組憑證）
pub fn feishu_client(config: &TomlConfig) -> Result<FeishuClient> {
    Ok(
        FeishuClient::new(config.feishu_base_url(), config.request_timeout())?
            .with_credentials(TokenScope::Read, config.credentials(TokenScope::Read))
            .with_credentials(TokenScope::Write, config.credentials(TokenScope::Write)),
    )
}

pub fn token_manager(config: &TomlConfig, client: &FeishuClient) -> TokenManager {
    TokenManager::new(Arc::new(client.clone()))
        .with_static_token(TokenScope::Read, config.static_token(TokenScope::Read))
        .with_static_token(TokenScope::Write, config.static_token(TokenScope::Write))
        .with_refresh_margin(config.token_refresh_margin())
}

/// 組裝完整的 ETL 引擎；配置須先通過驗證
pub fn build_engine(config: &TomlConfig) -> Result<EtlEngine> {
    let client = feishu_client(config)?;
    let tokens = Arc::new(token_manager(config, &client));

    let reader = BitableReader::new(
        client.clone(),
        config.source.app_token.clone(),
        config.source.table_id.clone(),
        config.source.view_id.clone(),
    );
    let source = Arc::new(PagedRecordSource::new(reader, tokens.clone()));

    let writer = BitableWriter::new(client, config.sink_app_token().to_string());
    let mut sink = Sink::new(
        Arc::new(JsonlLog::new(&config.sink.local_log_path)),
        Arc::new(writer),
        config.sink.table_id.clone(),
    )
    .with_chunk_size(config.remote_batch_limit());
    if let Some(mapping) = &config.sink.field_mapping {
        sink = sink.with_field_mapping(mapping.clone());
    }

    let backend = build_backend(&config.backend_settings()?)?;
    let template = config.load_template()?;
    let normalizer = ResponseNormalizer::new(config.numeric_fields());

    let mut engine = EtlEngine::new(
        source,
        backend,
        Arc::new(sink),
        tokens,
        template,
        normalizer,
        config.pipeline_settings(),
    );
    if let Some(dir) = &config.sink.raw_output_dir {
        engine = engine.with_raw_output_store(Arc::new(RawOutputDir::new(dir)));
    }

    Ok(engine)
}
