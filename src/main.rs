use analysis_etl::app;
use analysis_etl::utils::error::{EtlError, ErrorSeverity};
use analysis_etl::utils::{logger, validation::Validate};
use analysis_etl::{CliConfig, TomlConfig};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliConfig::parse();

    // 初始化日誌
    if args.json_logs {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("🚀 Starting analysis-etl");
    tracing::info!("📁 Loading configuration from: {}", args.config);

    // 載入 TOML 配置
    let mut config = match TomlConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", args.config, e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    // 應用命令列覆蓋設定
    args.apply_overrides(&mut config);

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    tracing::info!("✅ Configuration loaded and validated successfully");
    display_config_summary(&config, &args);

    let engine = match app::build_engine(&config) {
        Ok(engine) => engine,
        Err(e) => exit_with(e),
    };

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - no analysis or writes will occur");
        match engine.plan().await {
            Ok(plan) => {
                println!("🔍 Dry run plan:");
                println!("  Fetched records: {}", plan.fetched);
                println!("  Unique records: {}", plan.unique);
                println!("  Batches: {}", plan.batches.len());
                for batch in &plan.batches {
                    println!("    #{}: {} records", batch.index, batch.len());
                }
            }
            Err(e) => exit_with(e),
        }
        return Ok(());
    }

    match engine.run().await {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if summary.failed > 0 {
                eprintln!(
                    "⚠️ {} of {} batches failed; see the summary above and re-run them",
                    summary.failed,
                    summary.batches.len()
                );
                std::process::exit(2);
            }
            println!("✅ Analysis completed: {} records written", summary.written);
        }
        Err(e) => exit_with(e),
    }

    Ok(())
}

fn exit_with(e: EtlError) -> ! {
    // 記錄詳細錯誤信息
    tracing::error!(
        "❌ Run failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    // 輸出用戶友好的錯誤信息
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());

    // 根據錯誤嚴重程度決定退出碼
    let exit_code = match e.severity() {
        ErrorSeverity::Low | ErrorSeverity::High => 1,
        ErrorSeverity::Medium => 2,
        ErrorSeverity::Critical => 3,
    };
    std::process::exit(exit_code);
}

fn display_config_summary(config: &TomlConfig, args: &CliConfig) {
    println!("📋 Configuration Summary:");
    println!(
        "  Source: {}/{} (view {})",
        config.source.app_token,
        config.source.table_id,
        config.source.view_id.as_deref().unwrap_or("-")
    );
    println!("  Sink: {}/{}", config.sink_app_token(), config.sink.table_id);
    println!("  Local log: {}", config.sink.local_log_path);
    println!(
        "  Provider: {} ({})",
        config.analysis.provider, config.analysis.model
    );
    println!(
        "  Batch size: {}, workers: {}",
        config.batch_size(),
        config.workers()
    );

    if args.dry_run {
        println!("  🔍 DRY RUN MODE ENABLED");
    }

    println!();
}
