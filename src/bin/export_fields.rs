use analysis_etl::adapters::feishu::BitableReader;
use analysis_etl::app;
use analysis_etl::core::query;
use analysis_etl::core::source::PagedRecordSource;
use analysis_etl::domain::model::TokenScope;
use analysis_etl::domain::ports::RecordSource;
use analysis_etl::utils::logger;
use analysis_etl::TomlConfig;
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "export_fields")]
#[command(about = "Export the field catalogue of a Feishu table as JSON")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Export the sink table instead of the source table
    #[arg(long)]
    sink: bool,

    /// Output file
    #[arg(short, long, default_value = "fields.json")]
    output: PathBuf,

    /// Also write a blank record template built from the field types
    #[arg(long)]
    gen_template: Option<PathBuf>,

    /// Export every record submitted by this person, with all fields filled in
    #[arg(long)]
    user_records: Option<String>,

    /// Output file for --user-records (default: <name>_records.json)
    #[arg(long)]
    user_output: Option<PathBuf>,

    /// Field holding the submitter name
    #[arg(long, default_value = "提交人")]
    submitter_field: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init_cli_logger(args.verbose);
    if args.sink && args.user_records.is_some() {
        anyhow::bail!("--user-records reads the source table; drop --sink");
    }

    let config = TomlConfig::from_file(&args.config)?;
    let (scope, app_token, table_id) = if args.sink {
        (
            TokenScope::Write,
            config.sink_app_token().to_string(),
            config.sink.table_id.clone(),
        )
    } else {
        (
            TokenScope::Read,
            config.source.app_token.clone(),
            config.source.table_id.clone(),
        )
    };

    let client = app::feishu_client(&config)?;
    let tokens = Arc::new(app::token_manager(&config, &client));
    let token = tokens.acquire(scope).await?;

    tracing::info!("📡 Listing fields of {}/{}", app_token, table_id);
    let fields = client.list_fields(&token, &app_token, &table_id).await?;

    write_json(&args.output, &fields)?;
    println!("✅ Exported {} fields to {}", fields.len(), args.output.display());

    if let Some(path) = &args.gen_template {
        write_json(path, &query::blank_template(&fields))?;
        println!("✅ Blank template written to {}", path.display());
    }

    if let Some(submitter) = &args.user_records {
        let field_names: Vec<String> = fields
            .iter()
            .filter_map(|f| f["field_name"].as_str().map(str::to_string))
            .collect();

        let reader = BitableReader::new(
            client,
            app_token,
            table_id,
            config.source.view_id.clone(),
        );
        let records = PagedRecordSource::new(reader, tokens).fetch(&field_names).await?;
        let rows = query::submitter_records(
            &records,
            &args.submitter_field,
            submitter,
            &field_names,
            &config.source.key_field,
        );

        if rows.is_empty() {
            println!("⚠️ No records submitted by '{}'", submitter);
            return Ok(());
        }
        let path = args
            .user_output
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}_records.json", submitter)));
        write_json(&path, &rows)?;
        println!("✅ {} records of '{}' written to {}", rows.len(), submitter, path.display());
    }

    Ok(())
}
