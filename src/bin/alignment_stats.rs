use analysis_etl::adapters::feishu::BitableReader;
use analysis_etl::app;
use analysis_etl::core::source::PagedRecordSource;
use analysis_etl::core::stats::{self, AlignmentInput, AlignmentReport, TableSummary};
use analysis_etl::domain::model::TokenScope;
use analysis_etl::domain::ports::RecordSource;
use analysis_etl::utils::logger;
use analysis_etl::TomlConfig;
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "alignment_stats")]
#[command(about = "Compare two reviewers' answers in the source table and summarise its contents")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Submitter whose answers are the reference (e.g. the human expert)
    #[arg(long)]
    reference: Option<String>,

    /// Submitter whose answers are compared against the reference
    #[arg(long)]
    candidate: Option<String>,

    /// Fields to compare, comma separated; defaults to every field of the table
    #[arg(long, value_delimiter = ',')]
    fields: Vec<String>,

    /// Field holding the submitter name
    #[arg(long, default_value = "提交人")]
    submitter_field: String,

    /// Also print record counts per submitter and field fill rates
    #[arg(long)]
    summary: bool,

    /// Write the report as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init_cli_logger(args.verbose);

    let pair = match (&args.reference, &args.candidate) {
        (Some(reference), Some(candidate)) => Some((reference.as_str(), candidate.as_str())),
        (None, None) if args.summary => None,
        _ => anyhow::bail!("Pass both --reference and --candidate, or --summary"),
    };

    let config = TomlConfig::from_file(&args.config)?;
    let key_field = config.source.key_field.clone();

    let client = app::feishu_client(&config)?;
    let tokens = Arc::new(app::token_manager(&config, &client));

    let compared = if args.fields.is_empty() {
        let token = tokens.acquire(TokenScope::Read).await?;
        let catalogue = client
            .list_fields(&token, &config.source.app_token, &config.source.table_id)
            .await?;
        catalogue
            .iter()
            .filter_map(|f| f["field_name"].as_str())
            .filter(|name| *name != key_field && *name != args.submitter_field)
            .map(str::to_string)
            .collect()
    } else {
        args.fields.clone()
    };

    let mut allow_list = vec![key_field.clone(), args.submitter_field.clone()];
    for field in &compared {
        if !allow_list.contains(field) {
            allow_list.push(field.clone());
        }
    }

    let reader = BitableReader::new(
        client,
        config.source.app_token.clone(),
        config.source.table_id.clone(),
        config.source.view_id.clone(),
    );
    let records = PagedRecordSource::new(reader, tokens).fetch(&allow_list).await?;
    println!("📥 Fetched {} records", records.len());

    let mut report = serde_json::Map::new();

    if let Some((reference, candidate)) = pair {
        let alignment = stats::alignment(
            &records,
            &AlignmentInput {
                key_field: &key_field,
                submitter_field: &args.submitter_field,
                reference,
                candidate,
                fields: &compared,
            },
        );
        print_alignment(&alignment);
        report.insert("alignment".to_string(), serde_json::to_value(&alignment)?);
    }

    if args.summary {
        let summary = stats::summarize(&records, &args.submitter_field);
        print_summary(&summary);
        report.insert("summary".to_string(), serde_json::to_value(&summary)?);
    }

    if let Some(path) = &args.output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&Value::Object(report))?)?;
        println!("✅ Report written to {}", path.display());
    }

    Ok(())
}

fn shown(value: &Value) -> String {
    if value.is_null() {
        "N/A".to_string()
    } else {
        stats::value_label(value)
    }
}

fn print_alignment(report: &AlignmentReport) {
    println!(
        "\n📊 {} vs {}: {}% overall ({} of {} answers agree)",
        report.reference,
        report.candidate,
        report.overall.rate,
        report.overall.matched,
        report.overall.compared
    );

    println!("\n=== Per record ===");
    for entry in &report.per_key {
        println!("  {}: {}%", entry.name, entry.rate);
    }

    println!("\n=== Per field ===");
    for entry in &report.per_field {
        println!("  {}: {}% ({}/{})", entry.name, entry.rate, entry.matched, entry.compared);
    }

    if !report.mismatches.is_empty() {
        println!("\n=== Disagreements ===");
        for m in &report.mismatches {
            println!("  {} · {}", stats::value_label(&m.key), m.field);
            println!("    {}: {}", report.reference, shown(&m.reference));
            println!("    {}: {}", report.candidate, shown(&m.candidate));
        }
    }

    if !report.unpaired.is_empty() {
        let keys: Vec<String> = report.unpaired.iter().map(stats::value_label).collect();
        println!("\n⚠️ Only one reviewer submitted: {}", json!(keys));
    }
}

fn print_summary(summary: &TableSummary) {
    println!("\n📋 {} records, {} fields", summary.total, summary.fields.len());

    println!("\n=== Records per submitter ===");
    for (submitter, count) in &summary.submitters {
        println!("  {}: {}", submitter, count);
    }

    println!("\n=== Fill rate per field ===");
    for coverage in &summary.coverage {
        println!(
            "  {}: {}/{} ({}%)",
            coverage.field, coverage.filled, coverage.total, coverage.rate
        );
    }
}
