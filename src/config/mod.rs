pub mod toml_config;

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "cli")]
use toml_config::TomlConfig;

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(name = "analysis-etl")]
#[command(about = "Batch LLM analysis of Feishu table records")]
pub struct CliConfig {
    #[arg(short, long, default_value = "config.toml", help = "Path to the TOML config file")]
    pub config: String,

    #[arg(long, help = "Override analysis.provider (gemini, deepseek, qwen, chat_completions)")]
    pub provider: Option<String>,

    #[arg(long, help = "Override execution.batch_size")]
    pub batch_size: Option<usize>,

    #[arg(long, help = "Override execution.workers")]
    pub workers: Option<usize>,

    #[arg(long, help = "Override analysis.temperature")]
    pub temperature: Option<f32>,

    #[arg(long, help = "Override analysis.max_output_tokens")]
    pub max_output_tokens: Option<u32>,

    #[arg(long, help = "Fetch, dedupe and batch only; skip analysis and writes")]
    pub dry_run: bool,

    #[arg(long, help = "Emit logs as JSON")]
    pub json_logs: bool,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,
}

#[cfg(feature = "cli")]
impl CliConfig {
    /// 命令列參數覆寫 TOML 中的對應設定
    pub fn apply_overrides(&self, config: &mut TomlConfig) {
        if let Some(provider) = &self.provider {
            config.analysis.provider = provider.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.execution.batch_size = Some(batch_size);
        }
        if let Some(workers) = self.workers {
            config.execution.workers = Some(workers);
        }
        if let Some(temperature) = self.temperature {
            config.analysis.temperature = Some(temperature);
        }
        if let Some(max_output_tokens) = self.max_output_tokens {
            config.analysis.max_output_tokens = Some(max_output_tokens);
        }
    }
}

#[cfg(all(test, feature = "cli"))]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_toml_values() {
        let cli = CliConfig::parse_from([
            "analysis-etl",
            "--config",
            "custom.toml",
            "--provider",
            "gemini",
            "--workers",
            "8",
            "--dry-run",
        ]);
        assert_eq!(cli.config, "custom.toml");
        assert!(cli.dry_run);

        let mut config = TomlConfig::from_toml_str(
            r#"
[source]
app_token = "a"
table_id = "t"
key_field = "id"

[sink]
table_id = "r"
local_log_path = "out.jsonl"

[analysis]
provider = "deepseek"
model = "m"
api_key = "k"
template_path = "p.txt"
"#,
        )
        .unwrap();
        cli.apply_overrides(&mut config);

        assert_eq!(config.analysis.provider, "gemini");
        assert_eq!(config.workers(), 8);
        assert_eq!(config.batch_size(), 10);
    }
}
