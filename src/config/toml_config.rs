use crate::adapters::feishu::{AppCredentials, DEFAULT_BASE_URL};
use crate::adapters::{BackendSettings, Provider};
use crate::core::analysis::{InstructionTemplate, DEFAULT_PLACEHOLDER};
use crate::core::etl::PipelineSettings;
use crate::core::sink::REMOTE_BATCH_LIMIT;
use crate::domain::model::TokenScope;
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_path, validate_positive_number, validate_range,
    validate_url, Validate,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub feishu: FeishuConfig,
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// 讀取端：多維表格與視圖
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub app_token: String,
    pub table_id: String,
    pub view_id: Option<String>,
    pub key_field: String,
    /// 需要分析的資料欄位，識別欄位會自動加入
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// 未設定時沿用 source.app_token
    pub app_token: Option<String>,
    pub table_id: String,
    pub local_log_path: String,
    pub raw_output_dir: Option<String>,
    pub field_mapping: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeishuConfig {
    pub base_url: Option<String>,
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    /// 寫入端使用不同應用時設定
    pub write_app_id: Option<String>,
    pub write_app_secret: Option<String>,
    pub read_token: Option<String>,
    pub write_token: Option<String>,
    pub token_refresh_margin_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub template_path: String,
    pub placeholder: Option<String>,
    /// 需轉為整數的欄位，預設為識別欄位
    pub numeric_fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub batch_size: Option<usize>,
    pub workers: Option<usize>,
    pub request_timeout_seconds: Option<u64>,
    pub remote_batch_limit: Option<usize>,
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern"))
}

impl TomlConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EtlError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // 處理環境變數替換
        let processed_content = Self::substitute_env_vars(content);

        toml::from_str(&processed_content).map_err(|e| EtlError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${API_KEY})，未設定者保留原文交由驗證回報
    fn substitute_env_vars(content: &str) -> String {
        env_var_pattern()
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        // 來源
        validate_non_empty_string("source.app_token", &self.source.app_token)?;
        validate_non_empty_string("source.table_id", &self.source.table_id)?;
        validate_non_empty_string("source.key_field", &self.source.key_field)?;
        if self.source.fields.is_empty() {
            return Err(EtlError::MissingConfigError {
                field: "source.fields".to_string(),
            });
        }
        for field in &self.source.fields {
            validate_non_empty_string("source.fields", field)?;
        }

        // 輸出
        validate_non_empty_string("sink.table_id", &self.sink.table_id)?;
        validate_path("sink.local_log_path", &self.sink.local_log_path)?;
        if let Some(dir) = &self.sink.raw_output_dir {
            validate_path("sink.raw_output_dir", dir)?;
        }
        if let Some(mapping) = &self.sink.field_mapping {
            self.validate_field_mapping(mapping)?;
        }

        // 飛書認證
        validate_url("feishu.base_url", self.feishu_base_url())?;
        for scope in [TokenScope::Read, TokenScope::Write] {
            if self.static_token(scope).is_none() && self.credentials(scope).is_none() {
                return Err(EtlError::MissingConfigError {
                    field: format!("feishu.{}_token or app credentials", scope),
                });
            }
        }

        // 分析
        let provider = self.provider()?;
        validate_non_empty_string("analysis.model", &self.analysis.model)?;
        validate_non_empty_string("analysis.api_key", &self.analysis.api_key)?;
        match &self.analysis.base_url {
            Some(url) => validate_url("analysis.base_url", url)?,
            None if provider.default_base_url().is_none() => {
                return Err(EtlError::MissingConfigError {
                    field: "analysis.base_url".to_string(),
                })
            }
            None => {}
        }
        validate_range("analysis.temperature", self.temperature(), 0.0, 2.0)?;
        validate_positive_number("analysis.max_output_tokens", self.max_output_tokens() as usize, 1)?;
        validate_path("analysis.template_path", &self.analysis.template_path)?;
        validate_non_empty_string("analysis.placeholder", self.placeholder())?;

        // 執行
        validate_positive_number("execution.batch_size", self.batch_size(), 1)?;
        validate_positive_number("execution.workers", self.workers(), 1)?;
        validate_positive_number(
            "execution.request_timeout_seconds",
            self.request_timeout().as_secs() as usize,
            1,
        )?;
        validate_range(
            "execution.remote_batch_limit",
            self.remote_batch_limit(),
            1,
            REMOTE_BATCH_LIMIT,
        )?;

        self.check_unresolved_env_vars()
    }

    /// 改名後不可與其他欄位同名：目標不得重複、不得是另一個被改名的欄位，
    /// 也不得是保留原名的識別欄位或讀取欄位
    fn validate_field_mapping(&self, mapping: &HashMap<String, String>) -> Result<()> {
        let mut pairs: Vec<(&String, &String)> = mapping.iter().collect();
        pairs.sort();

        let mut targets: HashMap<&str, &str> = HashMap::new();
        for (from, to) in pairs {
            validate_non_empty_string("sink.field_mapping", from)?;
            validate_non_empty_string("sink.field_mapping", to)?;

            let conflict = if let Some(other) = targets.insert(to, from) {
                Some(format!("'{}' and '{}' both map to '{}'", other, from, to))
            } else if mapping.contains_key(to) {
                Some(format!("'{}' maps to '{}', which is itself renamed", from, to))
            } else if self.read_fields().contains(to) {
                Some(format!("'{}' maps to '{}', which is already a source field", from, to))
            } else {
                None
            };

            if let Some(message) = conflict {
                return Err(EtlError::ConfigValidationError {
                    field: "sink.field_mapping".to_string(),
                    message,
                });
            }
        }
        Ok(())
    }

    /// 未替換的 ${VAR} 代表環境變數缺漏
    fn check_unresolved_env_vars(&self) -> Result<()> {
        let fields = [
            ("feishu.app_id", self.feishu.app_id.as_deref()),
            ("feishu.app_secret", self.feishu.app_secret.as_deref()),
            ("feishu.write_app_id", self.feishu.write_app_id.as_deref()),
            ("feishu.write_app_secret", self.feishu.write_app_secret.as_deref()),
            ("feishu.read_token", self.feishu.read_token.as_deref()),
            ("feishu.write_token", self.feishu.write_token.as_deref()),
            ("analysis.api_key", Some(self.analysis.api_key.as_str())),
            ("source.app_token", Some(self.source.app_token.as_str())),
            ("sink.app_token", self.sink.app_token.as_deref()),
        ];

        for (field, value) in fields {
            if let Some(caps) = value.and_then(|v| env_var_pattern().captures(v)) {
                return Err(EtlError::ConfigValidationError {
                    field: field.to_string(),
                    message: format!("Environment variable {} is not set", &caps[1]),
                });
            }
        }
        Ok(())
    }

    pub fn provider(&self) -> Result<Provider> {
        self.analysis.provider.parse()
    }

    pub fn feishu_base_url(&self) -> &str {
        self.feishu.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn sink_app_token(&self) -> &str {
        self.sink.app_token.as_deref().unwrap_or(&self.source.app_token)
    }

    pub fn static_token(&self, scope: TokenScope) -> Option<String> {
        match scope {
            TokenScope::Read => self.feishu.read_token.clone(),
            TokenScope::Write => self.feishu.write_token.clone(),
        }
        .filter(|t| !t.trim().is_empty())
    }

    /// 寫入端未設定獨立應用時沿用讀取端的憑證
    pub fn credentials(&self, scope: TokenScope) -> Option<AppCredentials> {
        let read = match (&self.feishu.app_id, &self.feishu.app_secret) {
            (Some(app_id), Some(app_secret)) => Some(AppCredentials {
                app_id: app_id.clone(),
                app_secret: app_secret.clone(),
            }),
            _ => None,
        };
        match scope {
            TokenScope::Read => read,
            TokenScope::Write => match (&self.feishu.write_app_id, &self.feishu.write_app_secret) {
                (Some(app_id), Some(app_secret)) => Some(AppCredentials {
                    app_id: app_id.clone(),
                    app_secret: app_secret.clone(),
                }),
                _ => read,
            },
        }
    }

    pub fn token_refresh_margin(&self) -> i64 {
        self.feishu.token_refresh_margin_seconds.unwrap_or(60)
    }

    pub fn temperature(&self) -> f32 {
        self.analysis.temperature.unwrap_or(0.0)
    }

    pub fn max_output_tokens(&self) -> u32 {
        self.analysis.max_output_tokens.unwrap_or(8192)
    }

    pub fn placeholder(&self) -> &str {
        self.analysis.placeholder.as_deref().unwrap_or(DEFAULT_PLACEHOLDER)
    }

    pub fn numeric_fields(&self) -> Vec<String> {
        self.analysis
            .numeric_fields
            .clone()
            .unwrap_or_else(|| vec![self.source.key_field.clone()])
    }

    pub fn batch_size(&self) -> usize {
        self.execution.batch_size.unwrap_or(10)
    }

    pub fn workers(&self) -> usize {
        self.execution.workers.unwrap_or(4)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.request_timeout_seconds.unwrap_or(120))
    }

    pub fn remote_batch_limit(&self) -> usize {
        self.execution.remote_batch_limit.unwrap_or(REMOTE_BATCH_LIMIT)
    }

    /// 讀取欄位清單：識別欄位在前，資料欄位依序排列
    pub fn read_fields(&self) -> Vec<String> {
        let mut fields = vec![self.source.key_field.clone()];
        for field in &self.source.fields {
            if !fields.contains(field) {
                fields.push(field.clone());
            }
        }
        fields
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            key_field: self.source.key_field.clone(),
            fields: self.read_fields(),
            batch_size: self.batch_size(),
            workers: self.workers(),
        }
    }

    pub fn backend_settings(&self) -> Result<BackendSettings> {
        Ok(BackendSettings {
            provider: self.provider()?,
            model: self.analysis.model.clone(),
            api_key: self.analysis.api_key.clone(),
            base_url: self.analysis.base_url.clone(),
            temperature: self.temperature(),
            max_output_tokens: self.max_output_tokens(),
            timeout: self.request_timeout(),
        })
    }

    /// 載入指令模板檔案
    pub fn load_template(&self) -> Result<InstructionTemplate> {
        let text = std::fs::read_to_string(&self.analysis.template_path).map_err(|e| {
            EtlError::ConfigValidationError {
                field: "analysis.template_path".to_string(),
                message: format!("Cannot read '{}': {}", self.analysis.template_path, e),
            }
        })?;
        InstructionTemplate::new(text, self.placeholder())
    }
}

impl Validate for TomlConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BASIC: &str = r#"
[source]
app_token = "bascnSource"
table_id = "tblSource"
view_id = "vewMain"
key_field = "id"
fields = ["dialogue", "id", "channel"]

[sink]
table_id = "tblResults"
local_log_path = "./output/results.jsonl"

[feishu]
app_id = "cli_test"
app_secret = "secret"

[analysis]
provider = "deepseek"
model = "deepseek-chat"
api_key = "sk-test"
template_path = "./prompts/analysis.txt"

[execution]
batch_size = 5
workers = 2
"#;

    #[test]
    fn test_parse_basic_toml_config() {
        let config = TomlConfig::from_toml_str(BASIC).unwrap();

        assert_eq!(config.source.view_id.as_deref(), Some("vewMain"));
        assert_eq!(config.sink_app_token(), "bascnSource");
        assert_eq!(config.provider().unwrap(), Provider::Deepseek);
        assert_eq!(config.batch_size(), 5);
        assert_eq!(config.workers(), 2);
        assert_eq!(config.remote_batch_limit(), 500);
        assert_eq!(config.placeholder(), "{{TRANSACTION}}");
        assert_eq!(config.numeric_fields(), vec!["id"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_read_fields_put_key_first_without_duplicates() {
        let config = TomlConfig::from_toml_str(BASIC).unwrap();
        assert_eq!(config.read_fields(), vec!["id", "dialogue", "channel"]);

        let settings = config.pipeline_settings();
        assert_eq!(settings.key_field, "id");
        assert_eq!(settings.batch_size, 5);
    }

    #[test]
    fn test_write_credentials_fall_back_to_read_app() {
        let config = TomlConfig::from_toml_str(BASIC).unwrap();
        let write = config.credentials(TokenScope::Write).unwrap();
        assert_eq!(write.app_id, "cli_test");

        let with_write_app = BASIC.replace(
            "app_secret = \"secret\"",
            "app_secret = \"secret\"\nwrite_app_id = \"cli_writer\"\nwrite_app_secret = \"s2\"",
        );
        let config = TomlConfig::from_toml_str(&with_write_app).unwrap();
        assert_eq!(config.credentials(TokenScope::Write).unwrap().app_id, "cli_writer");
        assert_eq!(config.credentials(TokenScope::Read).unwrap().app_id, "cli_test");
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("ANALYSIS_ETL_TEST_API_KEY", "sk-from-env");

        let content = BASIC.replace("sk-test", "${ANALYSIS_ETL_TEST_API_KEY}");
        let config = TomlConfig::from_toml_str(&content).unwrap();
        assert_eq!(config.analysis.api_key, "sk-from-env");

        std::env::remove_var("ANALYSIS_ETL_TEST_API_KEY");
    }

    #[test]
    fn test_unresolved_env_var_fails_validation() {
        let content = BASIC.replace("sk-test", "${ANALYSIS_ETL_SURELY_UNSET_VAR}");
        let config = TomlConfig::from_toml_str(&content).unwrap();

        match config.validate() {
            Err(EtlError::ConfigValidationError { field, message }) => {
                assert_eq!(field, "analysis.api_key");
                assert!(message.contains("ANALYSIS_ETL_SURELY_UNSET_VAR"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        let zero_batch = BASIC.replace("batch_size = 5", "batch_size = 0");
        assert!(TomlConfig::from_toml_str(&zero_batch).unwrap().validate().is_err());

        let unknown_provider = BASIC.replace("\"deepseek\"", "\"mystery\"");
        assert!(TomlConfig::from_toml_str(&unknown_provider).unwrap().validate().is_err());

        let no_auth = BASIC.replace("app_id = \"cli_test\"\n", "");
        assert!(matches!(
            TomlConfig::from_toml_str(&no_auth).unwrap().validate(),
            Err(EtlError::MissingConfigError { .. })
        ));

        let generic_without_url = BASIC.replace("\"deepseek\"", "\"chat_completions\"");
        assert!(TomlConfig::from_toml_str(&generic_without_url).unwrap().validate().is_err());
    }

    #[test]
    fn test_missing_fields_fail_validation() {
        let no_fields = BASIC.replace("fields = [\"dialogue\", \"id\", \"channel\"]\n", "");
        let config = TomlConfig::from_toml_str(&no_fields).unwrap();

        assert!(matches!(
            config.validate(),
            Err(EtlError::MissingConfigError { ref field }) if field == "source.fields"
        ));
        // 即使未驗證，讀取清單也至少包含識別欄位
        assert_eq!(config.read_fields(), vec!["id"]);

        let empty_list = BASIC.replace("fields = [\"dialogue\", \"id\", \"channel\"]", "fields = []");
        assert!(TomlConfig::from_toml_str(&empty_list).unwrap().validate().is_err());
    }

    #[test]
    fn test_field_mapping_collisions_fail_validation() {
        let with_mapping = |table: &str| {
            let content = BASIC.replace(
                "local_log_path = \"./output/results.jsonl\"",
                &format!("local_log_path = \"./output/results.jsonl\"\n{}", table),
            );
            TomlConfig::from_toml_str(&content).unwrap()
        };

        let ok = with_mapping("field_mapping = { score = \"round5_score\" }");
        assert!(ok.validate().is_ok());

        for table in [
            "field_mapping = { score = \"total\", extra = \"total\" }",
            "field_mapping = { score = \"label\", label = \"tag\" }",
            "field_mapping = { score = \"id\" }",
            "field_mapping = { score = \"channel\" }",
        ] {
            match with_mapping(table).validate() {
                Err(EtlError::ConfigValidationError { field, .. }) => {
                    assert_eq!(field, "sink.field_mapping", "{}", table)
                }
                other => panic!("{} should be rejected, got {:?}", table, other),
            }
        }
    }

    #[test]
    fn test_static_tokens_satisfy_auth() {
        let content = BASIC.replace(
            "app_id = \"cli_test\"\napp_secret = \"secret\"",
            "read_token = \"t-read\"\nwrite_token = \"t-write\"",
        );
        let config = TomlConfig::from_toml_str(&content).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.static_token(TokenScope::Write).as_deref(), Some("t-write"));
    }

    #[test]
    fn test_config_from_file_and_template() {
        let mut template_file = NamedTempFile::new().unwrap();
        template_file
            .write_all(b"Classify each record:\n{{TRANSACTION}}")
            .unwrap();

        let content = BASIC.replace(
            "./prompts/analysis.txt",
            &template_file.path().to_string_lossy().replace('\\', "/"),
        );
        let mut config_file = NamedTempFile::new().unwrap();
        config_file.write_all(content.as_bytes()).unwrap();

        let config = TomlConfig::from_file(config_file.path()).unwrap();
        let template = config.load_template().unwrap();
        assert_eq!(template.render("[]"), "Classify each record:\n[]");
    }
}
