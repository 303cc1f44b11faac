use crate::utils::error::{AnalysisError, Result};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LLM_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a professional nutrition analyst. Return STRICT JSON only (no prose).";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub templates: TemplateRegistry,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    #[default]
    OpenAi,
    Canned,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProviderKind,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_items: Option<usize>,
    pub max_item_bytes: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub strict_item_limits: Option<bool>,
    pub template_key: Option<String>,
}

/// 模板登錄表：每個 key 對應遠端網址與本地備援檔案
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateRegistry {
    pub auto_refresh: Option<bool>,
    pub refresh_interval_seconds: Option<u64>,
    pub base_dir: Option<String>,
    pub remote_token_env: Option<String>,
    #[serde(default)]
    pub sets: BTreeMap<String, TemplateSourceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateSourceConfig {
    pub remote_url: Option<String>,
    pub local_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub enabled: Option<bool>,
    pub output_path: Option<String>,
}

impl ServiceConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(AnalysisError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| AnalysisError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    pub fn validate_config(&self) -> Result<()> {
        if self.llm.provider == LlmProviderKind::OpenAi {
            validation::validate_url("llm.endpoint", self.llm_endpoint())?;
        }
        validation::validate_non_empty_string("llm.model", self.llm_model())?;
        validation::validate_range("llm.timeout_seconds", self.llm.timeout_seconds.unwrap_or(120), 1, 600)?;
        if let Some(temperature) = self.llm.temperature {
            validation::validate_range("llm.temperature", temperature, 0.0, 2.0)?;
        }

        validation::validate_positive_number("batch.max_items", self.max_items(), 1)?;
        validation::validate_positive_number("batch.max_item_bytes", self.max_item_bytes(), 1)?;
        validation::validate_range("batch.max_concurrency", self.max_concurrency(), 1, 64)?;

        let template_key = self.template_key();
        if !self.templates.sets.contains_key(template_key) {
            return Err(AnalysisError::MissingConfigError {
                field: format!("templates.sets.{}", template_key),
            });
        }

        for (key, source) in &self.templates.sets {
            let field = format!("templates.sets.{}", key);
            match (&source.remote_url, &source.local_path) {
                (None, None) => {
                    return Err(AnalysisError::ConfigValidationError {
                        field,
                        message: "either remote_url or local_path is required".to_string(),
                    });
                }
                (remote, local) => {
                    if let Some(url) = remote {
                        validation::validate_url(&format!("{}.remote_url", field), url)?;
                    }
                    if let Some(path) = local {
                        validation::validate_path(&format!("{}.local_path", field), path)?;
                    }
                }
            }
        }

        if self.auto_refresh() {
            validation::validate_positive_number(
                "templates.refresh_interval_seconds",
                self.templates.refresh_interval_seconds.unwrap_or(300) as usize,
                1,
            )?;
        }

        if self.archive_enabled() {
            validation::validate_path("archive.output_path", self.archive_output_path())?;
        }

        Ok(())
    }

    pub fn llm_endpoint(&self) -> &str {
        self.llm.endpoint.as_deref().unwrap_or(DEFAULT_LLM_ENDPOINT)
    }

    pub fn llm_model(&self) -> &str {
        self.llm.model.as_deref().unwrap_or(DEFAULT_LLM_MODEL)
    }

    pub fn system_prompt(&self) -> &str {
        self.llm.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_seconds.unwrap_or(120))
    }

    /// 設定檔優先，其次是 OPENAI_API_KEY；未替換的 `${...}` 視為未設定
    pub fn api_key(&self) -> Option<String> {
        self.llm
            .api_key
            .clone()
            .filter(|key| is_resolved(key))
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|key| is_resolved(key)))
    }

    pub fn max_items(&self) -> usize {
        self.batch.max_items.unwrap_or(10)
    }

    pub fn max_item_bytes(&self) -> usize {
        self.batch.max_item_bytes.unwrap_or(10 * 1024 * 1024)
    }

    pub fn max_concurrency(&self) -> usize {
        self.batch.max_concurrency.unwrap_or(4)
    }

    pub fn strict_item_limits(&self) -> bool {
        self.batch.strict_item_limits.unwrap_or(false)
    }

    pub fn template_key(&self) -> &str {
        self.batch.template_key.as_deref().unwrap_or("analyze")
    }

    pub fn auto_refresh(&self) -> bool {
        self.templates.auto_refresh.unwrap_or(false)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.templates.refresh_interval_seconds.unwrap_or(300))
    }

    pub fn template_base_dir(&self) -> PathBuf {
        PathBuf::from(self.templates.base_dir.as_deref().unwrap_or("."))
    }

    pub fn remote_token(&self) -> Option<String> {
        let var = self
            .templates
            .remote_token_env
            .as_deref()
            .unwrap_or("GITHUB_RAW_TOKEN");
        std::env::var(var).ok().filter(|token| !token.trim().is_empty())
    }

    pub fn archive_enabled(&self) -> bool {
        self.archive.enabled.unwrap_or(false)
    }

    pub fn archive_output_path(&self) -> &str {
        self.archive.output_path.as_deref().unwrap_or("./archive")
    }
}

impl Validate for ServiceConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

/// 替換環境變數 (例如 ${OPENAI_API_KEY})，找不到的保留原樣
fn substitute_env_vars(content: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| AnalysisError::ConfigError {
        message: format!("invalid substitution pattern: {}", e),
    })?;

    let result = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    });

    Ok(result.to_string())
}

fn is_resolved(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && !trimmed.starts_with("${")
}
