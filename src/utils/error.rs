use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration error in '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Template not found: {key}")]
    TemplateNotFound { key: String },

    #[error("Template '{key}' could not be loaded: {message}")]
    LoadFailure { key: String, message: String },

    #[error("Provider error: {message}")]
    ProviderError { message: String },

    #[error("Archive error: {message}")]
    PersistenceError { message: String },
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Template,
    Provider,
    Persistence,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnalysisError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AnalysisError::ConfigError { .. }
            | AnalysisError::ConfigValidationError { .. }
            | AnalysisError::InvalidConfigValueError { .. }
            | AnalysisError::MissingConfigError { .. } => ErrorCategory::Configuration,
            AnalysisError::ValidationError { .. } => ErrorCategory::Validation,
            AnalysisError::TemplateNotFound { .. } | AnalysisError::LoadFailure { .. } => {
                ErrorCategory::Template
            }
            AnalysisError::ProviderError { .. } | AnalysisError::ApiError(_) => {
                ErrorCategory::Provider
            }
            AnalysisError::PersistenceError { .. } => ErrorCategory::Persistence,
            AnalysisError::IoError(_) | AnalysisError::SerializationError(_) => {
                ErrorCategory::System
            }
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Persistence => ErrorSeverity::Low,
            ErrorCategory::Provider => ErrorSeverity::Medium,
            ErrorCategory::Validation | ErrorCategory::Template => ErrorSeverity::High,
            ErrorCategory::Configuration | ErrorCategory::System => ErrorSeverity::Critical,
        }
    }

    /// 呼叫端送錯資料（應回 4xx），其餘皆屬伺服器或上游問題
    pub fn is_client_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Validation)
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            AnalysisError::ValidationError { message } => format!("請求內容無效: {}", message),
            AnalysisError::TemplateNotFound { key } | AnalysisError::LoadFailure { key, .. } => {
                format!("找不到可用的提示詞模板 '{}'", key)
            }
            AnalysisError::ProviderError { .. } | AnalysisError::ApiError(_) => {
                "LLM 服務暫時無法使用".to_string()
            }
            AnalysisError::MissingConfigError { field } => format!("缺少必要設定: {}", field),
            other => other.to_string(),
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Configuration => "檢查設定檔與環境變數 (例如 OPENAI_API_KEY)",
            ErrorCategory::Validation => "確認圖片數量與大小符合限制後重新送出",
            ErrorCategory::Template => "確認模板的遠端網址或本地檔案路徑是否存在",
            ErrorCategory::Provider => "稍後重試，或檢查 LLM 端點與模型名稱",
            ErrorCategory::Persistence => "檢查封存目錄的寫入權限",
            ErrorCategory::System => "查看日誌以取得詳細資訊",
        }
    }
}
