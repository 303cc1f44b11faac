use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// SHA-256 內容摘要 (hex)，用於 item id、模板雜湊與 prompt 關聯
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateSourceKind {
    Remote,
    Local,
}

/// 已載入的提示詞模板，載入後不可變；刷新時整份替換
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub key: String,
    pub text: String,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub source_kind: TemplateSourceKind,
}

impl Template {
    pub fn new(key: impl Into<String>, text: String, source_kind: TemplateSourceKind) -> Self {
        let content_hash = content_digest(text.as_bytes());
        Self {
            key: key.into(),
            text,
            content_hash,
            fetched_at: Utc::now(),
            source_kind,
        }
    }
}

/// 批次中的單張圖片
#[derive(Debug, Clone)]
pub struct AnalysisItem {
    pub raw_bytes: Vec<u8>,
    pub size_bytes: usize,
    pub item_id: String,
    pub file_name: Option<String>,
}

impl AnalysisItem {
    pub fn new(raw_bytes: Vec<u8>) -> Self {
        let item_id = content_digest(&raw_bytes);
        Self {
            size_bytes: raw_bytes.len(),
            raw_bytes,
            item_id,
            file_name: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

/// 整個批次共用的欄位 (來自傳輸層的表單欄位)
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    pub user_id: String,
    pub hint: String,
    pub comment: String,
    pub extra_params: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub variables: HashMap<String, String>,
    pub images: Vec<Vec<u8>>,
}

impl PromptContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the value as-is; callers escape free text before inserting it.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_image(mut self, bytes: Vec<u8>) -> Self {
        self.images.push(bytes);
        self
    }
}

/// 單次 LLM 呼叫的結果，建立後不再修改
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LlmCallResult {
    pub raw_content: String,
    pub assistant_text: Option<String>,
    pub total_tokens: Option<u64>,
    pub succeeded: bool,
    pub error_message: Option<String>,
}

impl LlmCallResult {
    pub fn success(raw_content: String, assistant_text: String, total_tokens: Option<u64>) -> Self {
        Self {
            raw_content,
            assistant_text: Some(assistant_text),
            total_tokens,
            succeeded: true,
            error_message: None,
        }
    }

    pub fn failure(error_message: impl Into<String>) -> Self {
        Self {
            error_message: Some(error_message.into()),
            ..Self::default()
        }
    }

    pub fn failure_with_body(
        raw_content: String,
        total_tokens: Option<u64>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            raw_content,
            assistant_text: None,
            total_tokens,
            succeeded: false,
            error_message: Some(error_message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub item_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
    pub received_bytes: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
}

impl ItemResult {
    pub fn ok(item_id: String, payload: serde_json::Value, received_bytes: usize) -> Self {
        Self {
            item_id,
            status: ItemStatus::Ok,
            payload: Some(payload),
            error: None,
            latency_ms: 0,
            token_count: None,
            received_bytes,
            cancelled: false,
            archive_path: None,
        }
    }

    pub fn error(item_id: String, error: impl Into<String>, received_bytes: usize) -> Self {
        Self {
            item_id,
            status: ItemStatus::Error,
            payload: None,
            error: Some(error.into()),
            latency_ms: 0,
            token_count: None,
            received_bytes,
            cancelled: false,
            archive_path: None,
        }
    }

    pub fn cancelled(item_id: String, received_bytes: usize, reason: impl Into<String>) -> Self {
        Self {
            cancelled: true,
            ..Self::error(item_id, reason, received_bytes)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ItemStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub request_id: String,
    pub items: Vec<ItemResult>,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}
