use crate::domain::model::LlmCallResult;
use crate::utils::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// 封存寫入用的儲存後端
pub trait Storage: Send + Sync {
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// 對外部 LLM 端點的單次呼叫
///
/// 網路錯誤、逾時、非成功狀態碼都以 `succeeded = false` 回傳；
/// 只有缺少憑證這類設定錯誤才會以 `Err` 傳出，且必須在任何網路 I/O 之前判斷。
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn call(&self, prompt: &str, timeout: Option<Duration>) -> Result<LlmCallResult>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    pub request_id: String,
    pub user_id: String,
    pub item_id: String,
    pub received_bytes: usize,
    pub raw_response: String,
}

/// 原始回應封存 (best-effort)，回傳儲存路徑
#[async_trait]
pub trait ResponseArchive: Send + Sync {
    async fn save_raw(&self, record: &ArchiveRecord) -> Result<String>;
}
