use crate::core::orchestrator::{AnalysisOrchestrator, CANCELLED_BEFORE_START, CANCELLED_IN_FLIGHT};
use crate::core::prompt::{escape_for_prompt, PromptRenderer};
use crate::domain::model::{content_digest, ItemResult, PromptContext};
use crate::utils::error::{AnalysisError, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const CORRECTION_TEMPLATE_KEY: &str = "correction";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCorrectionRequest {
    request_id: Option<String>,
    user_id: Option<String>,
    user_comment: Option<String>,
    #[serde(rename = "usercomment")]
    user_comment_lowercase: Option<String>,
    previous_analysis: Option<Value>,
}

/// 使用者對先前分析結果的修正請求
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionRequest {
    pub request_id: Option<String>,
    pub user_id: String,
    pub user_comment: String,
    pub previous_analysis: Value,
}

impl CorrectionRequest {
    /// `previousAnalysis` 必填；`userComment` 也接受全小寫的 `usercomment`
    pub fn from_json(body: &str) -> Result<Self> {
        if body.trim().is_empty() {
            return Err(AnalysisError::ValidationError {
                message: "Request body is empty".to_string(),
            });
        }

        let raw: RawCorrectionRequest =
            serde_json::from_str(body).map_err(|e| AnalysisError::ValidationError {
                message: format!("Invalid JSON in request body: {}", e),
            })?;

        let previous_analysis = raw
            .previous_analysis
            .ok_or_else(|| AnalysisError::ValidationError {
                message: "Missing required field: previousAnalysis".to_string(),
            })?;

        Ok(Self {
            request_id: raw.request_id,
            user_id: raw.user_id.unwrap_or_default(),
            user_comment: raw
                .user_comment
                .or(raw.user_comment_lowercase)
                .unwrap_or_default(),
            previous_analysis,
        })
    }

    fn previous_analysis_json(&self) -> String {
        self.previous_analysis.to_string()
    }

    pub fn item_id(&self) -> String {
        content_digest(self.previous_analysis_json().as_bytes())
    }

    pub fn prompt_context(&self) -> PromptContext {
        PromptContext::new()
            .with_variable("previousAnalysis", escape_for_prompt(&self.previous_analysis_json()))
            .with_variable("comment", escape_for_prompt(&self.user_comment))
    }
}

impl AnalysisOrchestrator {
    /// 以 `correction` 模板重新分析一次，結果與批次中的單一項目同格式
    pub async fn run_correction(
        &self,
        request: &CorrectionRequest,
        cancel: &CancellationToken,
    ) -> Result<ItemResult> {
        let template = self.templates().get(CORRECTION_TEMPLATE_KEY)?;

        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let item_id = request.item_id();
        let received_bytes = request.previous_analysis_json().len();

        let prompt = PromptRenderer::render(&template, &request.prompt_context());
        let call = self.call_context(&request_id, &request.user_id);

        if cancel.is_cancelled() {
            return Ok(ItemResult::cancelled(item_id, received_bytes, CANCELLED_BEFORE_START));
        }
        tracing::info!(request_id = %request_id, item_id = %item_id, "🔁 Running correction");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = call.call_and_interpret(&prompt, &item_id, received_bytes) => Some(outcome),
        };

        let result = match outcome {
            Some((mut result, raw)) => {
                call.archive_raw(&mut result, raw).await;
                result
            }
            None => ItemResult::cancelled(item_id, received_bytes, CANCELLED_IN_FLIGHT),
        };
        Ok(result)
    }
}
