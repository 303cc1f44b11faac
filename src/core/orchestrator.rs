use crate::config::cli::LocalStorage;
use crate::config::toml_config::ServiceConfig;
use crate::core::archive::FileArchive;
use crate::core::gateway::create_gateway;
use crate::core::prompt::{analyze_context, anonymize_user_id, PromptRenderer};
use crate::core::template_cache::TemplateCache;
use crate::domain::model::{AnalysisItem, BatchResult, ItemResult, LlmCallResult, PromptContext, SharedContext, Template};
use crate::domain::ports::{ArchiveRecord, LlmGateway, ResponseArchive};
use crate::utils::error::{AnalysisError, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// gateway 自身逾時之外的保險時間
const BACKSTOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_item_bytes: usize,
    /// true 時，空的或過大的項目讓整批被拒絕，而不是記成單項錯誤
    pub strict_item_limits: bool,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_items: 10,
            max_item_bytes: 10 * 1024 * 1024,
            strict_item_limits: false,
        }
    }
}

impl BatchLimits {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_items: config.max_items(),
            max_item_bytes: config.max_item_bytes(),
            strict_item_limits: config.strict_item_limits(),
        }
    }
}

pub const CANCELLED_BEFORE_START: &str = "cancelled before start";
pub const CANCELLED_IN_FLIGHT: &str = "cancelled while in flight";

/// 每個項目的狀態：Pending (等待閘門) → InFlight (已取得閘門) → Completed
enum ItemSlot {
    Pending,
    InFlight,
    Completed(ItemResult),
}

/// 嘗試把 assistant 文字解析成 JSON；不是 JSON 時原文當字串回傳
pub fn parse_assistant_payload(text: &str) -> Value {
    match serde_json::from_str(text.trim()) {
        Ok(value) => value,
        Err(_) => {
            tracing::debug!("Assistant text is not JSON, keeping it as a string");
            Value::String(text.to_string())
        }
    }
}

/// 單次 LLM 呼叫所需的一切，每個工作各持一份
#[derive(Clone)]
pub(crate) struct CallContext {
    gateway: Arc<dyn LlmGateway>,
    archive: Option<Arc<dyn ResponseArchive>>,
    call_timeout: Duration,
    request_id: String,
    user_id: String,
}

impl CallContext {
    /// 取得閘門後呼叫並解析；封存不在這裡做，不受取消影響
    async fn analyze(
        &self,
        template: &Template,
        context: PromptContext,
        item: &AnalysisItem,
        gate: &Semaphore,
        started: &AtomicBool,
    ) -> (ItemResult, Option<String>) {
        let prompt = PromptRenderer::render(template, &context);
        drop(context);

        let permit = match gate.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let result = ItemResult::error(item.item_id.clone(), "concurrency gate closed", item.size_bytes);
                return (result, None);
            }
        };
        started.store(true, Ordering::Release);

        let outcome = self.call_and_interpret(&prompt, &item.item_id, item.size_bytes).await;
        drop(permit);
        outcome
    }

    pub(crate) async fn call_and_interpret(
        &self,
        prompt: &str,
        item_id: &str,
        received_bytes: usize,
    ) -> (ItemResult, Option<String>) {
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.call_timeout + BACKSTOP_GRACE,
            self.gateway.call(prompt, Some(self.call_timeout)),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (mut result, raw) = match outcome {
            Err(_) => {
                tracing::warn!(item_id = %item_id, "⏱️ LLM call exceeded {:?}", self.call_timeout);
                (
                    ItemResult::error(
                        item_id.to_string(),
                        format!("LLM call exceeded {:?}", self.call_timeout),
                        received_bytes,
                    ),
                    None,
                )
            }
            Ok(Err(e)) => {
                tracing::error!(item_id = %item_id, "❌ LLM call rejected: {}", e);
                (ItemResult::error(item_id.to_string(), e.to_string(), received_bytes), None)
            }
            Ok(Ok(call)) => Self::interpret(call, item_id, received_bytes),
        };

        result.latency_ms = latency_ms;
        tracing::info!(
            item_id = %item_id,
            status = ?result.status,
            latency_ms,
            tokens = ?result.token_count,
            "Item finished"
        );
        (result, raw)
    }

    fn interpret(call: LlmCallResult, item_id: &str, received_bytes: usize) -> (ItemResult, Option<String>) {
        let LlmCallResult {
            raw_content,
            assistant_text,
            total_tokens,
            succeeded,
            error_message,
        } = call;

        let mut result = if succeeded {
            let payload = parse_assistant_payload(assistant_text.as_deref().unwrap_or_default());
            ItemResult::ok(item_id.to_string(), payload, received_bytes)
        } else {
            let message = error_message.unwrap_or_else(|| "LLM call failed".to_string());
            tracing::warn!(item_id = %item_id, "⚠️ LLM call failed: {}", message);
            ItemResult::error(item_id.to_string(), message, received_bytes)
        };
        result.token_count = total_tokens;

        let raw = (!raw_content.is_empty()).then_some(raw_content);
        (result, raw)
    }

    pub(crate) async fn archive_raw(&self, result: &mut ItemResult, raw: Option<String>) {
        let (Some(archive), Some(raw_response)) = (&self.archive, raw) else {
            return;
        };

        let record = ArchiveRecord {
            request_id: self.request_id.clone(),
            user_id: self.user_id.clone(),
            item_id: result.item_id.clone(),
            received_bytes: result.received_bytes,
            raw_response,
        };

        match archive.save_raw(&record).await {
            Ok(path) => result.archive_path = Some(path),
            Err(e) => tracing::warn!(
                item_id = %record.item_id,
                "⚠️ Failed to archive raw response: {}",
                e
            ),
        }
    }
}

/// 多張圖片的分析流程
///
/// 每張圖片一個工作，以 semaphore 限制同時進行的 LLM 呼叫數；
/// 結果依輸入位置放入預先配置好的槽位，輸出順序與輸入一致。
/// 單一項目失敗不影響其他項目，整批只會在開始前的驗證失敗。
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    gateway: Arc<dyn LlmGateway>,
    templates: Arc<TemplateCache>,
    archive: Option<Arc<dyn ResponseArchive>>,
    limits: BatchLimits,
    template_key: String,
    call_timeout: Duration,
}

impl AnalysisOrchestrator {
    pub fn new(gateway: Arc<dyn LlmGateway>, templates: Arc<TemplateCache>) -> Self {
        Self {
            gateway,
            templates,
            archive: None,
            limits: BatchLimits::default(),
            template_key: "analyze".to_string(),
            call_timeout: Duration::from_secs(120),
        }
    }

    pub fn from_config(config: &ServiceConfig, templates: Arc<TemplateCache>) -> Self {
        let mut orchestrator = Self::new(create_gateway(config), templates)
            .with_limits(BatchLimits::from_config(config))
            .with_template_key(config.template_key())
            .with_call_timeout(config.llm_timeout());

        if config.archive_enabled() {
            tracing::info!("💾 Raw response archive at {}", config.archive_output_path());
            let storage = LocalStorage::new(config.archive_output_path());
            orchestrator = orchestrator.with_archive(Arc::new(FileArchive::new(storage)));
        }

        orchestrator
    }

    pub fn with_archive(mut self, archive: Arc<dyn ResponseArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_template_key(mut self, key: impl Into<String>) -> Self {
        self.template_key = key.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn templates(&self) -> &Arc<TemplateCache> {
        &self.templates
    }

    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    pub fn model_name(&self) -> &str {
        self.gateway.model_name()
    }

    pub(crate) fn call_context(&self, request_id: &str, user_id: &str) -> CallContext {
        CallContext {
            gateway: Arc::clone(&self.gateway),
            archive: self.archive.clone(),
            call_timeout: self.call_timeout,
            request_id: request_id.to_string(),
            user_id: anonymize_user_id(user_id),
        }
    }

    pub async fn run_batch(
        &self,
        items: Vec<AnalysisItem>,
        shared: &SharedContext,
        max_concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        self.validate_batch(&items, max_concurrency)?;
        let template = self.templates.get(&self.template_key)?;

        let request_id = Uuid::new_v4().to_string();
        tracing::info!(
            request_id = %request_id,
            items = items.len(),
            max_concurrency,
            template_hash = %template.content_hash,
            "🚀 Starting batch"
        );

        let mut slots: Vec<ItemSlot> = items
            .iter()
            .map(|item| match self.preflight_error(item) {
                Some(message) => {
                    tracing::warn!(item_id = %item.item_id, "⚠️ Item rejected: {}", message);
                    ItemSlot::Completed(ItemResult::error(item.item_id.clone(), message, item.size_bytes))
                }
                None => ItemSlot::Pending,
            })
            .collect();
        let identities: Vec<(String, usize)> = items
            .iter()
            .map(|item| (item.item_id.clone(), item.size_bytes))
            .collect();

        let call = self.call_context(&request_id, &shared.user_id);
        let gate = Arc::new(Semaphore::new(max_concurrency));
        let started: Arc<Vec<AtomicBool>> = Arc::new(slots.iter().map(|_| AtomicBool::new(false)).collect());
        let mut tasks = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            if !matches!(slots[index], ItemSlot::Pending) {
                continue;
            }

            let context = analyze_context(shared, &item);
            let call = call.clone();
            let template = Arc::clone(&template);
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            let started = Arc::clone(&started);

            tasks.spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    outcome = call.analyze(&template, context, &item, &gate, &started[index]) => Some(outcome),
                };

                // 呼叫已完成的項目一定保留結果，封存在取消範圍之外
                let result = match outcome {
                    Some((mut result, raw)) => {
                        call.archive_raw(&mut result, raw).await;
                        Some(result)
                    }
                    None => None,
                };
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Some(result))) => slots[index] = ItemSlot::Completed(result),
                Ok((_, None)) => {}
                Err(e) => tracing::error!(request_id = %request_id, "❌ Item task failed: {}", e),
            }
        }

        for (slot, started) in slots.iter_mut().zip(started.iter()) {
            if matches!(slot, ItemSlot::Pending) && started.load(Ordering::Acquire) {
                *slot = ItemSlot::InFlight;
            }
        }

        let cancelled = cancel.is_cancelled();
        let results: Vec<ItemResult> = slots
            .into_iter()
            .zip(identities)
            .map(|(slot, (item_id, size_bytes))| match slot {
                ItemSlot::Completed(result) => result,
                ItemSlot::Pending if cancelled => {
                    ItemResult::cancelled(item_id, size_bytes, CANCELLED_BEFORE_START)
                }
                ItemSlot::InFlight if cancelled => {
                    ItemResult::cancelled(item_id, size_bytes, CANCELLED_IN_FLIGHT)
                }
                ItemSlot::Pending | ItemSlot::InFlight => {
                    ItemResult::error(item_id, "item task aborted", size_bytes)
                }
            })
            .collect();

        let batch = BatchResult {
            request_id,
            items: results,
        };
        tracing::info!(
            request_id = %batch.request_id,
            succeeded = batch.succeeded(),
            failed = batch.failed(),
            cancelled,
            "✅ Batch finished"
        );
        Ok(batch)
    }

    fn validate_batch(&self, items: &[AnalysisItem], max_concurrency: usize) -> Result<()> {
        if items.is_empty() {
            return Err(AnalysisError::ValidationError {
                message: "No items in batch".to_string(),
            });
        }

        if items.len() > self.limits.max_items {
            return Err(AnalysisError::ValidationError {
                message: format!(
                    "Too many items: {} (maximum {})",
                    items.len(),
                    self.limits.max_items
                ),
            });
        }

        if max_concurrency == 0 {
            return Err(AnalysisError::ValidationError {
                message: "maxConcurrency must be at least 1".to_string(),
            });
        }

        if self.limits.strict_item_limits {
            if let Some((index, message)) = items
                .iter()
                .enumerate()
                .find_map(|(index, item)| self.preflight_error(item).map(|m| (index, m)))
            {
                return Err(AnalysisError::ValidationError {
                    message: format!("Item {}: {}", index, message),
                });
            }
        }

        Ok(())
    }

    fn preflight_error(&self, item: &AnalysisItem) -> Option<String> {
        if item.size_bytes == 0 {
            Some("Empty item".to_string())
        } else if item.size_bytes > self.limits.max_item_bytes {
            Some(format!(
                "Item is {} bytes, exceeds maximum of {} bytes",
                item.size_bytes, self.limits.max_item_bytes
            ))
        } else {
            None
        }
    }
}
