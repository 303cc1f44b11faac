use crate::domain::model::{content_digest, AnalysisItem, PromptContext, SharedContext, Template};
use crate::utils::error::{AnalysisError, Result};
use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

pub const IMAGE_PAYLOAD_PREFIX: &str = "IMAGE_BASE64:";

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("placeholder pattern is valid"))
}

fn image_start_marker(index: usize) -> String {
    format!("---IMAGE_{}_START---", index)
}

fn image_end_marker(index: usize) -> String {
    format!("---IMAGE_{}_END---", index)
}

/// 清除換行與 tab，合併連續空白並去頭尾，讓變數永遠只佔一行
pub fn escape_for_prompt(value: &str) -> String {
    value
        .replace(['\r', '\n', '\t'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// 解析額外要求的欄位
///
/// 以 `[` 開頭且 `]` 結尾的值一律視為 JSON 字串陣列，解析失敗即為驗證錯誤；
/// 其餘以逗號分隔。每個項目都會清理、去除空值並保留第一次出現的順序去重。
pub fn parse_extra_params(raw: &str) -> Result<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<String> = if trimmed.starts_with('[') && trimmed.ends_with(']') {
        serde_json::from_str::<Vec<String>>(trimmed).map_err(|e| AnalysisError::ValidationError {
            message: format!("extraParams is not a valid JSON array of strings: {}", e),
        })?
    } else {
        trimmed.split(',').map(str::to_string).collect()
    };

    let mut seen = HashSet::new();
    Ok(entries
        .iter()
        .map(|entry| escape_for_prompt(entry))
        .filter(|entry| !entry.is_empty())
        .filter(|entry| seen.insert(entry.clone()))
        .collect())
}

pub fn anonymize_user_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        "anon".to_string()
    } else {
        content_digest(trimmed.as_bytes())
    }
}

pub fn extra_params_text(params: &[String]) -> String {
    if params.is_empty() {
        String::new()
    } else {
        format!(
            "Also include these additional fields in totals and per-ingredient: {}.",
            params.join(", ")
        )
    }
}

impl SharedContext {
    /// 由傳輸層的原始表單欄位建立
    pub fn from_form_fields(user_id: &str, hint: &str, comment: &str, extra_params: &str) -> Result<Self> {
        Ok(Self {
            user_id: user_id.trim().to_string(),
            hint: hint.to_string(),
            comment: comment.to_string(),
            extra_params: parse_extra_params(extra_params)?,
        })
    }
}

/// 分析流程的 prompt 變數，圖片本身是唯一的附加 payload
pub fn analyze_context(shared: &SharedContext, item: &AnalysisItem) -> PromptContext {
    PromptContext::new()
        .with_variable("imageId", item.item_id.clone())
        .with_variable("userId", anonymize_user_id(&shared.user_id))
        .with_variable("hint", escape_for_prompt(&shared.hint))
        .with_variable("comment", escape_for_prompt(&shared.comment))
        .with_variable("extraParams", shared.extra_params.join(", "))
        .with_variable("extraParamsText", extra_params_text(&shared.extra_params))
        .with_image(item.raw_bytes.clone())
}

pub struct PromptRenderer;

impl PromptRenderer {
    /// 代入 `{{name}}` 標記；找不到對應變數的標記原樣保留。
    /// 有圖片時，在本文之後依序附上每張圖片的區塊。
    pub fn render(template: &Template, context: &PromptContext) -> String {
        let body = placeholder_pattern().replace_all(&template.text, |caps: &regex::Captures| {
            match context.variables.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        });

        let mut prompt = body.into_owned();
        for (index, image) in context.images.iter().enumerate() {
            prompt.push('\n');
            prompt.push_str(&image_start_marker(index));
            prompt.push('\n');
            prompt.push_str(IMAGE_PAYLOAD_PREFIX);
            prompt.push_str(&general_purpose::STANDARD.encode(image));
            prompt.push('\n');
            prompt.push_str(&image_end_marker(index));
        }

        tracing::debug!(
            template = %template.key,
            template_hash = %template.content_hash,
            images = context.images.len(),
            prompt_hash = %content_digest(prompt.as_bytes()),
            "Rendered prompt"
        );

        prompt
    }
}

/// `PromptRenderer::render` 的反向操作：拆出文字本文與每張圖片的 base64
pub fn split_image_blocks(prompt: &str) -> (String, Vec<String>) {
    let first_marker = format!("\n{}\n", image_start_marker(0));
    let Some(start) = prompt.rfind(&first_marker) else {
        return (prompt.to_string(), Vec::new());
    };

    let mut images = Vec::new();
    let mut lines = prompt[start + 1..].lines();
    while let Some(line) = lines.next() {
        let index = images.len();
        if line != image_start_marker(index) {
            break;
        }
        let Some(payload) = lines.next().and_then(|l| l.strip_prefix(IMAGE_PAYLOAD_PREFIX)) else {
            break;
        };
        if lines.next() != Some(image_end_marker(index).as_str()) {
            break;
        }
        images.push(payload.to_string());
    }

    (prompt[..start].to_string(), images)
}
