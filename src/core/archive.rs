use crate::domain::ports::{ArchiveRecord, ResponseArchive, Storage};
use crate::utils::error::{AnalysisError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

const ARCHIVE_PREFIX: &str = "llm_raw";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveMeta<'a> {
    request_id: &'a str,
    user_id: &'a str,
    item_id: &'a str,
    received_bytes: usize,
    timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveDocument<'a> {
    meta: ArchiveMeta<'a>,
    raw_response: &'a str,
}

/// 以 Storage 後端封存 LLM 原始回應
///
/// 路徑格式：`llm_raw/{yyyyMMdd}/{itemId}_{HHmmss}_{writeId}.json`
/// 相同內容的圖片 item id 相同，writeId 讓每次寫入各自成檔
pub struct FileArchive<S: Storage> {
    storage: S,
}

impl<S: Storage> FileArchive<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn archive_path(item_id: &str, now: &DateTime<Utc>, write_id: &str) -> String {
        format!(
            "{}/{}/{}_{}_{}.json",
            ARCHIVE_PREFIX,
            now.format("%Y%m%d"),
            item_id,
            now.format("%H%M%S"),
            write_id
        )
    }
}

#[async_trait]
impl<S: Storage> ResponseArchive for FileArchive<S> {
    async fn save_raw(&self, record: &ArchiveRecord) -> Result<String> {
        let now = Utc::now();
        let write_id = Uuid::new_v4().simple().to_string();
        let path = Self::archive_path(&record.item_id, &now, &write_id[..12]);

        let document = ArchiveDocument {
            meta: ArchiveMeta {
                request_id: &record.request_id,
                user_id: &record.user_id,
                item_id: &record.item_id,
                received_bytes: record.received_bytes,
                timestamp: now.to_rfc3339(),
            },
            raw_response: &record.raw_response,
        };

        let data = serde_json::to_vec_pretty(&document)?;
        self.storage
            .write_file(&path, &data)
            .await
            .map_err(|e| AnalysisError::PersistenceError {
                message: format!("failed to write {}: {}", path, e),
            })?;

        tracing::debug!("💾 Archived raw response to {}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::cli::LocalStorage;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record() -> ArchiveRecord {
        ArchiveRecord {
            request_id: "req-1".to_string(),
            user_id: "anon".to_string(),
            item_id: "abc123".to_string(),
            received_bytes: 2048,
            raw_response: r#"{"choices":[]}"#.to_string(),
        }
    }

    #[test]
    fn test_archive_path_layout() {
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            FileArchive::<LocalStorage>::archive_path("abc123", &now, "0f3a9c"),
            "llm_raw/20250309/abc123_070501_0f3a9c.json"
        );
    }

    #[tokio::test]
    async fn test_save_raw_writes_meta_and_body() {
        let temp_dir = TempDir::new().unwrap();
        let archive = FileArchive::new(LocalStorage::new(temp_dir.path()));

        let path = archive.save_raw(&record()).await.unwrap();
        assert!(path.starts_with("llm_raw/"));
        assert!(path.ends_with(".json"));

        let written = std::fs::read_to_string(temp_dir.path().join(&path)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(json["meta"]["requestId"], "req-1");
        assert_eq!(json["meta"]["itemId"], "abc123");
        assert_eq!(json["meta"]["receivedBytes"], 2048);
        assert!(json["meta"]["timestamp"].is_string());
        assert_eq!(json["rawResponse"], r#"{"choices":[]}"#);
    }

    #[tokio::test]
    async fn test_identical_records_do_not_overwrite_each_other() {
        let temp_dir = TempDir::new().unwrap();
        let archive = FileArchive::new(LocalStorage::new(temp_dir.path()));

        let first = archive.save_raw(&record()).await.unwrap();
        let second = archive.save_raw(&record()).await.unwrap();

        assert_ne!(first, second);
        assert!(temp_dir.path().join(&first).exists());
        assert!(temp_dir.path().join(&second).exists());
    }

    #[tokio::test]
    async fn test_unwritable_storage_is_persistence_error() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocked");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let archive = FileArchive::new(LocalStorage::new(&blocker));
        let err = archive.save_raw(&record()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::PersistenceError { .. }));
    }
}
