use crate::domain::ports::Storage;
use crate::utils::error::Result;
use std::path::{Path, PathBuf};

/// 以本機目錄作為儲存後端
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl Storage for LocalStorage {
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.base_path.join(path);

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(full_path, data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_nested_directories() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());

        storage
            .write_file("llm_raw/20250101/abc.json", b"{}")
            .await
            .unwrap();

        let data = std::fs::read(temp_dir.path().join("llm_raw/20250101/abc.json")).unwrap();
        assert_eq!(data, b"{}");
    }

    #[tokio::test]
    async fn test_write_under_a_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("llm_raw"), b"not a directory").unwrap();
        let storage = LocalStorage::new(temp_dir.path());

        let err = storage.write_file("llm_raw/abc.json", b"{}").await.unwrap_err();
        assert!(matches!(err, crate::utils::error::AnalysisError::IoError(_)));
    }
}
