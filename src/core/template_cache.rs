use crate::config::toml_config::{ServiceConfig, TemplateSourceConfig};
use crate::domain::model::{Template, TemplateSourceKind};
use crate::utils::error::{AnalysisError, Result};
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REMOTE_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// 提示詞模板快取
///
/// 讀取 (`get`) 只看記憶體中最後一次成功載入的版本，不會碰網路。
/// 載入時先試遠端，再退回本地檔案；兩者都失敗時保留舊值。
/// 每個 key 的值是 `Arc<Template>`，更新時整個參考替換，讀者不會看到半更新的模板。
pub struct TemplateCache {
    client: Client,
    sources: BTreeMap<String, TemplateSourceConfig>,
    base_dir: PathBuf,
    remote_token: Option<String>,
    entries: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateCache {
    pub fn new(
        sources: BTreeMap<String, TemplateSourceConfig>,
        base_dir: impl Into<PathBuf>,
        remote_token: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            sources,
            base_dir: base_dir.into(),
            remote_token,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.templates.sets.clone(),
            config.template_base_dir(),
            config.remote_token(),
        )
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Result<Arc<Template>> {
        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| AnalysisError::TemplateNotFound {
                key: key.to_string(),
            })
    }

    /// 直接放入一份模板，取代同 key 的舊值
    pub fn insert(&self, template: Template) -> Arc<Template> {
        let template = Arc::new(template);
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(template.key.clone(), Arc::clone(&template));
        template
    }

    pub async fn load(&self, key: &str) -> Result<Arc<Template>> {
        let source = self
            .sources
            .get(key)
            .ok_or_else(|| AnalysisError::TemplateNotFound {
                key: key.to_string(),
            })?;

        let mut failures = Vec::new();

        if let Some(url) = &source.remote_url {
            match self.fetch_remote(url).await {
                Ok(text) => {
                    tracing::info!("🌐 Loaded template '{}' from {}", key, url);
                    return Ok(self.store(key, text, TemplateSourceKind::Remote));
                }
                Err(reason) => {
                    tracing::warn!("⚠️ Remote template '{}' unavailable: {}", key, reason);
                    failures.push(format!("remote: {}", reason));
                }
            }
        }

        if let Some(local_path) = &source.local_path {
            let path = self.resolve_local(local_path);
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    tracing::info!("📄 Loaded template '{}' from {}", key, path.display());
                    return Ok(self.store(key, text, TemplateSourceKind::Local));
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Local template '{}' unavailable at {}: {}",
                        key,
                        path.display(),
                        e
                    );
                    failures.push(format!("local {}: {}", path.display(), e));
                }
            }
        }

        if failures.is_empty() {
            failures.push("no source configured".to_string());
        }

        Err(AnalysisError::LoadFailure {
            key: key.to_string(),
            message: failures.join("; "),
        })
    }

    /// 載入所有已設定的 key，失敗只記錄不中斷，回傳成功數量
    pub async fn load_all(&self) -> usize {
        let mut loaded = 0;
        for key in self.sources.keys() {
            match self.load(key).await {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!("⚠️ Template refresh failed for '{}': {}", key, e),
            }
        }
        loaded
    }

    /// 背景定時刷新；取消 token 後結束。間隔必須大於零
    pub fn spawn_refresh(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        if interval.is_zero() {
            return Err(AnalysisError::ConfigError {
                message: "template refresh interval must be greater than zero".to_string(),
            });
        }
        tracing::info!("🔄 Template auto-refresh enabled, interval {:?}", interval);

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let loaded = self.load_all().await;
                        tracing::debug!("Template refresh finished ({}/{} loaded)", loaded, self.sources.len());
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("Template auto-refresh stopped");
                        break;
                    }
                }
            }
        }))
    }

    fn store(&self, key: &str, text: String, source_kind: TemplateSourceKind) -> Arc<Template> {
        let template = self.insert(Template::new(key, text, source_kind));
        tracing::info!(
            template = %key,
            hash = %template.content_hash,
            source = ?template.source_kind,
            "Template cached"
        );
        template
    }

    async fn fetch_remote(&self, url: &str) -> std::result::Result<String, String> {
        let mut request = self.client.get(url).timeout(REMOTE_FETCH_TIMEOUT);
        if let Some(token) = &self.remote_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status().as_u16()));
        }

        response.text().await.map_err(|e| e.to_string())
    }

    fn resolve_local(&self, local_path: &str) -> PathBuf {
        let path = Path::new(local_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tempfile::TempDir;

    fn sources(remote_url: Option<String>, local_path: Option<&str>) -> BTreeMap<String, TemplateSourceConfig> {
        let mut sources = BTreeMap::new();
        sources.insert(
            "analyze".to_string(),
            TemplateSourceConfig {
                remote_url,
                local_path: local_path.map(str::to_string),
            },
        );
        sources
    }

    #[tokio::test]
    async fn test_load_prefers_remote() {
        let server = MockServer::start();
        let remote_mock = server.mock(|when, then| {
            when.method(GET).path("/analyze.txt");
            then.status(200).body("remote {{hint}}");
        });

        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("analyze.txt"), "local {{hint}}").unwrap();

        let cache = TemplateCache::new(
            sources(Some(server.url("/analyze.txt")), Some("analyze.txt")),
            temp_dir.path(),
            None,
        );

        let template = cache.load("analyze").await.unwrap();

        remote_mock.assert();
        assert_eq!(template.text, "remote {{hint}}");
        assert_eq!(template.source_kind, TemplateSourceKind::Remote);
        assert_eq!(cache.get("analyze").unwrap().content_hash, template.content_hash);
    }

    #[tokio::test]
    async fn test_load_falls_back_to_local_on_remote_error() {
        let server = MockServer::start();
        let remote_mock = server.mock(|when, then| {
            when.method(GET).path("/analyze.txt");
            then.status(500);
        });

        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("analyze.txt"), "local {{hint}}").unwrap();

        let cache = TemplateCache::new(
            sources(Some(server.url("/analyze.txt")), Some("analyze.txt")),
            temp_dir.path(),
            None,
        );

        let template = cache.load("analyze").await.unwrap();

        remote_mock.assert();
        assert_eq!(template.text, "local {{hint}}");
        assert_eq!(template.source_kind, TemplateSourceKind::Local);
    }

    #[tokio::test]
    async fn test_load_local_only() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("analyze.txt"), "only local").unwrap();

        let cache = TemplateCache::new(sources(None, Some("analyze.txt")), temp_dir.path(), None);

        let template = cache.load("analyze").await.unwrap();
        assert_eq!(template.source_kind, TemplateSourceKind::Local);
    }

    #[tokio::test]
    async fn test_both_sources_failing_is_load_failure() {
        let temp_dir = TempDir::new().unwrap();
        let cache = TemplateCache::new(sources(None, Some("missing.txt")), temp_dir.path(), None);

        let err = cache.load("analyze").await.unwrap_err();
        assert!(matches!(err, AnalysisError::LoadFailure { .. }));

        let err = cache.get("analyze").unwrap_err();
        assert!(matches!(err, AnalysisError::TemplateNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let cache = TemplateCache::new(BTreeMap::new(), ".", None);
        assert!(matches!(
            cache.load("correction").await,
            Err(AnalysisError::TemplateNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_template() {
        let server = MockServer::start();
        let mut ok_mock = server.mock(|when, then| {
            when.method(GET).path("/analyze.txt");
            then.status(200).body("version one");
        });

        let temp_dir = TempDir::new().unwrap();
        let cache = TemplateCache::new(
            sources(Some(server.url("/analyze.txt")), Some("missing.txt")),
            temp_dir.path(),
            None,
        );

        cache.load("analyze").await.unwrap();
        ok_mock.delete();

        let failing_mock = server.mock(|when, then| {
            when.method(GET).path("/analyze.txt");
            then.status(503);
        });

        assert!(cache.load("analyze").await.is_err());
        assert_eq!(cache.load_all().await, 0);
        failing_mock.assert_hits(2);

        let cached = cache.get("analyze").unwrap();
        assert_eq!(cached.text, "version one");
        assert_eq!(cached.source_kind, TemplateSourceKind::Remote);
    }

    #[tokio::test]
    async fn test_remote_token_sent_as_bearer() {
        let server = MockServer::start();
        let remote_mock = server.mock(|when, then| {
            when.method(GET)
                .path("/analyze.txt")
                .header("Authorization", "Bearer raw-token");
            then.status(200).body("authorized");
        });

        let cache = TemplateCache::new(
            sources(Some(server.url("/analyze.txt")), None),
            ".",
            Some("raw-token".to_string()),
        );

        let template = cache.load("analyze").await.unwrap();
        remote_mock.assert();
        assert_eq!(template.text, "authorized");
    }

    #[tokio::test]
    async fn test_background_refresh_replaces_template() {
        let server = MockServer::start();
        let mut first = server.mock(|when, then| {
            when.method(GET).path("/analyze.txt");
            then.status(200).body("v1");
        });

        let cache = Arc::new(TemplateCache::new(
            sources(Some(server.url("/analyze.txt")), None),
            ".",
            None,
        ));
        cache.load_all().await;
        assert_eq!(cache.get("analyze").unwrap().text, "v1");

        first.delete();
        server.mock(|when, then| {
            when.method(GET).path("/analyze.txt");
            then.status(200).body("v2");
        });

        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&cache)
            .spawn_refresh(Duration::from_millis(30), shutdown.clone())
            .unwrap();

        let mut refreshed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if cache.get("analyze").unwrap().text == "v2" {
                refreshed = true;
                break;
            }
        }

        shutdown.cancel();
        handle.await.unwrap();
        assert!(refreshed);
    }

    #[tokio::test]
    async fn test_zero_refresh_interval_is_rejected() {
        let cache = Arc::new(TemplateCache::new(BTreeMap::new(), ".", None));
        let err = cache
            .spawn_refresh(Duration::ZERO, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::ConfigError { .. }));
    }
}
