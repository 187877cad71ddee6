//! 数据源字段目录缓存（内存 + 磁盘两级，可选 TTL）
//!
//! - 内存层按 datasourceLuid 键控，条目带写入时间
//! - 磁盘层位于 `<cache_dir>/<site>/<LUID>.json`，以文件修改时间计龄
//! - TTL = 0 表示永不过期；过期条目视为未命中，但仍可作为「最后已知值」返回
//! - 两级都未命中时经连接器拉取原始 schema 并规范化；仅在得到 ≥1 个字段时写入两级
//!
//! 本缓存从不返回错误：失败时返回最后已知值（可能为 None），并按数据源通过 last_error 暴露原因。
//! 由进程构造一次后注入各阶段，测试可构造独立实例。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use regex::Regex;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::connector::DatasourceConnector;
use crate::memory::normalize::{normalize_fields, NormalizedField};

/// 命中来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOrigin {
    Memory,
    Disk,
    Source,
    /// 拉取失败时退回的过期条目
    Stale,
}

impl CacheOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOrigin::Memory => "memory",
            CacheOrigin::Disk => "disk",
            CacheOrigin::Source => "source",
            CacheOrigin::Stale => "stale",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CachedFields {
    pub fields: Vec<NormalizedField>,
    pub origin: CacheOrigin,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    fields: Vec<NormalizedField>,
    stored_at: SystemTime,
}

fn unsafe_path_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("static regex"))
}

/// 站点名 / LUID 转为安全的路径片段
pub fn path_segment(raw: &str) -> String {
    let cleaned = unsafe_path_chars().replace_all(raw.trim(), "_").into_owned();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

pub struct MetadataCache {
    connector: Arc<dyn DatasourceConnector>,
    dir: PathBuf,
    ttl: Option<Duration>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// datasourceLuid -> 最近一次拉取失败原因；成功拉取后清除
    errors: RwLock<HashMap<String, String>>,
}

impl MetadataCache {
    /// cache_dir 为磁盘层根目录，实际写入 `<cache_dir>/<site>/`；ttl_ms = 0 表示不过期
    pub fn new(
        connector: Arc<dyn DatasourceConnector>,
        cache_dir: impl AsRef<Path>,
        site_name: &str,
        ttl_ms: u64,
    ) -> Self {
        Self {
            connector,
            dir: cache_dir.as_ref().join(path_segment(site_name)),
            ttl: (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms)),
            entries: RwLock::new(HashMap::new()),
            errors: RwLock::new(HashMap::new()),
        }
    }

    pub fn disk_path(&self, datasource_luid: &str) -> PathBuf {
        self.dir.join(format!("{}.json", path_segment(datasource_luid)))
    }

    fn is_expired(&self, stored_at: SystemTime) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => match SystemTime::now().duration_since(stored_at) {
                Ok(age) => age > ttl,
                // 时钟回拨：按未过期处理
                Err(_) => false,
            },
        }
    }

    pub async fn get(&self, datasource_luid: &str) -> Option<CachedFields> {
        self.get_cached(datasource_luid, false).await
    }

    /// 跳过两级缓存直接向数据源拉取
    pub async fn force_refresh(&self, datasource_luid: &str) -> Option<CachedFields> {
        self.get_cached(datasource_luid, true).await
    }

    pub async fn get_cached(&self, datasource_luid: &str, force: bool) -> Option<CachedFields> {
        let hit = self.entries.read().await.get(datasource_luid).cloned();

        if !force {
            if let Some(entry) = hit.as_ref() {
                if !entry.fields.is_empty() && !self.is_expired(entry.stored_at) {
                    tracing::debug!(datasource = %datasource_luid, count = entry.fields.len(), "metadata cache hit");
                    return Some(CachedFields {
                        fields: entry.fields.clone(),
                        origin: CacheOrigin::Memory,
                    });
                }
            }
            if let Some(entry) = self.read_disk(datasource_luid).await {
                tracing::debug!(datasource = %datasource_luid, count = entry.fields.len(), "metadata disk hit");
                let fields = entry.fields.clone();
                self.entries
                    .write()
                    .await
                    .insert(datasource_luid.to_string(), entry);
                return Some(CachedFields {
                    fields,
                    origin: CacheOrigin::Disk,
                });
            }
        }

        match self.connector.read_metadata(datasource_luid).await {
            Ok(raw) => {
                let fields = normalize_fields(&raw);
                if !fields.is_empty() {
                    self.write_disk(datasource_luid, &fields).await;
                    self.entries.write().await.insert(
                        datasource_luid.to_string(),
                        CacheEntry {
                            fields: fields.clone(),
                            stored_at: SystemTime::now(),
                        },
                    );
                    self.errors.write().await.remove(datasource_luid);
                    tracing::info!(datasource = %datasource_luid, count = fields.len(), "metadata fetched");
                    return Some(CachedFields {
                        fields,
                        origin: CacheOrigin::Source,
                    });
                }
                self.record_error(datasource_luid, "metadata response contained no fields".to_string())
                    .await;
            }
            Err(e) => {
                self.record_error(datasource_luid, e.to_string()).await;
            }
        }

        hit.filter(|e| !e.fields.is_empty()).map(|e| CachedFields {
            fields: e.fields,
            origin: CacheOrigin::Stale,
        })
    }

    /// 清除内存与磁盘两级条目
    pub async fn invalidate(&self, datasource_luid: &str) {
        self.entries.write().await.remove(datasource_luid);
        let path = self.disk_path(datasource_luid);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove metadata cache file");
            }
        }
    }

    /// 该数据源最近一次拉取失败的原因
    pub async fn last_error(&self, datasource_luid: &str) -> Option<String> {
        self.errors.read().await.get(datasource_luid).cloned()
    }

    async fn record_error(&self, datasource_luid: &str, message: String) {
        tracing::warn!(datasource = %datasource_luid, error = %message, "metadata fetch failed");
        self.errors
            .write()
            .await
            .insert(datasource_luid.to_string(), message);
    }

    async fn read_disk(&self, datasource_luid: &str) -> Option<CacheEntry> {
        let path = self.disk_path(datasource_luid);
        let stored_at = tokio::fs::metadata(&path).await.ok()?.modified().ok()?;
        if self.is_expired(stored_at) {
            return None;
        }
        let text = tokio::fs::read_to_string(&path).await.ok()?;
        let fields: Vec<NormalizedField> = serde_json::from_str(&text).ok()?;
        if fields.is_empty() {
            return None;
        }
        Some(CacheEntry { fields, stored_at })
    }

    /// 磁盘层写失败只记录日志；并发写同一数据源时以最后写入为准
    async fn write_disk(&self, datasource_luid: &str, fields: &[NormalizedField]) {
        let path = self.disk_path(datasource_luid);
        let result: std::io::Result<()> = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            let body = serde_json::to_string_pretty(fields)?;
            tokio::fs::write(&path, body).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to write metadata cache file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorError, DatasourceInfo, QueryRequest};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubConnector {
        responses: Mutex<Vec<Result<Value, ConnectorError>>>,
        calls: AtomicUsize,
    }

    impl StubConnector {
        fn new(responses: Vec<Result<Value, ConnectorError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DatasourceConnector for StubConnector {
        async fn query_datasource(&self, _req: &QueryRequest) -> Result<Value, ConnectorError> {
            Err(ConnectorError::Tool("unused".into()))
        }

        async fn read_metadata(&self, _luid: &str) -> Result<Value, ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(ConnectorError::Tool("no more responses".into()))
            } else {
                responses.remove(0)
            }
        }

        async fn list_datasources(&self) -> Result<Vec<DatasourceInfo>, ConnectorError> {
            Ok(vec![])
        }
    }

    fn sales_payload() -> Value {
        json!({"data": [{"fieldCaption": "Sales", "defaultAggregation": "SUM"}, {"fieldCaption": "Region"}]})
    }

    #[tokio::test]
    async fn test_fetch_then_memory_hit() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubConnector::new(vec![Ok(sales_payload())]);
        let cache = MetadataCache::new(stub.clone(), dir.path(), "my site", 0);

        let first = cache.get("ds-1").await.unwrap();
        assert_eq!(first.origin, CacheOrigin::Source);
        assert_eq!(first.fields.len(), 2);

        let second = cache.get("ds-1").await.unwrap();
        assert_eq!(second.origin, CacheOrigin::Memory);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
        assert!(cache.disk_path("ds-1").ends_with("my_site/ds-1.json"));
        assert!(cache.disk_path("ds-1").exists());
    }

    #[tokio::test]
    async fn test_disk_tier_shared_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubConnector::new(vec![Ok(sales_payload())]);
        MetadataCache::new(stub, dir.path(), "default", 0)
            .get("ds-1")
            .await
            .unwrap();

        let offline = StubConnector::new(vec![]);
        let cache = MetadataCache::new(offline.clone(), dir.path(), "default", 0);
        let hit = cache.get("ds-1").await.unwrap();
        assert_eq!(hit.origin, CacheOrigin::Disk);
        assert_eq!(offline.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_normalization_not_cached_and_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubConnector::new(vec![Ok(json!({"data": []}))]);
        let cache = MetadataCache::new(stub, dir.path(), "default", 0);
        assert!(cache.get("ds-1").await.is_none());
        assert!(cache.last_error("ds-1").await.unwrap().contains("no fields"));
        assert!(!cache.disk_path("ds-1").exists());
    }

    #[tokio::test]
    async fn test_expired_entry_returned_as_stale_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubConnector::new(vec![
            Ok(sales_payload()),
            Err(ConnectorError::Request("connection refused".into())),
        ]);
        let cache = MetadataCache::new(stub.clone(), dir.path(), "default", 1);
        cache.get("ds-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stale = cache.get("ds-1").await.unwrap();
        assert_eq!(stale.origin, CacheOrigin::Stale);
        assert_eq!(stale.fields.len(), 2);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
        assert!(cache.last_error("ds-1").await.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_force_refresh_and_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubConnector::new(vec![Ok(sales_payload()), Ok(sales_payload())]);
        let cache = MetadataCache::new(stub.clone(), dir.path(), "default", 0);
        cache.get("ds-1").await.unwrap();
        let refreshed = cache.force_refresh("ds-1").await.unwrap();
        assert_eq!(refreshed.origin, CacheOrigin::Source);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);

        cache.invalidate("ds-1").await;
        assert!(!cache.disk_path("ds-1").exists());
        assert!(cache.get("ds-1").await.is_none());
    }

    #[tokio::test]
    async fn test_errors_are_tracked_per_datasource() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubConnector::new(vec![
            Err(ConnectorError::Request("ds-a offline".into())),
            Ok(sales_payload()),
            Err(ConnectorError::Tool("ds-c forbidden".into())),
        ]);
        let cache = MetadataCache::new(stub, dir.path(), "default", 0);

        assert!(cache.get("ds-a").await.is_none());
        assert!(cache.get("ds-b").await.is_some());
        assert!(cache.last_error("ds-a").await.unwrap().contains("ds-a offline"));
        assert_eq!(cache.last_error("ds-b").await, None);

        assert!(cache.get("ds-c").await.is_none());
        assert!(cache.last_error("ds-a").await.unwrap().contains("ds-a offline"));
        assert!(cache.last_error("ds-c").await.unwrap().contains("ds-c forbidden"));
    }

    #[tokio::test]
    async fn test_successful_fetch_clears_own_error() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubConnector::new(vec![
            Err(ConnectorError::Request("timeout".into())),
            Ok(sales_payload()),
        ]);
        let cache = MetadataCache::new(stub, dir.path(), "default", 0);
        assert!(cache.get("ds-1").await.is_none());
        assert!(cache.last_error("ds-1").await.is_some());
        assert!(cache.get("ds-1").await.is_some());
        assert_eq!(cache.last_error("ds-1").await, None);
    }

    #[test]
    fn test_path_segment_sanitizes() {
        assert_eq!(path_segment("acme/prod site"), "acme_prod_site");
        assert_eq!(path_segment(""), "default");
    }
}
