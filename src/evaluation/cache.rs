//! Content-addressed cache of evaluator outputs.
//!
//! Keys are a stable digest of (model, template, normalized input), so
//! caches survive restarts. Two backends: in-memory for tests and
//! short-lived engines, SQLite-on-disk for everything else. At most one
//! in-flight build runs per key; concurrent requests for the same key await
//! the first instead of duplicating the model call.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::config::{CacheBackend, CacheConfig};
use crate::error::{Error, Result};
use crate::evaluation::types::EvaluationRecord;

/// Compute the cache key for one evaluator call.
///
/// Input bytes are normalized (trimmed, CRLF collapsed) so cosmetic
/// differences don't defeat the cache.
pub fn cache_key(model: &str, template_id: &str, input: &str) -> String {
    let normalized = input.trim().replace("\r\n", "\n");
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(template_id.as_bytes());
    hasher.update([0]);
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
struct StoredEntry {
    record: EvaluationRecord,
    created_at: DateTime<Utc>,
}

enum Backend {
    Memory(RwLock<HashMap<String, StoredEntry>>),
    Disk(DiskStore),
}

/// Evaluation record cache with TTL and single-flight builds.
pub struct EvaluationCache {
    enabled: bool,
    ttl: Duration,
    backend: Backend,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EvaluationCache {
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let backend = match config.backend {
            CacheBackend::Memory => Backend::Memory(RwLock::new(HashMap::new())),
            CacheBackend::Disk => {
                let dir = config.resolved_location();
                std::fs::create_dir_all(&dir).map_err(|e| Error::cache_io(e.to_string()))?;
                Backend::Disk(DiskStore::open(
                    dir.join("evaluations.db"),
                    config.max_size_mb * 1024 * 1024,
                )?)
            }
        };
        Ok(Self {
            enabled: config.enabled,
            ttl: Duration::seconds(config.ttl_seconds as i64),
            backend,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// In-memory cache with the given TTL, primarily for tests.
    pub fn in_memory(ttl_seconds: u64) -> Self {
        Self {
            enabled: true,
            ttl: Duration::seconds(ttl_seconds as i64),
            backend: Backend::Memory(RwLock::new(HashMap::new())),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a fresh entry. Entries older than the TTL are never returned.
    pub async fn get(&self, key: &str) -> Result<Option<EvaluationRecord>> {
        if !self.enabled {
            return Ok(None);
        }
        let now = Utc::now();
        match &self.backend {
            Backend::Memory(map) => {
                let expired = {
                    let map = map.read().await;
                    match map.get(key) {
                        None => return Ok(None),
                        Some(entry) if now - entry.created_at <= self.ttl => {
                            return Ok(Some(entry.record.clone()));
                        }
                        Some(_) => true,
                    }
                };
                if expired {
                    map.write().await.remove(key);
                }
                Ok(None)
            }
            Backend::Disk(store) => store.get(key, now, self.ttl),
        }
    }

    /// Insert a record. Failed records are never cached.
    pub async fn put(&self, key: &str, record: &EvaluationRecord) -> Result<()> {
        if !self.enabled || !record.success {
            return Ok(());
        }
        match &self.backend {
            Backend::Memory(map) => {
                map.write().await.insert(
                    key.to_string(),
                    StoredEntry {
                        record: record.clone(),
                        created_at: Utc::now(),
                    },
                );
                Ok(())
            }
            Backend::Disk(store) => store.put(key, record),
        }
    }

    /// Drop every entry whose key satisfies the predicate. Returns the
    /// number of entries removed.
    pub async fn invalidate_matching(&self, predicate: impl Fn(&str) -> bool) -> Result<usize> {
        match &self.backend {
            Backend::Memory(map) => {
                let mut map = map.write().await;
                let before = map.len();
                map.retain(|k, _| !predicate(k));
                Ok(before - map.len())
            }
            Backend::Disk(store) => store.invalidate_matching(&predicate),
        }
    }

    /// Serve from the cache, or run `build` — at most once per key across
    /// concurrent callers. Cache I/O failures degrade to a direct build.
    pub async fn get_or_build<F, Fut>(&self, key: &str, build: F) -> EvaluationRecord
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = EvaluationRecord>,
    {
        if !self.enabled {
            return build().await;
        }

        if let Some(hit) = self.read_fresh(key).await {
            return hit;
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = gate.lock().await;

        // A concurrent builder may have finished while we waited.
        if let Some(hit) = self.read_fresh(key).await {
            drop(guard);
            self.forget_inflight(key).await;
            return hit;
        }

        let record = build().await;
        if let Err(e) = self.put(key, &record).await {
            warn!(key, error = %e, "cache write failed; continuing uncached");
        }
        drop(guard);
        self.forget_inflight(key).await;
        record
    }

    async fn read_fresh(&self, key: &str) -> Option<EvaluationRecord> {
        match self.get(key).await {
            Ok(Some(mut record)) => {
                record.cached = true;
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn forget_inflight(&self, key: &str) {
        self.inflight.lock().await.remove(key);
    }
}

/// SQLite-backed persistent store.
struct DiskStore {
    conn: Arc<StdMutex<Connection>>,
    max_bytes: u64,
}

impl DiskStore {
    fn open(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::cache_io(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                key        TEXT PRIMARY KEY,
                record     TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entries_created ON entries(created_at);",
        )
        .map_err(|e| Error::cache_io(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
            max_bytes,
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::cache_io(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::cache_io(e.to_string()))
    }

    fn get(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Result<Option<EvaluationRecord>> {
        let row: Option<(String, i64)> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT record, created_at FROM entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })?;

        let Some((json, created_at)) = row else {
            return Ok(None);
        };

        if now.timestamp_millis() - created_at > ttl.num_milliseconds() {
            self.with_conn(|conn| {
                conn.execute("DELETE FROM entries WHERE key = ?1", params![key])
            })?;
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&json)?))
    }

    fn put(&self, key: &str, record: &EvaluationRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let size = json.len() as i64;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO entries (key, record, created_at, size_bytes)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, json, Utc::now().timestamp_millis(), size],
            )
        })?;
        self.enforce_size_cap()
    }

    /// Evict least-recently-inserted entries until under the byte cap.
    fn enforce_size_cap(&self) -> Result<()> {
        loop {
            let total: i64 = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT COALESCE(SUM(size_bytes), 0) FROM entries",
                    [],
                    |row| row.get(0),
                )
            })?;
            if (total as u64) <= self.max_bytes {
                return Ok(());
            }
            let evicted = self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM entries WHERE key IN (
                        SELECT key FROM entries ORDER BY created_at ASC LIMIT 1
                    )",
                    [],
                )
            })?;
            if evicted == 0 {
                return Ok(());
            }
        }
    }

    fn invalidate_matching(&self, predicate: &dyn Fn(&str) -> bool) -> Result<usize> {
        let keys: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM entries")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })?;

        let mut removed = 0;
        for key in keys.into_iter().filter(|k| predicate(k)) {
            removed += self.with_conn(|conn| {
                conn.execute("DELETE FROM entries WHERE key = ?1", params![key])
            })?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LayerRole;
    use crate::evaluation::prompts::TemplateId;
    use crate::evaluation::types::{ParsedEvaluation, TokenUsage};
    use crate::neutrosophic::NeutrosophicValue;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_record() -> EvaluationRecord {
        let parsed = ParsedEvaluation {
            truth: 0.8,
            indeterminacy: 0.1,
            falsehood: 0.1,
            reasoning: "balanced".to_string(),
            patterns_observed: Vec::new(),
            consensus_patterns: Vec::new(),
            exchange_type: None,
            trust_established: None,
            trust_claimed: None,
            trust_gap: None,
            coerced: false,
        };
        EvaluationRecord::success(
            TemplateId::AyniRelational,
            "test/model",
            Some(LayerRole::User),
            1,
            NeutrosophicValue::new(0.8, 0.1, 0.1).unwrap(),
            parsed,
            TokenUsage::default(),
            12,
        )
    }

    #[test]
    fn test_cache_key_stability_and_normalization() {
        let a = cache_key("m", "ayni_relational", "hello\r\nworld");
        let b = cache_key("m", "ayni_relational", "hello\nworld  ");
        let c = cache_key("m", "observer", "hello\nworld");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_memory_roundtrip_and_ttl() {
        let cache = EvaluationCache::in_memory(3600);
        let record = sample_record();
        let key = cache_key("m", "t", "input");

        assert!(cache.get(&key).await.unwrap().is_none());
        cache.put(&key, &record).await.unwrap();
        let hit = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(hit.id, record.id);

        let expired = EvaluationCache::in_memory(0);
        expired.put(&key, &record).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(expired.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_records_not_cached() {
        let cache = EvaluationCache::in_memory(3600);
        let record = EvaluationRecord::failure(
            TemplateId::Observer,
            "m",
            None,
            1,
            crate::evaluation::types::ErrorKind::Timeout,
            "deadline",
            100,
        );
        let key = cache_key("m", "observer", "x");
        cache.put(&key, &record).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_or_build_builds_once() {
        let cache = Arc::new(EvaluationCache::in_memory(3600));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = cache_key("m", "t", "shared");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build(&key, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        sample_record()
                    })
                    .await
            }));
        }

        let records: Vec<EvaluationRecord> =
            futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first_id = records[0].id;
        assert!(records.iter().all(|r| r.id == first_id));
    }

    #[tokio::test]
    async fn test_disabled_cache_bypasses_read_and_write() {
        let cache = EvaluationCache::from_config(&CacheConfig::disabled()).unwrap();
        let key = cache_key("m", "t", "x");
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_build(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sample_record()
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disk_backend_roundtrip_and_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::on_disk(dir.path());
        let cache = EvaluationCache::from_config(&config).unwrap();

        let record = sample_record();
        let key = cache_key("m", "t", "persisted");
        cache.put(&key, &record).await.unwrap();

        let hit = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(hit.model, "test/model");

        let removed = cache.invalidate_matching(|k| k == key).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_size_cap_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("cap.db"), 2500).unwrap();
        let now = Utc::now();

        for i in 0..8 {
            let mut record = sample_record();
            record.reasoning = format!("entry {i} {}", "x".repeat(200));
            store.put(&format!("key-{i}"), &record).unwrap();
            // Distinct insertion timestamps
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let ttl = Duration::seconds(3600);
        // Oldest entries must be gone, newest must remain
        assert!(store.get("key-0", now, ttl).unwrap().is_none());
        assert!(store.get("key-7", Utc::now(), ttl).unwrap().is_some());
    }
}
