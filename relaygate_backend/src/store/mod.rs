//! Persistence layer: namespaced key/value access over the shared store.
//!
//! Everything the relay remembers across requests lives here. The store is
//! the only source of truth; the read cache below is a best-effort shortcut
//! for hot keys that are allowed to lag by a few seconds.

mod breaker;
pub mod keys;

pub use breaker::QuotaBreaker;

use crate::config::StoreConfig;
use crate::database::models::KvEntry;
use crate::database::repositories::{KvRepository, UsageRepository};
use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::utils::{now_unix, until_next_utc_midnight};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Smallest expiry the store provider accepts.
pub const MIN_TTL: Duration = Duration::from_secs(60);

const WIPE_PAGE: usize = 500;
const READ_CACHE_LIMIT: usize = 4096;
const BREAKER_KEY: &str = "setting:quota_breaker";

/// Drops expiries below the provider floor to "no expiry" instead of letting
/// the write fail.
pub fn normalize_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|ttl| *ttl >= MIN_TTL)
}

fn marker_ttl(cooldown: Duration) -> Duration {
    cooldown.max(MIN_TTL)
}

#[derive(Debug, Clone)]
pub enum KvOp {
    Put {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

impl KvOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        KvOp::Put {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvOp::Delete { key: key.into() }
    }

    fn key(&self) -> &str {
        match self {
            KvOp::Put { key, .. } | KvOp::Delete { key } => key,
        }
    }
}

/// Raw store provider. Keys are physical; TTLs are already normalized.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn list(&self, prefix: &str, limit: usize) -> StoreResult<Vec<String>>;
    /// Applies every op or none of them.
    async fn batch(&self, ops: Vec<KvOp>) -> StoreResult<()>;

    /// Writes or clears a control record outside the daily write quota.
    /// The quota marker must land even when the quota is what failed.
    async fn put_control(&self, key: &str, value: Option<&str>, ttl: Option<Duration>) -> StoreResult<()> {
        match value {
            Some(value) => self.put(key, value, ttl).await,
            None => self.delete(key).await,
        }
    }
}

/// SQLite-backed provider that mimics the hosted store's constraints: a
/// 60-second TTL floor and an optional daily write quota.
pub struct SqliteKvBackend {
    database: Database,
    daily_write_quota: Option<u64>,
}

impl SqliteKvBackend {
    pub fn new(database: Database, config: &StoreConfig) -> Self {
        Self {
            database,
            daily_write_quota: config.daily_write_quota,
        }
    }

    fn expires_at(ttl: Option<Duration>) -> StoreResult<Option<i64>> {
        match ttl {
            Some(ttl) if ttl < MIN_TTL => Err(StoreError::Backend(anyhow::anyhow!(
                "expiration ttl must be at least {} seconds",
                MIN_TTL.as_secs()
            ))),
            Some(ttl) => Ok(Some(now_unix() + ttl.as_secs() as i64)),
            None => Ok(None),
        }
    }

    fn apply(&self, ops: &[KvOp], metered: bool) -> StoreResult<()> {
        let mut entries = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                KvOp::Put { key, value, ttl } => entries.push(Some(KvEntry {
                    key: key.clone(),
                    value: value.clone(),
                    expires_at: Self::expires_at(*ttl)?,
                })),
                KvOp::Delete { .. } => entries.push(None),
            }
        }
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let quota = self.daily_write_quota.filter(|_| metered);
        let over_quota = self.database.with_transaction(|repos| {
            if let Some(limit) = quota {
                let total = repos.usage().record_writes(&day, ops.len() as i64)?;
                if total > limit as i64 {
                    return Ok(true);
                }
            }
            let kv = repos.kv();
            for (op, entry) in ops.iter().zip(entries.iter()) {
                match entry {
                    Some(entry) => kv.put(entry)?,
                    None => {
                        kv.delete(op.key())?;
                    }
                }
            }
            Ok(false)
        })?;
        if over_quota {
            return Err(StoreError::QuotaExceeded);
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for SqliteKvBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = now_unix();
        let entry = self.database.with_repositories(|repos| repos.kv().get(key))?;
        match entry {
            Some(entry) if entry.is_expired(now) => {
                self.database
                    .with_repositories(|repos| repos.kv().delete(key))?;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.apply(&[KvOp::put(key, value, ttl)], true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.apply(&[KvOp::delete(key)], true)
    }

    async fn list(&self, prefix: &str, limit: usize) -> StoreResult<Vec<String>> {
        let now = now_unix();
        let keys = self
            .database
            .with_repositories(|repos| repos.kv().list_prefix(prefix, now, limit))?;
        Ok(keys)
    }

    async fn batch(&self, ops: Vec<KvOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.apply(&ops, true)
    }

    async fn put_control(&self, key: &str, value: Option<&str>, ttl: Option<Duration>) -> StoreResult<()> {
        let op = match value {
            Some(value) => KvOp::put(key, value, ttl),
            None => KvOp::delete(key),
        };
        self.apply(&[op], false)
    }
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Serve from (and populate) the in-process read cache for this long.
    pub cache_ttl: Option<Duration>,
}

impl ReadOptions {
    pub fn cached(ttl: Duration) -> Self {
        Self {
            cache_ttl: Some(ttl),
        }
    }
}

struct CachedRead {
    value: Option<String>,
    expires: Instant,
}

#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn KvBackend>,
    read_cache: Arc<Mutex<HashMap<String, CachedRead>>>,
    breaker: QuotaBreaker,
}

impl Storage {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            read_cache: Arc::new(Mutex::new(HashMap::new())),
            breaker: QuotaBreaker::new(),
        }
    }

    pub fn sqlite(database: Database, config: &StoreConfig) -> Self {
        Self::new(Arc::new(SqliteKvBackend::new(database, config)))
    }

    pub fn breaker(&self) -> &QuotaBreaker {
        &self.breaker
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.get_with(key, ReadOptions::default()).await
    }

    pub async fn get_with(&self, key: &str, options: ReadOptions) -> StoreResult<Option<String>> {
        if options.cache_ttl.is_some() {
            if let Some(value) = self.cached(key) {
                return Ok(value);
            }
        }
        let physical = keys::to_physical(key);
        let value = self.observe(self.backend.get(&physical).await).await?;
        if let Some(ttl) = options.cache_ttl {
            self.remember(key, value.clone(), ttl);
        }
        Ok(value)
    }

    /// Reads and decodes a JSON value. Undecodable payloads are logged and
    /// reported as absent so callers fall back to their defaults.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        self.get_json_with(key, ReadOptions::default()).await
    }

    pub async fn get_json_with<T: DeserializeOwned>(
        &self,
        key: &str,
        options: ReadOptions,
    ) -> StoreResult<Option<T>> {
        let Some(raw) = self.get_with(key, options).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding malformed stored value");
                Ok(None)
            }
        }
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.forget_cached(key);
        let physical = keys::to_physical(key);
        let result = self.backend.put(&physical, value, normalize_ttl(ttl)).await;
        self.observe(result).await
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let raw = serde_json::to_string(value).map_err(|err| StoreError::Backend(err.into()))?;
        self.put(key, &raw, ttl).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.forget_cached(key);
        let physical = keys::to_physical(key);
        let result = self.backend.delete(&physical).await;
        self.observe(result).await
    }

    pub async fn delete_many<I, K>(&self, keys_to_delete: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let ops = keys_to_delete.into_iter().map(KvOp::delete).collect();
        self.batch(ops).await
    }

    /// Applies logical-key ops atomically.
    pub async fn batch(&self, ops: Vec<KvOp>) -> StoreResult<()> {
        let physical_ops = ops
            .into_iter()
            .map(|op| {
                self.forget_cached(op.key());
                match op {
                    KvOp::Put { key, value, ttl } => {
                        KvOp::put(keys::to_physical(&key), value, normalize_ttl(ttl))
                    }
                    KvOp::Delete { key } => KvOp::delete(keys::to_physical(&key)),
                }
            })
            .collect();
        let result = self.backend.batch(physical_ops).await;
        self.observe(result).await
    }

    /// Logical keys under `prefix`.
    pub async fn list(&self, prefix: &str, limit: usize) -> StoreResult<Vec<String>> {
        let physical = keys::to_physical(prefix);
        let found = self.observe(self.backend.list(&physical, limit).await).await?;
        Ok(found
            .into_iter()
            .map(|key| keys::to_logical(&key).to_string())
            .collect())
    }

    /// Deletes every key outside the permanent namespaces.
    pub async fn wipe_all(&self) -> StoreResult<usize> {
        let mut removed = 0;
        loop {
            let page = self
                .observe(self.backend.list(keys::DATA_PREFIX, WIPE_PAGE).await)
                .await?;
            if page.is_empty() {
                break;
            }
            let count = page.len();
            let ops = page.into_iter().map(KvOp::delete).collect();
            self.observe(self.backend.batch(ops).await).await?;
            removed += count;
        }
        self.clear_read_cache();
        tracing::info!(removed, "wiped all non-permanent keys");
        Ok(removed)
    }

    /// Cheap check callers run before attempting store work. Consults the
    /// local breaker first, then the shared marker another instance may
    /// have written.
    pub async fn quota_exceeded(&self) -> bool {
        if self.breaker.is_tripped() {
            return true;
        }
        match self
            .backend
            .get(BREAKER_KEY)
            .await
        {
            Ok(Some(_)) => {
                self.breaker.trip(until_next_utc_midnight(Utc::now()));
                true
            }
            Ok(None) => false,
            Err(err) => {
                tracing::debug!(error = ?err, "could not read shared quota marker");
                false
            }
        }
    }

    /// Re-opens the store after an operator confirms the quota was raised.
    pub async fn clear_quota_breaker(&self) -> StoreResult<()> {
        self.breaker.reset();
        self.backend.put_control(BREAKER_KEY, None, None).await
    }

    /// Trips the breaker on a quota rejection and shares it with other
    /// instances. The marker expiry is clamped up to the floor so it can
    /// never turn into a permanent record.
    async fn observe<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(StoreError::QuotaExceeded) = &result {
            let cooldown = until_next_utc_midnight(Utc::now());
            let already = self.breaker.is_tripped();
            self.breaker.trip(cooldown);
            if !already {
                if let Err(err) = self
                    .backend
                    .put_control(BREAKER_KEY, Some("1"), Some(marker_ttl(cooldown)))
                    .await
                {
                    tracing::warn!(error = ?err, "could not persist quota marker");
                }
            }
        }
        result
    }

    fn cached(&self, key: &str) -> Option<Option<String>> {
        let mut cache = self.read_cache.lock().unwrap_or_else(PoisonError::into_inner);
        match cache.get(key) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn remember(&self, key: &str, value: Option<String>, ttl: Duration) {
        let mut cache = self.read_cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= READ_CACHE_LIMIT {
            let now = Instant::now();
            cache.retain(|_, entry| entry.expires > now);
            if cache.len() >= READ_CACHE_LIMIT {
                cache.clear();
            }
        }
        cache.insert(
            key.to_string(),
            CachedRead {
                value,
                expires: Instant::now() + ttl,
            },
        );
    }

    fn forget_cached(&self, key: &str) {
        self.read_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn clear_read_cache(&self) {
        self.read_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
