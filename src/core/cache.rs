//! Bounded in-memory cache with TTL expiry and LRU eviction.
//!
//! Reads are synchronous. Mutations (`set`, `delete`, `clear`) go through an
//! [`OperationQueue`]: a FIFO async mutex with a bounded number of pending
//! operations and a per-operation timeout. For a single key, writes apply in
//! the order they were enqueued; a concurrent `get` may observe the value from
//! before a pending write.

use crate::api::models::{ChatCompletionResponse, Message};
use crate::core::config::CacheConfig;
use crate::core::metrics::get_metrics;
use crate::core::redact::truncate_chars;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Characters of each message kept when deriving a response cache key.
pub const KEY_CONTENT_CHARS: usize = 100;

/// Fallback size estimate when a value cannot be serialized.
const UNKNOWN_ENTRY_SIZE: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Cache operation queue full ({pending} pending)")]
    QueueFull { pending: usize },

    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cache has been destroyed")]
    Closed,

    #[error("Entry of ~{size} bytes exceeds cache limit of {limit} bytes")]
    EntryTooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Item bound; the byte bound is `max_size * 1024`
    pub max_size: usize,
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
    pub max_pending_ops: usize,
    pub op_timeout: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
            max_pending_ops: 1000,
            op_timeout: Duration::from_secs(5),
        }
    }
}

impl CacheOptions {
    /// Defaults for chat completion responses.
    pub fn for_responses() -> Self {
        Self {
            max_size: 500,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(600),
            ..Self::default()
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            max_size: config.max_size.max(1),
            default_ttl: Duration::from_millis(config.default_ttl_ms),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs.max(1)),
            max_pending_ops: config.max_pending_ops.max(1),
            op_timeout: Duration::from_millis(config.op_timeout_ms.max(1)),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_size.saturating_mul(1024)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub memory_bytes: usize,
    pub max_memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub hit_rate: f64,
}

struct CacheEntry<T> {
    data: T,
    expires_at: Instant,
    size: usize,
    tick: u64,
}

struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    /// Access order, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

impl<T> CacheState<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            total_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expired: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.expired += expired.len() as u64;
        expired.len()
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        }
        self.evictions += 1;
        true
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.total_bytes = 0;
    }
}

/// Decrements the pending counter however the operation ends.
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// FIFO async mutex with bounded backlog and per-operation timeout.
pub struct OperationQueue {
    gate: tokio::sync::Mutex<()>,
    pending: AtomicUsize,
    max_pending: usize,
    timeout: Duration,
}

impl OperationQueue {
    pub fn new(max_pending: usize, timeout: Duration) -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            pending: AtomicUsize::new(0),
            max_pending,
            timeout,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Run `op` once every earlier operation has finished. An operation that
    /// times out while waiting is dropped without running.
    pub async fn run<R>(&self, op: impl FnOnce() -> R) -> Result<R, CacheError> {
        let previous = self.pending.fetch_add(1, Ordering::SeqCst);
        let _guard = PendingGuard(&self.pending);
        if previous >= self.max_pending {
            return Err(CacheError::QueueFull { pending: previous });
        }

        tokio::time::timeout(self.timeout, async {
            let _gate = self.gate.lock().await;
            op()
        })
        .await
        .map_err(|_| CacheError::Timeout(self.timeout))
    }

    /// Wait for every queued operation to finish.
    async fn drain(&self) -> Result<(), CacheError> {
        tokio::time::timeout(self.timeout, self.gate.lock())
            .await
            .map(|_| ())
            .map_err(|_| CacheError::Timeout(self.timeout))
    }
}

pub struct BoundedCache<T> {
    options: CacheOptions,
    state: Mutex<CacheState<T>>,
    queue: OperationQueue,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

/// Cache of canonical chat completion responses.
pub type ResponseCache = BoundedCache<ChatCompletionResponse>;

impl<T> BoundedCache<T>
where
    T: Serialize + Clone + Send + 'static,
{
    pub fn new(options: CacheOptions) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let queue = OperationQueue::new(options.max_pending_ops, options.op_timeout);
        Self {
            options,
            state: Mutex::new(CacheState::new()),
            queue,
            closed: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// A poisoned lock only means a panic mid-update; the map itself is still
    /// structurally valid, so keep serving from it.
    fn state(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Look up `key`, refreshing its recency. Expired entries are removed.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut state = self.state();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                get_metrics().cache_events.with_label_values(&["miss"]).inc();
                return None;
            }
            Some(entry) => entry.expires_at <= now,
        };

        if expired {
            state.remove(key);
            state.expired += 1;
            state.misses += 1;
            get_metrics().cache_events.with_label_values(&["expire"]).inc();
            get_metrics().cache_events.with_label_values(&["miss"]).inc();
            return None;
        }

        let tick = state.tick();
        let state = &mut *state;
        let entry = state.entries.get_mut(key)?;
        state.order.remove(&entry.tick);
        state.order.insert(tick, key.to_string());
        entry.tick = tick;
        let data = entry.data.clone();
        state.hits += 1;
        get_metrics().cache_events.with_label_values(&["hit"]).inc();
        Some(data)
    }

    /// Store `data` under `key` for `ttl` (or the default TTL).
    pub async fn set(&self, key: &str, data: T, ttl: Option<Duration>) -> Result<(), CacheError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }

        let size = estimate_size(&data);
        let limit = self.options.max_bytes();
        if size > limit {
            get_metrics().cache_events.with_label_values(&["rejected"]).inc();
            return Err(CacheError::EntryTooLarge { size, limit });
        }

        let ttl = ttl.unwrap_or(self.options.default_ttl);
        let key = key.to_string();
        let result = self
            .queue
            .run(|| {
                // destroy() may have begun while this write was queued
                if self.closed.load(Ordering::SeqCst) {
                    return Err(CacheError::Closed);
                }
                let mut state = self.state();
                state.remove(&key);
                state.purge_expired(Instant::now());

                let mut evicted = 0u64;
                while state.entries.len() >= self.options.max_size
                    || state.total_bytes + size > limit
                {
                    if !state.evict_oldest() {
                        break;
                    }
                    evicted += 1;
                }

                let tick = state.tick();
                state.order.insert(tick, key.clone());
                state.entries.insert(
                    key,
                    CacheEntry {
                        data,
                        expires_at: Instant::now() + ttl,
                        size,
                        tick,
                    },
                );
                state.total_bytes += size;
                Ok(evicted)
            })
            .await
            .and_then(|inserted| inserted);

        match result {
            Ok(evicted) => {
                let events = &get_metrics().cache_events;
                events.with_label_values(&["store"]).inc();
                if evicted > 0 {
                    events.with_label_values(&["evict"]).inc_by(evicted);
                }
                Ok(())
            }
            Err(e) => {
                get_metrics().cache_events.with_label_values(&["rejected"]).inc();
                Err(e)
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        self.queue.run(|| self.state().remove(key).is_some()).await
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        self.queue.run(|| self.state().clear()).await
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        let removed = self.state().purge_expired(Instant::now());
        if removed > 0 {
            get_metrics()
                .cache_events
                .with_label_values(&["expire"])
                .inc_by(removed as u64);
        }
        removed
    }

    pub fn get_stats(&self) -> CacheStats {
        let state = self.state();
        let lookups = state.hits + state.misses;
        CacheStats {
            size: state.entries.len(),
            max_size: self.options.max_size,
            memory_bytes: state.total_bytes,
            max_memory_bytes: self.options.max_bytes(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expired: state.expired,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    pub fn pending_operations(&self) -> usize {
        self.queue.pending()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start the periodic cleanup. The task holds only a weak reference and
    /// exits when the cache is dropped or destroyed.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let interval = self.options.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.cleanup();
                if removed > 0 {
                    tracing::debug!(removed, "Removed expired cache entries");
                }
            }
        })
    }

    /// Stop the cleanup timer, drain queued operations and clear all entries.
    /// Calling it again is a no-op.
    pub async fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.queue.drain().await {
            tracing::warn!(error = %e, "Cache queue did not drain before destroy");
        }
        let mut state = self.state();
        let dropped = state.entries.len();
        state.clear();
        tracing::info!(dropped, "Cache destroyed");
    }
}

/// Twice the serialized character length.
pub fn estimate_size<T: Serialize>(data: &T) -> usize {
    serde_json::to_string(data)
        .map(|s| s.chars().count() * 2)
        .unwrap_or(UNKNOWN_ENTRY_SIZE)
}

/// Deterministic key for a chat completion. Message content is truncated to
/// [`KEY_CONTENT_CHARS`] before hashing.
pub fn response_cache_key(messages: &[Message], model: &str, temperature: Option<f64>) -> String {
    let messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role,
                "content": truncate_chars(&m.content, KEY_CONTENT_CHARS),
            })
        })
        .collect();
    let material = serde_json::json!({
        "messages": messages,
        "model": model,
        "temperature": temperature,
    });

    let mut hasher = Sha256::new();
    hasher.update(material.to_string().as_bytes());
    format!("response_{}", hex::encode(hasher.finalize()))
}
