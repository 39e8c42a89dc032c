//! Per-client fixed-window admission control.
//!
//! A window opens on a client's first request and lasts `window`; up to
//! `max_requests` are admitted per window. Windows reset lazily on the first
//! check after expiry. A background sweep only exists for memory hygiene.
//!
//! Window deadlines are also queued in the order they open. Since every
//! window has the same length the queue is sorted, so expired records can be
//! found by popping from the front without visiting live ones.
//!
//! Every failure inside the limiter resolves to "not admitted".

use crate::core::config::RateLimitConfig;
use crate::core::metrics::get_metrics;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Longest client identifier kept after sanitization.
pub const MAX_CLIENT_ID_LEN: usize = 256;

/// Background sweep never runs less often than this.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Records removed per lock acquisition while draining on shutdown.
const DRAIN_BATCH: usize = 512;

#[derive(Debug, Clone, Copy)]
struct RateLimitRecord {
    count: u32,
    reset_at: Instant,
}

/// Snapshot returned by [`RateLimiter::get_status`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

struct LimiterState {
    records: HashMap<String, RateLimitRecord>,
    /// `(reset_at, client)` oldest first. Entries left behind by a window
    /// renewal no longer match their record and are skipped.
    expiries: VecDeque<(Instant, String)>,
}

impl LimiterState {
    /// Remove records whose window lapsed before `now`.
    fn sweep_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while self
            .expiries
            .front()
            .is_some_and(|(deadline, _)| *deadline < now)
        {
            let Some((deadline, client)) = self.expiries.pop_front() else {
                break;
            };
            if self
                .records
                .get(&client)
                .is_some_and(|record| record.reset_at == deadline)
            {
                self.records.remove(&client);
                removed += 1;
            }
        }
        removed
    }
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    max_clients: usize,
    state: Mutex<LimiterState>,
    accepting: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            max_requests: config.max_requests,
            window: Duration::from_millis(config.window_ms.max(1)),
            max_clients: config.max_clients.max(1),
            state: Mutex::new(LimiterState {
                records: HashMap::new(),
                expiries: VecDeque::new(),
            }),
            accepting: AtomicBool::new(true),
            stop_tx,
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, LimiterState>> {
        match self.state.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::error!("Rate limiter state poisoned");
                None
            }
        }
    }

    /// Admit or reject one request from `client_id`.
    pub fn check_limit(&self, client_id: &str) -> bool {
        let admitted = self.admit(client_id).unwrap_or_else(|reason| {
            get_metrics().rate_limited.with_label_values(&[reason]).inc();
            false
        });
        if !admitted {
            tracing::debug!(client = %client_id, "Request not admitted");
        }
        admitted
    }

    fn admit(&self, client_id: &str) -> Result<bool, &'static str> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err("shutdown");
        }
        let client_id = sanitize_client_id(client_id).ok_or("invalid_client")?;
        let mut state = self.lock().ok_or("internal")?;
        let now = Instant::now();

        if !state.records.contains_key(&client_id) && state.records.len() >= self.max_clients {
            let removed = state.sweep_expired(now);
            if removed > 0 {
                tracing::debug!(
                    removed,
                    remaining = state.records.len(),
                    "Emergency rate limiter sweep"
                );
            }
            if state.records.len() >= self.max_clients {
                tracing::warn!(
                    clients = state.records.len(),
                    max_clients = self.max_clients,
                    "Rate limiter client table full"
                );
                return Err("capacity");
            }
        }

        let window_end = now + self.window;
        let (opened, admitted) = {
            let mut opened = false;
            let record = state.records.entry(client_id.clone()).or_insert_with(|| {
                opened = true;
                RateLimitRecord {
                    count: 0,
                    reset_at: window_end,
                }
            });

            if now > record.reset_at {
                record.count = 0;
                record.reset_at = window_end;
                opened = true;
            }

            let admitted = record.count < self.max_requests;
            if admitted {
                record.count += 1;
            }
            (opened, admitted)
        };

        if opened {
            state.expiries.push_back((window_end, client_id));
        }
        if !admitted {
            return Err("limit");
        }
        Ok(true)
    }

    /// Remaining budget and reset time for `client_id`.
    pub fn get_status(&self, client_id: &str) -> RateLimitStatus {
        let now = Instant::now();
        let fresh = RateLimitStatus {
            limit: self.max_requests,
            remaining: self.max_requests,
            reset_at: wall_clock_after(self.window),
        };

        let Some(client_id) = sanitize_client_id(client_id) else {
            return RateLimitStatus {
                remaining: 0,
                ..fresh
            };
        };
        let Some(state) = self.lock() else {
            return RateLimitStatus {
                remaining: 0,
                ..fresh
            };
        };

        match state.records.get(&client_id) {
            Some(record) if now <= record.reset_at => RateLimitStatus {
                limit: self.max_requests,
                remaining: self.max_requests.saturating_sub(record.count),
                reset_at: wall_clock_after(record.reset_at.duration_since(now)),
            },
            _ => fresh,
        }
    }

    /// Remove every record whose window has lapsed. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let Some(mut state) = self.lock() else {
            return 0;
        };
        state.sweep_expired(now)
    }

    pub fn client_count(&self) -> usize {
        self.lock().map(|state| state.records.len()).unwrap_or(0)
    }

    /// Sweep cadence: `min(window / 2, 30s)`.
    pub fn sweep_interval(&self) -> Duration {
        (self.window / 2).clamp(Duration::from_millis(1), MAX_SWEEP_INTERVAL)
    }

    /// Start the periodic sweep. The task holds only a weak reference and
    /// exits when the limiter is dropped or shut down.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let interval = self.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let removed = limiter.cleanup();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired rate limit records");
                }
            }
            tracing::debug!("Rate limiter sweeper stopped");
        })
    }

    /// Stop admissions, drain records within `budget`, then hard-clear.
    /// Returns the number of records removed.
    pub async fn shutdown(&self, budget: Duration) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);

        let deadline = Instant::now() + budget;
        let mut removed = 0;
        loop {
            let batch = {
                let Some(mut state) = self.lock() else {
                    break;
                };
                let keys: Vec<String> = state.records.keys().take(DRAIN_BATCH).cloned().collect();
                for key in &keys {
                    state.records.remove(key);
                }
                keys.len()
            };
            removed += batch;
            if batch == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Rate limiter drain exceeded its budget");
                break;
            }
            tokio::task::yield_now().await;
        }

        if let Some(mut state) = self.lock() {
            removed += state.records.len();
            state.records.clear();
            state.expiries.clear();
        }
        tracing::info!(removed, "Rate limiter shut down");
        removed
    }
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Keep `[A-Za-z0-9_.-]`, cap the length, reject empty results.
pub fn sanitize_client_id(raw: &str) -> Option<String> {
    let sanitized: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .take(MAX_CLIENT_ID_LEN)
        .collect();
    (!sanitized.is_empty()).then_some(sanitized)
}

/// Derive the client identifier from proxy headers, then the socket peer.
pub fn client_id_from_request(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header("cf-connecting-ip")
        .or_else(|| header("x-real-ip"))
        .or_else(|| {
            header("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .map(|ip| ip.replace(':', "_"))
        .unwrap_or_else(|| "unknown".to_string())
}
