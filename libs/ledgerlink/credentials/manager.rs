//! Cached, self-refreshing bearer tokens.
//!
//! [`CredentialManager`] wraps an externally supplied [`TokenFetcher`] with a
//! cache, in-flight deduplication, and a proactive refresh timer that fires
//! at a configurable fraction of each token's remaining lifetime. The HTTP
//! (or other) exchange that actually mints tokens stays outside this crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::credentials::store::TokenStore;
use crate::error::Result;

/// Fraction of a token's remaining lifetime to wait before refreshing it in
/// the background.
pub const DEFAULT_BUFFER_RATIO: f64 = 0.95;

/// A bearer token with its expiry in epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub token: String,
    pub expires_at: i64,
}

impl TokenRecord {
    pub fn new(token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Expiry is boundary inclusive: a token expiring exactly now is
    /// already unusable.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// Seconds of life left at `now`, zero once expired.
    pub fn remaining_at(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }
}

/// Source of fresh tokens. Called on cache misses, expiries, and timer
/// fires; never called twice concurrently by one manager.
#[async_trait]
pub trait TokenFetcher: Send + Sync + 'static {
    async fn fetch(&self) -> Result<TokenRecord>;
}

/// Tuning knobs for [`CredentialManager`].
pub struct CredentialOptions {
    /// Fraction of remaining lifetime before the background refresh fires.
    /// Must land in `(0, 1]`; anything else falls back to the default.
    pub buffer_ratio: f64,
    /// Optional persistence backend written after each successful fetch.
    pub store: Option<Arc<dyn TokenStore>>,
}

impl Default for CredentialOptions {
    fn default() -> Self {
        Self {
            buffer_ratio: DEFAULT_BUFFER_RATIO,
            store: None,
        }
    }
}

impl CredentialOptions {
    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_buffer_ratio(mut self, ratio: f64) -> Self {
        self.buffer_ratio = ratio;
        self
    }
}

type RefreshCallback = Box<dyn Fn(&TokenRecord) + Send + Sync>;
type RefreshSlot = watch::Receiver<Option<Result<TokenRecord>>>;

struct RefreshTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct ManagerInner {
    fetcher: Arc<dyn TokenFetcher>,
    store: Option<Arc<dyn TokenStore>>,
    buffer_ratio: f64,
    record: RwLock<Option<TokenRecord>>,
    // One shared in-flight fetch; concurrent callers join it instead of
    // issuing their own network call.
    inflight: Mutex<Option<RefreshSlot>>,
    timer: Mutex<Option<RefreshTimer>>,
    timer_generation: AtomicU64,
    on_refresh: RwLock<Option<RefreshCallback>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.handle.abort();
        }
    }
}

/// Token cache with deduplicated refresh and proactive rescheduling.
///
/// Cheap to clone; all clones share one cache, one timer, and one in-flight
/// fetch slot.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<ManagerInner>,
}

impl CredentialManager {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self::with_options(fetcher, CredentialOptions::default())
    }

    pub fn with_options(fetcher: Arc<dyn TokenFetcher>, options: CredentialOptions) -> Self {
        // The ratio feeds `Duration::from_secs_f64`, which panics on a
        // negative or NaN product; out-of-range values get the default.
        let buffer_ratio = if options.buffer_ratio.is_finite() && options.buffer_ratio > 0.0 {
            options.buffer_ratio.min(1.0)
        } else {
            DEFAULT_BUFFER_RATIO
        };
        Self {
            inner: Arc::new(ManagerInner {
                fetcher,
                store: options.store,
                buffer_ratio,
                record: RwLock::new(None),
                inflight: Mutex::new(None),
                timer: Mutex::new(None),
                timer_generation: AtomicU64::new(0),
                on_refresh: RwLock::new(None),
            }),
        }
    }

    /// Register the callback invoked with each newly fetched token.
    ///
    /// The usual wiring hands the token straight to
    /// [`Connection::set_api_token`](permasockets::Connection::set_api_token)
    /// so the next dial carries it.
    pub fn set_on_refresh<F>(&self, callback: F)
    where
        F: Fn(&TokenRecord) + Send + Sync + 'static,
    {
        *self.inner.on_refresh.write() = Some(Box::new(callback));
    }

    /// Current valid token, fetching one if the cache is empty or expired.
    pub async fn get_token_info(&self) -> Result<TokenRecord> {
        let now = Utc::now().timestamp();
        if let Some(record) = self.fresh_record(now) {
            // Cache hit. Re-arm the background timer only if none is
            // pending (it may have fired and failed since).
            self.schedule_refresh(&record, false);
            return Ok(record);
        }
        self.refresh_shared(true).await
    }

    /// Fetch a new token now, regardless of the cached one's freshness.
    pub async fn force_refresh(&self) -> Result<TokenRecord> {
        self.refresh_shared(false).await
    }

    /// Cached record, if any, without triggering a fetch.
    pub fn peek(&self) -> Option<TokenRecord> {
        self.inner.record.read().clone()
    }

    /// Whether a background refresh timer is currently armed.
    pub fn has_pending_refresh(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    /// Adopt a previously persisted token from the configured store.
    ///
    /// Returns `Ok(true)` when a still-valid record was loaded into the
    /// cache (and the refresh callback fired for it). An expired record or
    /// an absent store yields `Ok(false)`.
    pub async fn hydrate(&self) -> Result<bool> {
        let store = match &self.inner.store {
            Some(store) => store,
            None => return Ok(false),
        };
        let record = match store.load().await? {
            Some(record) => record,
            None => return Ok(false),
        };
        if record.is_expired_at(Utc::now().timestamp()) {
            debug!("Persisted token already expired; ignoring");
            return Ok(false);
        }
        debug!("Hydrated token expiring at {}", record.expires_at);
        *self.inner.record.write() = Some(record.clone());
        self.notify(&record);
        self.schedule_refresh(&record, false);
        Ok(true)
    }

    fn fresh_record(&self, now: i64) -> Option<TokenRecord> {
        self.inner
            .record
            .read()
            .as_ref()
            .filter(|record| !record.is_expired_at(now))
            .cloned()
    }

    fn notify(&self, record: &TokenRecord) {
        if let Some(callback) = self.inner.on_refresh.read().as_ref() {
            callback(record);
        }
    }

    /// Join the in-flight fetch if one exists, otherwise lead a new one and
    /// publish its outcome (success or failure) to every waiter.
    ///
    /// With `recheck` set, a leader that finds the cache fresh by the time
    /// it takes over returns the cached record instead of fetching; the
    /// paths that exist to mint a new token (timer fires, `force_refresh`)
    /// pass `false`.
    async fn refresh_shared(&self, recheck: bool) -> Result<TokenRecord> {
        enum Role {
            Lead(watch::Sender<Option<Result<TokenRecord>>>),
            Join(RefreshSlot),
        }

        loop {
            let role = {
                let mut inflight = self.inner.inflight.lock();
                match inflight.as_ref() {
                    Some(rx) => Role::Join(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        *inflight = Some(rx);
                        Role::Lead(tx)
                    }
                }
            };

            match role {
                Role::Lead(tx) => {
                    if recheck {
                        if let Some(record) = self.fresh_record(Utc::now().timestamp()) {
                            *self.inner.inflight.lock() = None;
                            let _ = tx.send(Some(Ok(record.clone())));
                            self.schedule_refresh(&record, false);
                            return Ok(record);
                        }
                    }
                    let result = self.fetch_and_commit().await;
                    *self.inner.inflight.lock() = None;
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Role::Join(mut rx) => loop {
                    let settled = rx.borrow_and_update().clone();
                    if let Some(result) = settled {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        // Leader was dropped before settling. Clear the
                        // stale slot and contend again.
                        let mut inflight = self.inner.inflight.lock();
                        if inflight
                            .as_ref()
                            .map_or(false, |current| current.same_channel(&rx))
                        {
                            *inflight = None;
                        }
                        break;
                    }
                },
            }
        }
    }

    async fn fetch_and_commit(&self) -> Result<TokenRecord> {
        debug!("Fetching fresh token");
        let record = self.inner.fetcher.fetch().await?;
        debug!("Token fetched, expires at {}", record.expires_at);

        *self.inner.record.write() = Some(record.clone());
        self.notify(&record);

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.persist(&record).await {
                warn!("Token persist failed: {}", e);
            }
        }

        self.schedule_refresh(&record, true);
        Ok(record)
    }

    /// Arm the background refresh timer for `record`. With `replace` set
    /// any pending timer is cancelled first; otherwise an armed timer wins.
    fn schedule_refresh(&self, record: &TokenRecord, replace: bool) {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() && !replace {
            return;
        }
        if let Some(previous) = timer.take() {
            previous.handle.abort();
        }

        let now = Utc::now().timestamp();
        let delay =
            Duration::from_secs_f64(record.remaining_at(now) as f64 * self.inner.buffer_ratio);
        let generation = self.inner.timer_generation.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Scheduling token refresh in {:?}", delay);

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            // Vacate our own timer slot before fetching so the post-fetch
            // reschedule does not abort this task mid-refresh. A stale
            // generation means a replacement timer took the slot.
            {
                let mut timer = inner.timer.lock();
                match timer.as_ref() {
                    Some(current) if current.generation == generation => *timer = None,
                    _ => return,
                }
            }
            let manager = CredentialManager { inner };
            match manager.refresh_shared(false).await {
                Ok(record) => {
                    debug!(
                        "Background token refresh complete, expires at {}",
                        record.expires_at
                    )
                }
                Err(e) => warn!("Background token refresh failed: {}", e),
            }
        });

        *timer = Some(RefreshTimer { generation, handle });
    }
}
