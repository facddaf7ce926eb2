//! Verification key material — sources and the TTL cache.
//!
//! `KeyCache` wraps a `KeySource` and hands out the current `JwkSet`:
//!
//! ```text
//! age < ttl                    → cached set
//! age ≥ ttl, refresh ok        → new set
//! age ≥ ttl, refresh fails
//!     age < ttl + grace        → stale set (warning)
//!     otherwise                → KeySetUnavailable
//! ```
//!
//! Refreshes are single-flight: concurrent callers queue on one lock and
//! re-check the cache once they acquire it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sandgate_core::AuthConfig;

use crate::error::{AuthError, KeyFetchError};

/// Somewhere verification keys can be fetched from.
#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError>;
}

/// Fetches a JWKS document over HTTP(S).
pub struct HttpKeySource {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        let set = self
            .client
            .get(&self.url)
            .header("accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await?;
        debug!(url = %self.url, keys = set.keys.len(), "fetched key set");
        Ok(set)
    }
}

/// A fixed key set that can be swapped at runtime.
pub struct StaticKeySource {
    keys: RwLock<JwkSet>,
}

impl StaticKeySource {
    pub fn new(keys: JwkSet) -> Self {
        Self {
            keys: RwLock::new(keys),
        }
    }

    /// Replace the served key set (simulates rotation).
    pub async fn replace(&self, keys: JwkSet) {
        *self.keys.write().await = keys;
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        Ok(self.keys.read().await.clone())
    }
}

/// Timing knobs for `KeyCache`.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    /// How long a fetched set is fresh.
    pub ttl: Duration,
    /// How long past `ttl` a stale set is still trusted when refresh fails.
    pub grace: Duration,
    /// Upper bound on a single fetch.
    pub fetch_timeout: Duration,
    /// Minimum spacing between fetch attempts that are not forced by expiry.
    pub min_refresh_interval: Duration,
}

impl CachePolicy {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            ttl: config.cache_ttl,
            grace: config.grace,
            fetch_timeout: config.fetch_timeout,
            min_refresh_interval: config.min_refresh_interval,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            grace: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(5),
            min_refresh_interval: Duration::from_secs(30),
        }
    }
}

struct CachedKeys {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

#[derive(Default)]
struct RefreshLog {
    /// Any fetch, successful or not; spaces out forced refreshes.
    last_attempt: Option<Instant>,
    /// Cleared by the next successful fetch.
    last_failure: Option<Instant>,
}

impl RefreshLog {
    fn within(at: Option<Instant>, window: Duration) -> bool {
        at.is_some_and(|at| at.elapsed() < window)
    }
}

/// TTL cache over a `KeySource`.
pub struct KeyCache {
    source: Arc<dyn KeySource>,
    policy: CachePolicy,
    cached: RwLock<Option<CachedKeys>>,
    /// Serializes fetches.
    refresh: Mutex<RefreshLog>,
}

impl KeyCache {
    pub fn new(source: Arc<dyn KeySource>, policy: CachePolicy) -> Self {
        Self {
            source,
            policy,
            cached: RwLock::new(None),
            refresh: Mutex::new(RefreshLog::default()),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// The key set to verify against right now.
    pub async fn current(&self) -> Result<Arc<JwkSet>, AuthError> {
        if let Some(keys) = self.fresh().await {
            return Ok(keys);
        }

        let mut log = self.refresh.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(keys) = self.fresh().await {
            return Ok(keys);
        }

        // A refresh just failed: serve from the grace window without
        // hammering the source on every request. Successful fetches never
        // hold back an expiry refresh.
        if !RefreshLog::within(log.last_failure, self.policy.min_refresh_interval) {
            match self.fetch_logged(&mut log).await {
                Ok(keys) => return Ok(keys),
                Err(e) => warn!(error = %e, "key set refresh failed"),
            }
        }

        self.within_grace().await.ok_or(AuthError::KeySetUnavailable)
    }

    /// Refresh ahead of expiry, e.g. when a token names an unknown key id.
    ///
    /// Rate limited by `min_refresh_interval`. Returns whether a new key
    /// set was installed.
    pub async fn force_refresh(&self) -> bool {
        let mut log = self.refresh.lock().await;
        if RefreshLog::within(log.last_attempt, self.policy.min_refresh_interval) {
            debug!("forced key refresh suppressed (rate limited)");
            return false;
        }

        match self.fetch_logged(&mut log).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "forced key set refresh failed");
                false
            }
        }
    }

    /// Fetch, install on success, and record the attempt.
    async fn fetch_logged(&self, log: &mut RefreshLog) -> Result<Arc<JwkSet>, KeyFetchError> {
        let now = Instant::now();
        log.last_attempt = Some(now);
        match self.fetch_bounded().await {
            Ok(keys) => {
                log.last_failure = None;
                Ok(self.store(keys).await)
            }
            Err(e) => {
                log.last_failure = Some(now);
                Err(e)
            }
        }
    }

    async fn fresh(&self) -> Option<Arc<JwkSet>> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.policy.ttl)
            .map(|c| Arc::clone(&c.keys))
    }

    async fn within_grace(&self) -> Option<Arc<JwkSet>> {
        let cached = self.cached.read().await;
        let c = cached.as_ref()?;
        let age = c.fetched_at.elapsed();
        if age < self.policy.ttl + self.policy.grace {
            warn!(
                age_secs = age.as_secs(),
                "serving stale key set within grace window"
            );
            Some(Arc::clone(&c.keys))
        } else {
            None
        }
    }

    async fn fetch_bounded(&self) -> Result<JwkSet, KeyFetchError> {
        match tokio::time::timeout(self.policy.fetch_timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(KeyFetchError(format!(
                "timed out after {}ms",
                self.policy.fetch_timeout.as_millis()
            ))),
        }
    }

    async fn store(&self, keys: JwkSet) -> Arc<JwkSet> {
        let keys = Arc::new(keys);
        info!(keys = keys.keys.len(), "key set refreshed");
        *self.cached.write().await = Some(CachedKeys {
            keys: Arc::clone(&keys),
            fetched_at: Instant::now(),
        });
        keys
    }
}
