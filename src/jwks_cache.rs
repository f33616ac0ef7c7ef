use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, SystemTime},
};

use arc_swap::ArcSwap;
use jsonwebtoken::DecodingKey;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::{validate_refresh_interval, AppCheckConfig, DEFAULT_FETCH_TIMEOUT, DEFAULT_REFRESH_INTERVAL},
    jwk_set::KeySet,
    remote_jwk_set::RemoteJwkSet,
    Error,
};

/// Callback invoked with every error of a key set refresh.
pub type RefreshErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Builder for configuring a [`KeySetCache`].
pub struct KeySetCacheBuilder {
    url: Url,
    refresh_interval: Duration,
    fetch_timeout: Duration,
    reactive_refresh_cooldown: Option<Duration>,
    refresh_error_handler: Option<RefreshErrorHandler>,
    http_client: Option<Client>,
}

impl KeySetCacheBuilder {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            reactive_refresh_cooldown: None,
            refresh_error_handler: None,
            http_client: None,
        }
    }

    /// Starts from the JWKS URL, refresh interval, fetch timeout and reactive refresh cooldown of
    /// `config`.
    pub fn from_config(config: &AppCheckConfig) -> Self {
        let mut builder = Self::new(config.jwks_url.clone())
            .with_refresh_interval(config.refresh_interval)
            .with_fetch_timeout(config.fetch_timeout);
        if let Some(cooldown) = config.reactive_refresh_cooldown {
            builder = builder.with_reactive_refresh_cooldown(cooldown);
        }
        builder
    }

    /// Interval of the background refresh. Must be non-zero and at most
    /// [`MAX_REFRESH_INTERVAL`](crate::config::MAX_REFRESH_INTERVAL).
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    /// Upper bound for a single fetch of the key set.
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Skip refreshes for unknown key IDs when the previous fetch happened less than `cooldown` ago.
    pub fn with_reactive_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.reactive_refresh_cooldown = Some(cooldown);
        self
    }

    /// Registers a callback that is told about failed refreshes.
    pub fn with_refresh_error_handler(
        mut self,
        handler: impl Fn(&Error) + Send + Sync + 'static,
    ) -> Self {
        self.refresh_error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_http_client(mut self, http_client: Client) -> Self {
        self.http_client = Some(http_client);
        self
    }

    /// Fetches the key set for the first time and starts the background refresh.
    ///
    /// Fails if the first fetch does not produce a usable key set. Must be called from within a
    /// `tokio` runtime.
    pub async fn build(self) -> Result<KeySetCache, Error> {
        validate_refresh_interval(self.refresh_interval)?;

        let mut remote = RemoteJwkSet::builder(self.url.clone()).with_timeout(self.fetch_timeout);
        if let Some(http_client) = self.http_client {
            remote = remote.with_http_client(http_client);
        }
        let remote = remote.build();

        let initial = fetch_key_set(&remote, self.refresh_interval, 1)
            .await
            .inspect_err(|err| {
                tracing::error!(url = %self.url, error = %err, "initial key set fetch failed");
            })?;
        tracing::info!(
            url = %self.url,
            keys = initial.len(),
            "fetched initial key set"
        );

        let inner = Arc::new(Inner {
            remote,
            current: ArcSwap::from_pointee(initial),
            refresh_lock: tokio::sync::Mutex::new(()),
            last_fetch: Mutex::new(Instant::now()),
            next_generation: AtomicU64::new(2),
            refresh_interval: self.refresh_interval,
            reactive_refresh_cooldown: self.reactive_refresh_cooldown,
            refresh_error_handler: self.refresh_error_handler,
            cancel_token: CancellationToken::new(),
            refresh_handle: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let handle = tokio::spawn(run_background_refresh(
            Arc::downgrade(&inner),
            self.refresh_interval,
            inner.cancel_token.clone(),
        ));
        *inner.refresh_handle.lock() = Some(handle);

        Ok(KeySetCache { inner })
    }
}

/// Shared, periodically refreshed cache of the signing keys published at a JWKS endpoint.
///
/// Lookups read the current [`KeySet`] without locking and never wait for the network. Refreshes
/// build a complete new key set and swap it in with a single store, so readers observe either the
/// previous or the new key set. A failed refresh keeps the previous key set.
///
/// Cloning is cheap and all clones share the same key set and background task.
#[derive(Clone)]
pub struct KeySetCache {
    inner: Arc<Inner>,
}

struct Inner {
    remote: RemoteJwkSet,
    current: ArcSwap<KeySet>,
    /// Serializes refreshes requested through the cache. The background task does not take it.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Time of the latest fetch attempt.
    last_fetch: Mutex<Instant>,
    next_generation: AtomicU64,
    refresh_interval: Duration,
    reactive_refresh_cooldown: Option<Duration>,
    refresh_error_handler: Option<RefreshErrorHandler>,
    cancel_token: CancellationToken,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl KeySetCache {
    pub fn builder(url: Url) -> KeySetCacheBuilder {
        KeySetCacheBuilder::new(url)
    }

    /// Builds a cache as configured by `config`; see [`KeySetCacheBuilder::from_config`].
    pub async fn from_config(config: &AppCheckConfig) -> Result<Self, Error> {
        KeySetCacheBuilder::from_config(config).build().await
    }

    /// Looks up a key in the current key set.
    pub fn get(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        self.inner.current.load().get(kid)
    }

    /// The current key set.
    pub fn snapshot(&self) -> Arc<KeySet> {
        self.inner.current.load_full()
    }

    pub fn url(&self) -> &Url {
        self.inner.remote.url()
    }

    /// Fetches the key set and replaces the current one.
    ///
    /// On failure the current key set stays in effect.
    pub async fn refresh(&self) -> Result<(), Error> {
        let _guard = self.inner.refresh_lock.lock().await;
        self.inner.fetch_and_swap().await
    }

    /// Refreshes the key set unless it has moved past `generation` in the meantime.
    ///
    /// Used when a key ID is missing from the key set of the given generation. Callers racing for the
    /// same missing key wait for a single fetch. Returns whether a fetch was performed by this call.
    pub async fn refresh_if_unchanged(&self, generation: u64) -> Result<bool, Error> {
        let _guard = self.inner.refresh_lock.lock().await;

        let current = self.inner.current.load().generation();
        if current != generation {
            tracing::debug!(generation, current, "key set already refreshed");
            return Ok(false);
        }
        if let Some(cooldown) = self.inner.reactive_refresh_cooldown {
            let since_last_fetch = self.inner.last_fetch.lock().elapsed();
            if since_last_fetch < cooldown {
                tracing::debug!(?since_last_fetch, "skipping key set refresh during cooldown");
                return Ok(false);
            }
        }

        self.inner.fetch_and_swap().await?;
        Ok(true)
    }

    /// Stops the background refresh.
    ///
    /// May only be called once; later calls return [`Error::AlreadyShutDown`]. A fetch in progress
    /// in the background task is cancelled rather than awaited.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyShutDown);
        }

        self.inner.cancel_token.cancel();
        let handle = self.inner.refresh_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background key set refresh task panicked");
            }
        }
        tracing::info!(url = %self.url(), "key set cache shut down");
        Ok(())
    }
}

impl std::fmt::Debug for KeySetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySetCache")
            .field("url", &self.url().as_str())
            .field("key_set", &self.snapshot())
            .finish()
    }
}

impl Inner {
    /// Fetches a new key set and swaps it in unless a later fetch got there first.
    async fn fetch_and_swap(&self) -> Result<(), Error> {
        *self.last_fetch.lock() = Instant::now();

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        match fetch_key_set(&self.remote, self.refresh_interval, generation).await {
            Ok(key_set) => {
                let keys = key_set.len();
                let key_set = Arc::new(key_set);
                let previous = self.current.rcu(|current| {
                    if current.generation() < generation {
                        key_set.clone()
                    } else {
                        current.clone()
                    }
                });
                if previous.generation() < generation {
                    tracing::info!(url = %self.remote.url(), keys, generation, "refreshed key set");
                } else {
                    tracing::debug!(
                        generation,
                        current = previous.generation(),
                        "discarding key set superseded by a later fetch"
                    );
                }
                Ok(())
            }
            Err(err) => {
                let stale = self.current.load();
                tracing::warn!(
                    url = %self.remote.url(),
                    error = %err,
                    generation = stale.generation(),
                    expired = stale.is_expired(SystemTime::now()),
                    "key set refresh failed, keeping previous keys"
                );
                if let Some(handler) = &self.refresh_error_handler {
                    handler(&err);
                }
                Err(err)
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn fetch_key_set(
    remote: &RemoteJwkSet,
    refresh_interval: Duration,
    generation: u64,
) -> Result<KeySet, Error> {
    let fetched = remote.fetch().await?;
    KeySet::from_jwk_set(
        &fetched.jwk_set,
        remote.url().clone(),
        refresh_interval,
        fetched.max_age,
        generation,
    )
}

/// Refreshes the key set every `interval` until cancelled or until the cache is dropped.
async fn run_background_refresh(
    inner: Weak<Inner>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let Some(start) = Instant::now().checked_add(interval) else {
        tracing::error!(?interval, "refresh interval out of range, background refresh disabled");
        return;
    };
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            // Errors are logged and reported by `fetch_and_swap`.
            _ = inner.fetch_and_swap() => {}
        }
    }

    tracing::debug!("background key set refresh stopped");
}
