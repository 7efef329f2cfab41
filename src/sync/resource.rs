//! Fetch coordination for one logical remote resource.
//!
//! A [`Resource`] owns the synchronization policy for a single data source:
//! load on construction, retry with exponential backoff, cache fallback,
//! debounce of near-simultaneous requests, optimistic updates, and request
//! sequencing so an overtaken call can never overwrite fresher data.
//! Consumers observe cheap snapshots through a watch channel; all mutation
//! goes through the resource's methods.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::FetchError;

use super::cache::CacheStore;
use super::connection::ConnectionMonitor;
use super::task::CancelToken;

/// Lifecycle status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  Idle,
  Loading,
  Success,
  Error,
}

/// Point-in-time view of a resource.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
  pub data: Option<T>,
  pub status: Status,
  pub error: Option<FetchError>,
  /// Whether `data` was served from the cache rather than a live fetch.
  pub is_cached: bool,
  pub fetched_at: Option<Instant>,
}

type BoxFetchFuture<T> = BoxFuture<'static, Result<T, FetchError>>;

/// The caller-supplied data source. Receives the cancellation token for the
/// issued request so a long-running call can be aborted outright.
pub type Fetcher<T> = Arc<dyn Fn(CancelToken) -> BoxFetchFuture<T> + Send + Sync>;

/// Fallible post-fetch mapping. A transform failure is terminal.
pub type Transform<T> = Arc<dyn Fn(T) -> Result<T, FetchError> + Send + Sync>;

type SuccessHook<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Configuration for a resource.
pub struct ResourceOptions<T> {
  /// Cache key for persistence and fallback. No key, no caching.
  pub cache_key: Option<String>,
  /// Maximum age at which a cache entry is served as fresh.
  pub cache_ttl: Duration,
  /// Retries after the initial attempt before a failure is terminal.
  pub retry_attempts: u32,
  /// Base delay before the first retry; doubles per attempt.
  pub retry_delay: Duration,
  /// Requests issued within this window of the previous start collapse.
  pub debounce_window: Duration,
  pub initial_value: Option<T>,
  pub transform: Option<Transform<T>>,
  pub on_success: Option<SuccessHook<T>>,
  pub on_error: Option<ErrorHook>,
}

impl<T> Default for ResourceOptions<T> {
  fn default() -> Self {
    Self {
      cache_key: None,
      cache_ttl: Duration::from_secs(300),
      retry_attempts: 3,
      retry_delay: Duration::from_secs(1),
      debounce_window: Duration::from_millis(100),
      initial_value: None,
      transform: None,
      on_success: None,
      on_error: None,
    }
  }
}

/// One logical unit of synchronized remote data.
///
/// Clones share the same underlying resource. When the last clone drops,
/// in-flight work is cancelled and late completions are discarded.
pub struct Resource<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for Resource<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

struct Inner<T> {
  fetcher: Fetcher<T>,
  opts: ResourceOptions<T>,
  monitor: ConnectionMonitor,
  cache: Option<CacheStore>,
  fetch_state: Mutex<FetchState>,
  snapshot_tx: watch::Sender<Snapshot<T>>,
}

struct FetchState {
  /// Latest issued request number; completions with an older number are
  /// discarded.
  seq: u64,
  last_started: Option<Instant>,
  inflight: Option<CancelToken>,
}

impl<T> Resource<T>
where
  T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
  /// Create the resource and perform the initial load: a fetch while
  /// online, otherwise the freshest non-expired cache entry, otherwise
  /// `Idle`.
  ///
  /// There is no hidden dependency tracking; when the inputs that define
  /// the resource change, drop it and construct a new one.
  pub fn new<F, Fut>(
    fetcher: F,
    options: ResourceOptions<T>,
    monitor: &ConnectionMonitor,
    cache: Option<CacheStore>,
  ) -> Self
  where
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let initial = Snapshot {
      data: options.initial_value.clone(),
      status: Status::Idle,
      error: None,
      is_cached: false,
      fetched_at: None,
    };
    let (snapshot_tx, _) = watch::channel(initial);

    let resource = Self {
      inner: Arc::new(Inner {
        fetcher: Arc::new(move |token| Box::pin(fetcher(token)) as BoxFetchFuture<T>),
        opts: options,
        monitor: monitor.clone(),
        cache,
        fetch_state: Mutex::new(FetchState {
          seq: 0,
          last_started: None,
          inflight: None,
        }),
        snapshot_tx,
      }),
    };

    if resource.inner.monitor.is_online() {
      resource.fetch();
    } else {
      resource.inner.serve_cached_fresh();
    }

    resource
  }

  /// Issue a fetch. No-op while already loading or inside the debounce
  /// window.
  pub fn fetch(&self) {
    self.inner.issue(false);
  }

  /// Force a fetch regardless of load state or data freshness. Duplicates
  /// inside the debounce window still collapse into one request.
  pub fn refetch(&self) {
    self.inner.issue(true);
  }

  /// Optimistic local mutation: no network round trip, persisted to cache,
  /// retry state untouched. Load status and error are left as they were,
  /// except that an `Idle` resource becomes `Success`.
  pub fn update_data<F>(&self, f: F)
  where
    F: FnOnce(Option<T>) -> T,
  {
    let mut stored: Option<T> = None;
    self.inner.snapshot_tx.send_modify(|snap| {
      let value = f(snap.data.take());
      stored = Some(value.clone());
      snap.data = Some(value);
      snap.is_cached = false;
      if snap.status == Status::Idle {
        snap.status = Status::Success;
      }
    });

    if let (Some(value), Some(cache), Some(key)) = (
      stored,
      self.inner.cache.as_ref(),
      self.inner.opts.cache_key.as_deref(),
    ) {
      cache.put(key, &value);
    }
  }

  /// Drop the cache entry backing this resource.
  pub fn clear_cache(&self) {
    if let (Some(cache), Some(key)) = (
      self.inner.cache.as_ref(),
      self.inner.opts.cache_key.as_deref(),
    ) {
      cache.evict(key);
    }
  }

  pub fn snapshot(&self) -> Snapshot<T> {
    self.inner.snapshot_tx.borrow().clone()
  }

  /// Observe snapshot changes. The receiver is notified on change and
  /// always reads the latest snapshot; intermediate states may coalesce.
  pub fn subscribe(&self) -> watch::Receiver<Snapshot<T>> {
    self.inner.snapshot_tx.subscribe()
  }

  pub fn data(&self) -> Option<T> {
    self.inner.snapshot_tx.borrow().data.clone()
  }

  pub fn is_online(&self) -> bool {
    self.inner.monitor.is_online()
  }
}

impl<T> Inner<T>
where
  T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
  fn issue(self: &Arc<Self>, force: bool) {
    let (token, seq) = {
      let mut state = self
        .fetch_state
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

      if let Some(started) = state.last_started {
        if started.elapsed() < self.opts.debounce_window {
          debug!(seq = state.seq, "fetch inside debounce window, collapsed");
          return;
        }
      }

      if !force && self.snapshot_tx.borrow().status == Status::Loading {
        return;
      }

      if !self.monitor.is_online() {
        drop(state);
        // Offline: the cache is the best we can do until connectivity
        // returns.
        self.serve_cached_fresh();
        return;
      }

      // Overtake any in-flight request: cancel its token and bump the
      // sequence so its completion is discarded.
      if let Some(previous) = state.inflight.take() {
        previous.cancel();
      }
      state.seq += 1;
      state.last_started = Some(Instant::now());
      let token = CancelToken::new();
      state.inflight = Some(token.clone());
      debug!(seq = state.seq, "fetch issued");
      (token, state.seq)
    };

    self.snapshot_tx.send_modify(|snap| {
      snap.status = Status::Loading;
    });

    tokio::spawn(run_fetch(Arc::downgrade(self), seq, token));
  }

  /// Serve the freshest non-expired cache entry, or stay as-is.
  fn serve_cached_fresh(&self) -> bool {
    let (Some(cache), Some(key)) = (self.cache.as_ref(), self.opts.cache_key.as_deref()) else {
      return false;
    };

    match cache.get::<T>(key, self.opts.cache_ttl) {
      Some(value) => {
        debug!(key, "serving resource from cache");
        self.snapshot_tx.send_modify(|snap| {
          snap.data = Some(value);
          snap.status = Status::Success;
          snap.error = None;
          snap.is_cached = true;
        });
        true
      }
      None => false,
    }
  }

  /// Apply a fetch completion. Discards anything that is not the latest
  /// issued request.
  fn complete(&self, seq: u64, outcome: Result<T, FetchError>) {
    {
      let mut state = self
        .fetch_state
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      if state.seq != seq {
        debug!(seq, latest = state.seq, "discarding overtaken completion");
        return;
      }
      state.inflight = None;
    }

    match outcome {
      Ok(raw) => {
        let value = match &self.opts.transform {
          Some(transform) => match transform(raw) {
            Ok(v) => v,
            Err(e) => {
              self.fail(e);
              return;
            }
          },
          None => raw,
        };

        if let (Some(cache), Some(key)) = (self.cache.as_ref(), self.opts.cache_key.as_deref()) {
          cache.put(key, &value);
        }

        if let Some(hook) = &self.opts.on_success {
          hook(&value);
        }

        self.snapshot_tx.send_modify(|snap| {
          snap.data = Some(value);
          snap.status = Status::Success;
          snap.error = None;
          snap.is_cached = false;
          snap.fetched_at = Some(Instant::now());
        });
      }
      Err(FetchError::Cancelled) => {
        debug!(seq, "fetch cancelled");
      }
      Err(error) => self.fail(error),
    }
  }

  /// Terminal failure: surface the error, fall back to the cache when no
  /// live value is held. Non-expired entries are preferred; an expired one
  /// is served as a last resort so the consumer is never emptied by a
  /// single failure.
  fn fail(&self, error: FetchError) {
    warn!(%error, "fetch failed terminally");

    if let Some(hook) = &self.opts.on_error {
      hook(&error);
    }

    let has_data = self.snapshot_tx.borrow().data.is_some();
    let fallback: Option<(T, bool)> = if has_data {
      None
    } else {
      match (self.cache.as_ref(), self.opts.cache_key.as_deref()) {
        (Some(cache), Some(key)) => cache
          .get::<T>(key, self.opts.cache_ttl)
          .map(|v| (v, false))
          .or_else(|| {
            cache.get_any::<T>(key).map(|(v, age)| {
              warn!(key, age_secs = age.as_secs(), "serving stale cache entry");
              (v, true)
            })
          }),
        _ => None,
      }
    };

    self.snapshot_tx.send_modify(|snap| {
      snap.status = Status::Error;
      snap.error = Some(error);
      if snap.data.is_none() {
        if let Some((value, _stale)) = fallback {
          snap.data = Some(value);
          snap.is_cached = true;
        }
      }
    });
  }
}

impl<T> Drop for Inner<T> {
  fn drop(&mut self) {
    let state = self
      .fetch_state
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if let Some(token) = &state.inflight {
      token.cancel();
    }
  }
}

/// Retry loop for one issued request. Holds only a weak reference to the
/// resource; completions after teardown go nowhere.
async fn run_fetch<T>(inner: Weak<Inner<T>>, seq: u64, token: CancelToken)
where
  T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
  let mut attempt: u32 = 0;

  loop {
    let Some(strong) = inner.upgrade() else { return };
    let fetcher = strong.fetcher.clone();
    let retry_attempts = strong.opts.retry_attempts;
    let retry_delay = strong.opts.retry_delay;
    drop(strong);

    let result = tokio::select! {
      _ = token.cancelled() => Err(FetchError::Cancelled),
      r = (fetcher)(token.clone()) => r,
    };

    let retryable = match &result {
      Err(e) => e.is_retryable() && attempt < retry_attempts,
      Ok(_) => false,
    };

    if retryable {
      let online = match inner.upgrade() {
        Some(strong) => strong.monitor.is_online(),
        None => return,
      };
      if online {
        let delay = retry_delay.saturating_mul(2u32.saturating_pow(attempt));
        debug!(seq, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
        tokio::select! {
          _ = token.cancelled() => return,
          _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
        continue;
      }
    }

    let Some(strong) = inner.upgrade() else { return };
    strong.complete(seq, result);
    return;
  }
}
