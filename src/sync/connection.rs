//! Host and push-transport connectivity tracking.
//!
//! The two booleans are independent: the host can be online while the push
//! transport is still reconnecting. Host connectivity events drive
//! `set_online`; transport status is mirrored by `attach`.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::cache::CacheStore;
use super::realtime::{SharedTransport, TransportLease};

#[derive(Clone)]
pub struct ConnectionMonitor {
  inner: Arc<MonitorInner>,
}

struct MonitorInner {
  online_tx: watch::Sender<bool>,
  channel_tx: watch::Sender<bool>,
  last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl ConnectionMonitor {
  pub fn new() -> Self {
    let (online_tx, _) = watch::channel(true);
    let (channel_tx, _) = watch::channel(false);
    Self {
      inner: Arc::new(MonitorInner {
        online_tx,
        channel_tx,
        last_sync: Mutex::new(None),
      }),
    }
  }

  pub fn is_online(&self) -> bool {
    *self.inner.online_tx.borrow()
  }

  /// Drive host connectivity from the host's online/offline events.
  pub fn set_online(&self, online: bool) {
    let changed = self.inner.online_tx.send_replace(online) != online;
    if changed {
      debug!(online, "host connectivity changed");
    }
  }

  pub fn online_rx(&self) -> watch::Receiver<bool> {
    self.inner.online_tx.subscribe()
  }

  pub fn is_channel_connected(&self) -> bool {
    *self.inner.channel_tx.borrow()
  }

  pub fn set_channel_connected(&self, connected: bool) {
    self.inner.channel_tx.send_replace(connected);
  }

  pub fn channel_rx(&self) -> watch::Receiver<bool> {
    self.inner.channel_tx.subscribe()
  }

  pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
    *self
      .inner
      .last_sync
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Manual sync: clear cached data and stamp the sync time.
  ///
  /// No-op while offline; returns whether the sync ran.
  pub fn sync(&self, cache: &CacheStore) -> bool {
    if !self.is_online() {
      debug!("sync requested while offline, skipping");
      return false;
    }

    cache.clear();
    *self
      .inner
      .last_sync
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    true
  }

  /// Open the shared transport and mirror its status into
  /// `channel_connected`. The returned binding tears both down exactly once
  /// on drop.
  pub fn attach(&self, transport: &SharedTransport) -> TransportBinding {
    let lease = transport.acquire();
    let mut status_rx = transport.status_rx();
    self.set_channel_connected(*status_rx.borrow());

    let monitor = self.clone();
    let forwarder = tokio::spawn(async move {
      while status_rx.changed().await.is_ok() {
        let connected = *status_rx.borrow();
        monitor.set_channel_connected(connected);
      }
    });

    TransportBinding {
      monitor: self.clone(),
      _lease: lease,
      forwarder,
    }
  }
}

impl Default for ConnectionMonitor {
  fn default() -> Self {
    Self::new()
  }
}

/// An open transport attachment; dropping it releases the connection lease
/// and stops mirroring status.
pub struct TransportBinding {
  monitor: ConnectionMonitor,
  _lease: TransportLease,
  forwarder: JoinHandle<()>,
}

impl Drop for TransportBinding {
  fn drop(&mut self) {
    self.forwarder.abort();
    self.monitor.set_channel_connected(false);
  }
}
