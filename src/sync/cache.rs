//! TTL-aware cache over a persistent store.
//!
//! Entries are persisted as a JSON envelope `{"data": ..., "timestamp": ...}`
//! with an epoch-millisecond timestamp. The envelope is an external format:
//! renaming cache keys must preserve read compatibility or migrate
//! explicitly. Backend failures degrade to cache misses, never errors.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::store::PersistentStore;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
  data: serde_json::Value,
  /// Epoch milliseconds at store time.
  timestamp: i64,
}

/// Synchronous TTL-aware key/value cache.
#[derive(Clone)]
pub struct CacheStore {
  store: Arc<dyn PersistentStore>,
}

impl CacheStore {
  pub fn new(store: Arc<dyn PersistentStore>) -> Self {
    Self { store }
  }

  /// Persist a value under `key`, overwriting silently.
  pub fn put<T: Serialize>(&self, key: &str, value: &T) {
    let data = match serde_json::to_value(value) {
      Ok(v) => v,
      Err(e) => {
        warn!(key, error = %e, "cache serialize failed, entry dropped");
        return;
      }
    };

    let envelope = Envelope {
      data,
      timestamp: Utc::now().timestamp_millis(),
    };

    let text = match serde_json::to_string(&envelope) {
      Ok(t) => t,
      Err(e) => {
        warn!(key, error = %e, "cache envelope serialize failed, entry dropped");
        return;
      }
    };

    if let Err(e) = self.store.set(key, &text) {
      warn!(key, error = %e, "cache backend write failed, entry dropped");
    }
  }

  /// Return the value only while it is younger than `ttl`.
  pub fn get<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<T> {
    let (value, age) = self.read(key)?;
    if age > ttl {
      return None;
    }
    Some(value)
  }

  /// Last-resort read ignoring TTL; returns the entry age alongside.
  pub fn get_any<T: DeserializeOwned>(&self, key: &str) -> Option<(T, Duration)> {
    self.read(key)
  }

  fn read<T: DeserializeOwned>(&self, key: &str) -> Option<(T, Duration)> {
    let text = match self.store.get(key) {
      Ok(Some(t)) => t,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "cache backend read failed, treating as miss");
        return None;
      }
    };

    let envelope: Envelope = match serde_json::from_str(&text) {
      Ok(env) => env,
      Err(e) => {
        warn!(key, error = %e, "corrupt cache entry, treating as miss");
        return None;
      }
    };

    let age_ms = (Utc::now().timestamp_millis() - envelope.timestamp).max(0) as u64;
    let value = serde_json::from_value(envelope.data).ok()?;

    Some((value, Duration::from_millis(age_ms)))
  }

  /// Remove a single entry.
  pub fn evict(&self, key: &str) {
    if let Err(e) = self.store.remove(key) {
      warn!(key, error = %e, "cache evict failed");
    }
  }

  /// Remove every entry.
  pub fn clear(&self) {
    if let Err(e) = self.store.clear() {
      warn!(error = %e, "cache clear failed");
    }
  }
}
