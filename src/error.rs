//! Tagged error taxonomy for the synchronization layer.
//!
//! Retry policy is driven by the variant, never by message content.

use thiserror::Error;

/// Failure reported by a fetcher or the synchronization layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// The host is offline or the remote call failed in transit.
  #[error("network failure: {0}")]
  Network(String),

  /// The fetched payload could not be decoded or transformed.
  /// Terminal: transforms are deterministic, so this is never retried.
  #[error("transform failed: {0}")]
  Transform(String),

  /// The call was overtaken by a newer request or its owner was torn down.
  /// Never surfaced as a terminal error.
  #[error("cancelled")]
  Cancelled,
}

impl FetchError {
  /// Whether the retry loop may attempt this call again.
  pub fn is_retryable(&self) -> bool {
    matches!(self, FetchError::Network(_))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, FetchError::Cancelled)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_network_failures_retry() {
    assert!(FetchError::Network("timeout".into()).is_retryable());
    assert!(!FetchError::Transform("bad field".into()).is_retryable());
    assert!(!FetchError::Cancelled.is_retryable());
  }
}
