//! Stable cache keys for API queries.

use sha2::{Digest, Sha256};

/// Query descriptors for the console's API calls.
#[derive(Clone, Debug)]
pub enum ApiQuery {
  /// Transits, optionally filtered by customs office.
  Transits { aduana: Option<String> },
  /// Stock positions, optionally filtered by depot.
  Stock { deposito: Option<String> },
  /// All tracked truck positions.
  Trucks,
}

impl ApiQuery {
  /// Stable fixed-length cache key.
  ///
  /// Filters are normalized so equivalent queries share an entry. Renaming
  /// the inputs here breaks read compatibility with persisted caches.
  pub fn cache_key(&self) -> String {
    let input = match self {
      Self::Transits { aduana } => {
        format!("transits:{}", aduana.as_deref().map(normalize).unwrap_or_default())
      }
      Self::Stock { deposito } => {
        format!("stock:{}", deposito.as_deref().map(normalize).unwrap_or_default())
      }
      Self::Trucks => "trucks".to_string(),
    };

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human-readable description for logs.
  pub fn description(&self) -> String {
    match self {
      Self::Transits { aduana } => match aduana {
        Some(a) => format!("transits at {}", a),
        None => "all transits".to_string(),
      },
      Self::Stock { deposito } => match deposito {
        Some(d) => format!("stock at {}", d),
        None => "all stock".to_string(),
      },
      Self::Trucks => "truck positions".to_string(),
    }
  }
}

/// Normalize a filter for consistent hashing.
fn normalize(filter: &str) -> String {
  filter.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_equivalent_filters_share_a_key() {
    let a = ApiQuery::Transits {
      aduana: Some("ASU".to_string()),
    };
    let b = ApiQuery::Transits {
      aduana: Some("  asu ".to_string()),
    };
    assert_eq!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_distinct_queries_get_distinct_keys() {
    let transits = ApiQuery::Transits { aduana: None };
    let stock = ApiQuery::Stock { deposito: None };
    let trucks = ApiQuery::Trucks;

    assert_ne!(transits.cache_key(), stock.cache_key());
    assert_ne!(stock.cache_key(), trucks.cache_key());
  }

  #[test]
  fn test_keys_are_fixed_length_hex() {
    let key = ApiQuery::Trucks.cache_key();
    assert_eq!(key.len(), 64);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
