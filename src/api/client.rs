//! HTTP client for the transit-tracking backend.

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::Config;
use crate::error::FetchError;

use super::types::{StockItem, Transit, TransitState, Truck};

/// Typed client over the console backend.
///
/// All calls surface the tagged error taxonomy: transport problems and
/// non-success statuses are `Network`, undecodable payloads are
/// `Transform`.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
  token: String,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;

    let base = Url::parse(&config.api.url)
      .map_err(|e| eyre!("Invalid API url {}: {}", config.api.url, e))?;

    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { http, base, token })
  }

  async fn get_json<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, &str)],
  ) -> Result<T, FetchError> {
    let url = self
      .base
      .join(path)
      .map_err(|e| FetchError::Network(format!("bad endpoint {}: {}", path, e)))?;

    let response = self
      .http
      .get(url)
      .bearer_auth(&self.token)
      .query(query)
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?
      .error_for_status()
      .map_err(|e| FetchError::Network(e.to_string()))?;

    response
      .json::<T>()
      .await
      .map_err(|e| FetchError::Transform(e.to_string()))
  }

  /// Transits, optionally filtered by customs office.
  pub async fn get_transits(&self, aduana: Option<&str>) -> Result<Vec<Transit>, FetchError> {
    let query: Vec<(&str, &str)> = aduana.map(|a| ("aduana", a)).into_iter().collect();
    self.get_json("transits", &query).await
  }

  /// Stock positions, optionally filtered by depot.
  pub async fn get_stock(&self, deposito: Option<&str>) -> Result<Vec<StockItem>, FetchError> {
    let query: Vec<(&str, &str)> = deposito.map(|d| ("deposito", d)).into_iter().collect();
    self.get_json("stock", &query).await
  }

  /// Last reported truck positions.
  pub async fn get_trucks(&self) -> Result<Vec<Truck>, FetchError> {
    self.get_json("trucks", &[]).await
  }

  /// Move a transit to a new state (write operation, never cached).
  pub async fn update_transit_state(
    &self,
    id: &str,
    estado: TransitState,
  ) -> Result<Transit, FetchError> {
    let url = self
      .base
      .join(&format!("transits/{}/estado", id))
      .map_err(|e| FetchError::Network(format!("bad endpoint for {}: {}", id, e)))?;

    let body = serde_json::json!({ "estado": estado });

    let response = self
      .http
      .post(url)
      .bearer_auth(&self.token)
      .json(&body)
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?
      .error_for_status()
      .map_err(|e| FetchError::Network(e.to_string()))?;

    response
      .json::<Transit>()
      .await
      .map_err(|e| FetchError::Transform(e.to_string()))
  }
}
