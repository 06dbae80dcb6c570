//! Fetch-and-verify engine: the outer retry loop tying selection, upstream
//! fetch, manifest resolution, verification, and caching together.

use std::sync::Arc;
use std::time::Instant;

use crate::cache::{cache_response_headers, ContentCache};
use crate::error::GatewayError;
use crate::health::{HealthRegistry, VERIFICATION_FAILURE_WEIGHT};
use crate::manifest::ManifestResolver;
use crate::selector::Selector;
use crate::temperature::TemperatureStore;
use crate::types::{CachedContent, GatewayInfo, VerifiedFetch};
use crate::verifier::Verifier;

pub struct UpstreamResponse {
  pub body: bytes::Bytes,
  pub content_type: Option<String>,
  pub headers: Vec<(String, String)>,
  pub is_manifest: bool,
  pub data_id: Option<String>,
}

/// Issues the actual upstream HTTP request with the origin-chosen URL
/// shape (sandbox subdomain for txIds, name subdomain for ArNS).
#[async_trait::async_trait]
pub trait UpstreamFetcher: Send + Sync {
  async fn fetch(&self, gateway_origin: &str, tx_id: &str, path: &str) -> anyhow::Result<UpstreamResponse>;
}

pub struct FetchEngine {
  selector: Arc<Selector>,
  health: Arc<HealthRegistry>,
  temperature: Arc<TemperatureStore>,
  cache: Arc<ContentCache>,
  manifest_resolver: Arc<ManifestResolver>,
  verifier: Arc<Verifier>,
  upstream: Arc<dyn UpstreamFetcher>,
  retry_attempts: u32,
}

impl FetchEngine {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    selector: Arc<Selector>,
    health: Arc<HealthRegistry>,
    temperature: Arc<TemperatureStore>,
    cache: Arc<ContentCache>,
    manifest_resolver: Arc<ManifestResolver>,
    verifier: Arc<Verifier>,
    upstream: Arc<dyn UpstreamFetcher>,
    retry_attempts: u32,
  ) -> Self {
    Self {
      selector,
      health,
      temperature,
      cache,
      manifest_resolver,
      verifier,
      upstream,
      retry_attempts,
    }
  }

  /// Early short-circuit: before any upstream fetch, serve directly from
  /// cache if this exact `(txId, path)` is already verified and stored.
  pub async fn fetch_and_verify(
    &self,
    tx_id: &str,
    path: &str,
    pool: &[GatewayInfo],
    anchors: &[GatewayInfo],
  ) -> Result<VerifiedFetch, GatewayError> {
    if let Some(hit) = self.serve_from_cache(tx_id, path).await {
      return Ok(hit);
    }

    let mut excluded: Vec<String> = Vec::new();
    let mut failures: Vec<(String, String)> = Vec::new();

    for _attempt in 0..self.retry_attempts {
      let Some(gateway) = self.selector.select(pool, &excluded, path, tx_id).await else {
        return Err(GatewayError::NoHealthyGateways);
      };

      match self.try_gateway(&gateway, tx_id, path, anchors).await {
        Ok(result) => return Ok(result),
        Err(err) => {
          let weight = if err.is_adversarial() { VERIFICATION_FAILURE_WEIGHT } else { 1 };
          self.health.record_failure(&gateway, weight);
          self.temperature.record_failure(&gateway);
          failures.push((gateway.clone(), err.to_string()));
          excluded.push(gateway);

          if err.is_terminal() {
            return Err(err);
          }
        }
      }
    }

    Err(GatewayError::RetryExhausted {
      attempts: failures.len(),
      failures,
    })
  }

  async fn serve_from_cache(&self, tx_id: &str, path: &str) -> Option<VerifiedFetch> {
    let content = self.cache.get(tx_id, path).await?;
    let age_secs = content.verified_at.elapsed().map(|d| d.as_secs()).ok();
    Some(VerifiedFetch {
      content,
      routed_via: "cache".to_string(),
      verified: true,
      verified_by: vec![],
      cached: true,
      cache_age_secs: age_secs,
      manifest_tx_id: None,
      verification_time_ms: None,
    })
  }

  async fn try_gateway(
    &self,
    gateway: &str,
    tx_id: &str,
    path: &str,
    anchors: &[GatewayInfo],
  ) -> Result<VerifiedFetch, GatewayError> {
    let start = Instant::now();
    let response = self
      .upstream
      .fetch(gateway, tx_id, path)
      .await
      .map_err(|e| GatewayError::Gateway { status: 502, message: e.to_string() })?;

    if response.is_manifest {
      return self.resolve_via_manifest(gateway, tx_id, path, &response, anchors, start).await;
    }

    self.verify_and_store(gateway, tx_id, path, response, anchors, start, None).await
  }

  async fn resolve_via_manifest(
    &self,
    gateway: &str,
    manifest_tx_id: &str,
    path: &str,
    response: &UpstreamResponse,
    anchors: &[GatewayInfo],
    start: Instant,
  ) -> Result<VerifiedFetch, GatewayError> {
    let manifest = self.manifest_resolver.get_manifest(manifest_tx_id).await?;
    let resolved = ManifestResolver::resolve_path(&manifest, path, manifest_tx_id)?;

    if let Some(data_id) = &response.data_id {
      if data_id != &resolved.tx_id {
        return Err(GatewayError::Manifest(format!(
          "gateway dataId {data_id} does not match manifest mapping {}",
          resolved.tx_id
        )));
      }
    }

    if let Some(hit) = self.serve_from_cache(&resolved.tx_id, "").await {
      return Ok(VerifiedFetch { manifest_tx_id: Some(manifest_tx_id.to_string()), ..hit });
    }

    let content_response = self.upstream.fetch(gateway, &resolved.tx_id, "").await.map_err(|e| {
      GatewayError::Gateway { status: 502, message: e.to_string() }
    })?;

    self
      .verify_and_store(
        gateway,
        &resolved.tx_id,
        "",
        content_response,
        anchors,
        start,
        Some(manifest_tx_id.to_string()),
      )
      .await
  }

  async fn verify_and_store(
    &self,
    gateway: &str,
    tx_id: &str,
    path: &str,
    response: UpstreamResponse,
    anchors: &[GatewayInfo],
    start: Instant,
    manifest_tx_id: Option<String>,
  ) -> Result<VerifiedFetch, GatewayError> {
    let verified = self.verifier.verify_against_anchors(&response.body, tx_id, anchors).await?;

    self.health.mark_healthy(gateway);
    self.temperature.record_success(gateway, start.elapsed().as_millis() as u32);

    let content = CachedContent {
      data: response.body,
      content_type: response.content_type,
      content_length: content_length(&response.headers),
      headers: response.headers,
      verified_at: std::time::SystemTime::now(),
      tx_id: tx_id.to_string(),
      hash: Some(verified.hash.clone()),
      access_count: 0,
      last_accessed: std::time::SystemTime::now(),
    };
    self.cache.put(tx_id, path, content.clone()).await;

    Ok(VerifiedFetch {
      content,
      routed_via: gateway.to_string(),
      verified: true,
      verified_by: verified.verified_by_gateways,
      cached: false,
      cache_age_secs: None,
      manifest_tx_id,
      verification_time_ms: Some(verified.duration_ms),
    })
  }
}

fn content_length(headers: &[(String, String)]) -> usize {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
    .and_then(|(_, v)| v.parse().ok())
    .unwrap_or(0)
}

/// Builds the provenance header set for a completed fetch.
pub fn provenance_headers(result: &VerifiedFetch) -> Vec<(String, String)> {
  let mut headers = if result.cached {
    cache_response_headers(&result.content)
  } else {
    vec![("x-wayfinder-cached".to_string(), "false".to_string())]
  };

  headers.push(("x-wayfinder-verified".to_string(), result.verified.to_string()));
  headers.push(("x-wayfinder-routed-via".to_string(), result.routed_via.clone()));
  headers.push(("x-wayfinder-verified-by".to_string(), result.verified_by.join(",")));
  headers.push(("x-wayfinder-tx-id".to_string(), result.content.tx_id.clone()));
  if let Some(manifest_tx_id) = &result.manifest_tx_id {
    headers.push(("x-wayfinder-manifest-tx-id".to_string(), manifest_tx_id.clone()));
  }
  if let Some(ms) = result.verification_time_ms {
    headers.push(("x-wayfinder-verification-time-ms".to_string(), ms.to_string()));
  }
  headers
}
