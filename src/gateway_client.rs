//! Production, `reqwest`-backed implementations of the oracle traits the
//! rest of the pipeline only consumes as abstractions: `UpstreamFetcher`
//! (fetch.rs), `HashOracle` (verifier.rs), `NameOracle` (resolver.rs), and
//! `ManifestFetcher` (manifest.rs).
//!
//! Each implementation is a thin wrapper over a shared `reqwest::Client`,
//! kept separate from the traits they implement so the rest of the
//! pipeline can be tested against fakes.

use std::sync::Arc;

use crate::fetch::{UpstreamFetcher, UpstreamResponse};
use crate::pool::GatewayPoolManager;
use crate::resolver::{NameOracle, Resolution};
use crate::sandbox;
use crate::types::GatewayInfo;
use crate::verifier::{digest_hex, HashOracle};

const MANIFEST_CONTENT_TYPE: &str = "application/x.arweave-manifest+json";
const DATA_ID_HEADER: &str = "x-ar-io-data-id";
const DEFAULT_ARNS_TTL_MS: u64 = 5 * 60_000;

/// Splits `scheme://host[:port]` into its two halves, for re-assembling a
/// sandbox-subdomain host on the same scheme.
fn split_origin(origin: &str) -> (&str, &str) {
  origin.split_once("://").unwrap_or(("https", origin))
}

/// Builds the outbound URL for `tx_id`/`path` against `gateway_origin`,
/// preferring the sandbox subdomain and falling back to a plain path-based
/// request when the txId can't be sandboxed (used by tests and by bare
/// loopback gateways configured without a real hostname).
pub fn upstream_url(gateway_origin: &str, tx_id: &str, path: &str) -> String {
  let (scheme, host) = split_origin(gateway_origin);
  match sandbox::sandbox_for_tx_id(tx_id) {
    Some(sandbox_label) => format!("{scheme}://{sandbox_label}.{host}/{tx_id}{path}"),
    None => format!("{gateway_origin}/{tx_id}{path}"),
  }
}

/// Issues the outbound fetch for a resolved `(txId, path)` against whichever
/// gateway the selector picked.
pub struct HttpUpstreamFetcher {
  client: reqwest::Client,
}

impl HttpUpstreamFetcher {
  pub fn new(client: reqwest::Client) -> Self {
    Self { client }
  }
}

#[async_trait::async_trait]
impl UpstreamFetcher for HttpUpstreamFetcher {
  async fn fetch(&self, gateway_origin: &str, tx_id: &str, path: &str) -> anyhow::Result<UpstreamResponse> {
    let url = upstream_url(gateway_origin, tx_id, path);
    let response = self.client.get(&url).send().await?.error_for_status()?;

    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(|s| s.to_string());
    let is_manifest = content_type.as_deref() == Some(MANIFEST_CONTENT_TYPE);
    let data_id = response
      .headers()
      .get(DATA_ID_HEADER)
      .and_then(|v| v.to_str().ok())
      .map(|s| s.to_string());

    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
      .collect();

    let body = response.bytes().await?;

    Ok(UpstreamResponse { body, content_type, headers, is_manifest, data_id })
  }
}

/// A trust anchor's reported content hash, obtained by independently
/// fetching the object from that anchor and hashing locally — there is no
/// separate "hash" endpoint on an ar.io gateway, so agreement is established
/// by each anchor answering the same question the verifier asks of itself.
pub struct HttpHashOracle {
  client: reqwest::Client,
}

impl HttpHashOracle {
  pub fn new(client: reqwest::Client) -> Self {
    Self { client }
  }
}

#[async_trait::async_trait]
impl HashOracle for HttpHashOracle {
  async fn fetch_hash(&self, anchor: &GatewayInfo, tx_id: &str) -> anyhow::Result<String> {
    let url = format!("{}/{tx_id}", anchor.origin);
    let bytes = self.client.get(&url).send().await?.error_for_status()?.bytes().await?;
    Ok(digest_hex(&bytes))
  }
}

/// ArNS name resolution against a single trust anchor's ar.io resolver
/// endpoint.
pub struct HttpNameOracle {
  client: reqwest::Client,
}

impl HttpNameOracle {
  pub fn new(client: reqwest::Client) -> Self {
    Self { client }
  }
}

#[derive(serde::Deserialize)]
struct ArnsRecord {
  #[serde(rename = "txId")]
  tx_id: String,
  #[serde(rename = "ttlSeconds", default)]
  ttl_seconds: Option<u64>,
}

#[async_trait::async_trait]
impl NameOracle for HttpNameOracle {
  async fn resolve(&self, anchor: &GatewayInfo, name: &str) -> anyhow::Result<Resolution> {
    let url = format!("{}/ar-io/resolver/records/{name}", anchor.origin);
    let record: ArnsRecord = self.client.get(&url).send().await?.error_for_status()?.json().await?;
    let ttl_ms = record.ttl_seconds.map(|s| s * 1000).unwrap_or(DEFAULT_ARNS_TTL_MS);
    Ok(Resolution { tx_id: record.tx_id, ttl_ms })
  }
}

/// Fetches and verifies manifest JSON: the raw bytes come from the
/// highest-staked gateway in the pool, the expected hash from the first
/// responsive top-staked trust anchor.
pub struct HttpManifestFetcher {
  client: reqwest::Client,
  pool: Arc<GatewayPoolManager>,
  hash_oracle: Arc<dyn HashOracle>,
  anchor_count: usize,
}

impl HttpManifestFetcher {
  pub fn new(
    client: reqwest::Client,
    pool: Arc<GatewayPoolManager>,
    hash_oracle: Arc<dyn HashOracle>,
    anchor_count: usize,
  ) -> Self {
    Self { client, pool, hash_oracle, anchor_count }
  }
}

#[async_trait::async_trait]
impl crate::manifest::ManifestFetcher for HttpManifestFetcher {
  async fn fetch(&self, manifest_tx_id: &str) -> anyhow::Result<(Vec<u8>, String)> {
    let pool = self.pool.get_all_gateways().await;
    let source = pool.first().ok_or_else(|| anyhow::anyhow!("no gateways available to fetch manifest"))?;
    let url = format!("{}/{manifest_tx_id}", source.origin);
    let bytes = self.client.get(&url).send().await?.error_for_status()?.bytes().await?.to_vec();

    let anchors = self.pool.get_top_staked_gateways(self.anchor_count).await;
    for anchor in &anchors {
      if let Ok(hash) = self.hash_oracle.fetch_hash(anchor, manifest_tx_id).await {
        return Ok((bytes, hash));
      }
    }

    anyhow::bail!("no trust anchor could confirm a hash for manifest {manifest_tx_id}")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sandboxes_url_when_tx_id_is_valid() {
    let tx_id = "A".repeat(sandbox::TXID_LEN);
    let url = upstream_url("https://g1.example", &tx_id, "/foo");
    let sandbox_label = sandbox::sandbox_for_tx_id(&tx_id).unwrap();
    assert_eq!(url, format!("https://{sandbox_label}.g1.example/{tx_id}/foo"));
  }

  #[test]
  fn falls_back_to_path_based_for_malformed_tx_id() {
    let url = upstream_url("https://g1.example", "not!a!valid!id", "/foo");
    assert_eq!(url, "https://g1.example/not!a!valid!id/foo");
  }
}
