//! Verifier: buffers a response body and checks it against a quorum of
//! trust-anchor gateways before any byte is released to a caller.
//!
//! Buffers the body, computes its local digest with `sha2::Sha256`, and
//! cross-checks it against each trust anchor's independently reported
//! digest for the same `txId`.

use sha2::{Digest, Sha256};
use std::time::Instant;

use crate::error::GatewayError;
use crate::types::GatewayInfo;

pub struct VerifiedResult {
  pub duration_ms: u64,
  pub hash: String,
  pub verified_by_gateways: Vec<String>,
}

/// Returns the trust anchor's reported content hash for `tx_id`, or an error
/// if the anchor could not be reached or disagrees in shape.
#[async_trait::async_trait]
pub trait HashOracle: Send + Sync {
  async fn fetch_hash(&self, anchor: &GatewayInfo, tx_id: &str) -> anyhow::Result<String>;
}

pub struct Verifier {
  oracle: std::sync::Arc<dyn HashOracle>,
  consensus_threshold: usize,
}

impl Verifier {
  pub fn new(oracle: std::sync::Arc<dyn HashOracle>, consensus_threshold: usize) -> Self {
    Self { oracle, consensus_threshold }
  }

  /// Buffers `bytes` (already fully read by the caller), computes the local
  /// digest, and confirms at least `consensus_threshold` trust anchors
  /// report the same digest for `tx_id`.
  pub async fn verify_against_anchors(
    &self,
    bytes: &[u8],
    tx_id: &str,
    anchors: &[GatewayInfo],
  ) -> Result<VerifiedResult, GatewayError> {
    let start = Instant::now();
    let local_hash = digest_hex(bytes);

    let mut verified_by = Vec::new();
    for anchor in anchors {
      match self.oracle.fetch_hash(anchor, tx_id).await {
        Ok(hash) if hash == local_hash => verified_by.push(anchor.origin.clone()),
        Ok(_) | Err(_) => continue,
      }
    }

    if verified_by.len() < self.consensus_threshold {
      return Err(GatewayError::Verification(format!(
        "only {} of {} required trust anchors confirmed hash {}",
        verified_by.len(),
        self.consensus_threshold,
        local_hash
      )));
    }

    Ok(VerifiedResult {
      duration_ms: start.elapsed().as_millis() as u64,
      hash: local_hash,
      verified_by_gateways: verified_by,
    })
  }

  /// Pure variant for already-buffered inputs with a pre-known expected
  /// hash, used by the manifest resolver to verify manifest JSON without
  /// re-deriving anchor quorum logic.
  pub fn verify(bytes: &[u8], expected_hash: &str) -> Result<String, GatewayError> {
    let local_hash = digest_hex(bytes);
    if local_hash != expected_hash {
      return Err(GatewayError::Verification(format!(
        "hash mismatch: expected {expected_hash}, computed {local_hash}"
      )));
    }
    Ok(local_hash)
  }
}

pub fn digest_hex(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  format!("{:x}", hasher.finalize())
}
