//! Manifest resolver: fetches/verifies path manifests and maps a subpath to
//! a content txId, with single-flight dedup per manifest.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::error::GatewayError;
use crate::types::{ManifestDoc, ResolvedManifestPath, VerifiedManifest};
use crate::verifier::Verifier;

const MAX_MANIFEST_SIZE_BYTES: usize = 10 * 1024 * 1024;

/// Fetches the raw manifest bytes plus the trust-anchor-reported hash to
/// verify against, for a given manifest txId.
#[async_trait::async_trait]
pub trait ManifestFetcher: Send + Sync {
  async fn fetch(&self, manifest_tx_id: &str) -> anyhow::Result<(Vec<u8>, String)>;
}

enum Slot {
  InFlight(Arc<Notify>),
  Done(Arc<VerifiedManifest>),
  Failed,
}

pub struct ManifestResolver {
  fetcher: Arc<dyn ManifestFetcher>,
  slots: Mutex<HashMap<String, Slot>>,
}

impl ManifestResolver {
  pub fn new(fetcher: Arc<dyn ManifestFetcher>) -> Self {
    Self { fetcher, slots: Mutex::new(HashMap::new()) }
  }

  pub async fn get_manifest(&self, manifest_tx_id: &str) -> Result<Arc<VerifiedManifest>, GatewayError> {
    loop {
      let mut slots = self.slots.lock().await;
      match slots.get(manifest_tx_id) {
        Some(Slot::Done(manifest)) => return Ok(manifest.clone()),
        Some(Slot::InFlight(notify)) => {
          let notify = notify.clone();
          drop(slots);
          notify.notified().await;
          continue;
        }
        Some(Slot::Failed) | None => {
          let notify = Arc::new(Notify::new());
          slots.insert(manifest_tx_id.to_string(), Slot::InFlight(notify.clone()));
          drop(slots);

          let result = self.fetch_and_verify(manifest_tx_id).await;
          let mut slots = self.slots.lock().await;
          match &result {
            Ok(manifest) => {
              slots.insert(manifest_tx_id.to_string(), Slot::Done(manifest.clone()));
            }
            Err(_) => {
              slots.remove(manifest_tx_id);
            }
          }
          drop(slots);
          notify.notify_waiters();
          return result;
        }
      }
    }
  }

  async fn fetch_and_verify(&self, manifest_tx_id: &str) -> Result<Arc<VerifiedManifest>, GatewayError> {
    let (bytes, expected_hash) = self
      .fetcher
      .fetch(manifest_tx_id)
      .await
      .map_err(|e| GatewayError::Manifest(e.to_string()))?;

    if bytes.len() > MAX_MANIFEST_SIZE_BYTES {
      return Err(GatewayError::Manifest(format!(
        "manifest {manifest_tx_id} exceeds {MAX_MANIFEST_SIZE_BYTES} bytes"
      )));
    }

    Verifier::verify(&bytes, &expected_hash)?;

    let doc: ManifestDoc =
      serde_json::from_slice(&bytes).map_err(|e| GatewayError::Manifest(e.to_string()))?;

    if !VerifiedManifest::is_valid_shape(&doc) {
      return Err(GatewayError::Manifest(
        "manifest has no path entries and no index".to_string(),
      ));
    }

    Ok(Arc::new(VerifiedManifest {
      tx_id: manifest_tx_id.to_string(),
      manifest: doc,
      verified_at: std::time::SystemTime::now(),
      size_bytes: bytes.len(),
    }))
  }

  /// Normalizes `path`, tries the index entry for empty/`/`, tries
  /// leading-and-no-leading-slash variants, then falls back if configured.
  pub fn resolve_path(
    manifest: &VerifiedManifest,
    path: &str,
    manifest_tx_id: &str,
  ) -> Result<ResolvedManifestPath, GatewayError> {
    let normalized = path.trim_start_matches('/');

    if normalized.is_empty() {
      if let Some(index) = &manifest.manifest.index {
        if let Some(entry) = manifest.manifest.paths.get(&index.path) {
          return Ok(ResolvedManifestPath { tx_id: entry.id.clone(), is_index: true });
        }
      }
    }

    if let Some(entry) = manifest.manifest.paths.get(normalized) {
      return Ok(ResolvedManifestPath { tx_id: entry.id.clone(), is_index: false });
    }

    let with_slash = format!("/{normalized}");
    if let Some(entry) = manifest.manifest.paths.get(&with_slash) {
      return Ok(ResolvedManifestPath { tx_id: entry.id.clone(), is_index: false });
    }

    if let Some(fallback) = &manifest.manifest.fallback {
      return Ok(ResolvedManifestPath { tx_id: fallback.id.clone(), is_index: false });
    }

    Err(GatewayError::ManifestPathNotFound {
      manifest_tx_id: manifest_tx_id.to_string(),
      path: path.to_string(),
    })
  }
}
