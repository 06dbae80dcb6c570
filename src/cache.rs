//! Two-tier verified-content cache: an in-memory index, optionally backed by
//! an on-disk blob store.
//!
//! Entries are keyed by `txId:path`. The in-memory index always holds the
//! full entry; the disk tier, when configured, persists the blob plus a
//! metadata sidecar with a write-then-rename so a crash mid-write never
//! leaves a corrupt entry behind. Eviction scores entries by a blend of
//! recency, access count, and size to make room under the configured byte
//! budget.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::{CacheEntryMeta, CachedContent};

#[derive(Clone)]
struct IndexEntry {
  content: CachedContent,
  disk_backed: bool,
}

pub struct ContentCache {
  index: Mutex<HashMap<String, IndexEntry>>,
  disk_dir: Option<PathBuf>,
  max_size_bytes: u64,
  max_item_size_bytes: u64,
  current_size: Mutex<u64>,
}

pub fn cache_key(tx_id: &str, path: &str) -> String {
  format!("{tx_id}:{path}")
}

fn key_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  format!("{:x}", hasher.finalize())
}

impl ContentCache {
  pub async fn new(disk_dir: Option<PathBuf>, max_size_bytes: u64, max_item_size_bytes: u64) -> Self {
    let cache = Self {
      index: Mutex::new(HashMap::new()),
      disk_dir,
      max_size_bytes,
      max_item_size_bytes,
      current_size: Mutex::new(0),
    };
    cache.restore_from_disk().await;
    cache
  }

  fn bin_path(&self, dir: &std::path::Path, key: &str) -> PathBuf {
    dir.join(format!("{}.bin", key_hash(key)))
  }

  fn meta_path(&self, dir: &std::path::Path, key: &str) -> PathBuf {
    dir.join(format!("{}.meta.json", key_hash(key)))
  }

  async fn restore_from_disk(&self) {
    let Some(dir) = self.disk_dir.clone() else { return };
    if tokio::fs::create_dir_all(&dir).await.is_err() {
      warn!(dir = %dir.display(), "failed to create cache directory");
      return;
    }

    let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { return };
    let mut restored = 0u64;

    while let Ok(Some(entry)) = entries.next_entry().await {
      let path = entry.path();
      let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
      if !name.ends_with(".meta.json") {
        continue;
      }

      let hash = &name[..name.len() - ".meta.json".len()];
      let bin_path = dir.join(format!("{hash}.bin"));

      let meta_bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(_) => continue,
      };
      let meta: Result<CacheEntryMeta, _> = serde_json::from_slice(&meta_bytes);

      match (meta, bin_path.exists()) {
        (Ok(meta), true) => {
          if restored + meta.content_length as u64 > self.max_size_bytes {
            let _ = tokio::fs::remove_file(&path).await;
            let _ = tokio::fs::remove_file(&bin_path).await;
            continue;
          }
          restored += meta.content_length as u64;
          let content = CachedContent {
            data: bytes::Bytes::new(),
            content_type: meta.content_type,
            content_length: meta.content_length,
            headers: meta.headers,
            verified_at: SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(meta.verified_at_unix_ms),
            tx_id: meta.tx_id,
            hash: meta.hash,
            access_count: 0,
            last_accessed: SystemTime::now(),
          };
          let mut index = self.index.lock().await;
          index.insert(meta.key, IndexEntry { content, disk_backed: true });
        }
        _ => {
          // orphan meta (or missing bin): clean up both
          let _ = tokio::fs::remove_file(&path).await;
          let _ = tokio::fs::remove_file(&bin_path).await;
        }
      }
    }

    *self.current_size.lock().await = restored;
  }

  pub async fn get(&self, tx_id: &str, path: &str) -> Option<CachedContent> {
    let key = cache_key(tx_id, path);
    let disk_dir = self.disk_dir.clone();

    let mut index = self.index.lock().await;
    let entry = index.get_mut(&key)?;
    entry.content.access_count += 1;
    entry.content.last_accessed = SystemTime::now();
    let disk_backed = entry.disk_backed;
    let mut content = entry.content.clone();
    drop(index);

    if disk_backed {
      let dir = disk_dir?;
      let bin_path = self.bin_path(&dir, &key);
      content.data = match tokio::fs::read(&bin_path).await {
        Ok(bytes) => bytes::Bytes::from(bytes),
        Err(_) => return None,
      };
    }

    Some(content)
  }

  pub async fn put(&self, tx_id: &str, path: &str, content: CachedContent) {
    let key = cache_key(tx_id, path);
    let size = content.content_length as u64;

    if size > self.max_item_size_bytes || size > self.max_size_bytes {
      debug!(key, size, "rejecting oversized cache entry");
      return;
    }

    self.make_room(size).await;

    let prior_size = {
      let index = self.index.lock().await;
      index.get(&key).map(|e| e.content.content_length as u64)
    };

    if let Some(dir) = self.disk_dir.clone() {
      if tokio::fs::create_dir_all(&dir).await.is_ok() {
        self.write_disk_entry(&dir, &key, &content).await;
        let stored = CachedContent { data: bytes::Bytes::new(), ..content.clone() };
        let mut index = self.index.lock().await;
        index.insert(key, IndexEntry { content: stored, disk_backed: true });
        self.adjust_size(prior_size, size).await;
        return;
      }
    }

    let mut index = self.index.lock().await;
    index.insert(key, IndexEntry { content, disk_backed: false });
    self.adjust_size(prior_size, size).await;
  }

  async fn adjust_size(&self, prior_size: Option<u64>, new_size: u64) {
    let mut current = self.current_size.lock().await;
    if let Some(prior) = prior_size {
      *current -= prior;
    }
    *current += new_size;
  }

  async fn write_disk_entry(&self, dir: &std::path::Path, key: &str, content: &CachedContent) {
    let meta = CacheEntryMeta {
      key: key.to_string(),
      content_type: content.content_type.clone(),
      content_length: content.content_length,
      headers: content.headers.clone(),
      verified_at_unix_ms: content
        .verified_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0),
      tx_id: content.tx_id.clone(),
      hash: content.hash.clone(),
    };

    let meta_path = self.meta_path(dir, key);
    let bin_path = self.bin_path(dir, key);
    let meta_tmp = meta_path.with_extension("tmp");
    let bin_tmp = bin_path.with_extension("tmp");

    // Write meta before data: a crash between the two renames leaves at
    // worst an orphan meta file, never orphan bytes with no sidecar.
    let Ok(meta_json) = serde_json::to_vec(&meta) else { return };
    if tokio::fs::write(&meta_tmp, &meta_json).await.is_err() {
      return;
    }
    if tokio::fs::rename(&meta_tmp, &meta_path).await.is_err() {
      let _ = tokio::fs::remove_file(&meta_tmp).await;
      return;
    }

    if tokio::fs::write(&bin_tmp, &content.data).await.is_err() {
      return;
    }
    if tokio::fs::rename(&bin_tmp, &bin_path).await.is_err() {
      let _ = tokio::fs::remove_file(&bin_tmp).await;
    }
  }

  /// Evicts by ascending weighted score until `current + incoming` fits.
  async fn make_room(&self, incoming: u64) {
    loop {
      let current = *self.current_size.lock().await;
      if current + incoming <= self.max_size_bytes {
        return;
      }

      let victim = {
        let index = self.index.lock().await;
        index
          .iter()
          .map(|(key, entry)| (key.clone(), eviction_score(&entry.content)))
          .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
          .map(|(key, _)| key)
      };

      let Some(key) = victim else { return }; // nothing left to evict
      self.evict_key(&key).await;
    }
  }

  async fn evict_key(&self, key: &str) {
    let removed = {
      let mut index = self.index.lock().await;
      index.remove(key)
    };
    let Some(entry) = removed else { return };
    *self.current_size.lock().await -= entry.content.content_length as u64;

    if entry.disk_backed {
      if let Some(dir) = self.disk_dir.clone() {
        let _ = tokio::fs::remove_file(self.bin_path(&dir, key)).await;
        let _ = tokio::fs::remove_file(self.meta_path(&dir, key)).await;
      }
    }
  }

  pub async fn invalidate(&self, tx_id: &str, path: &str) {
    self.evict_key(&cache_key(tx_id, path)).await;
  }

  /// Invalidates every cached path for `tx_id` (the `txId:` prefix wildcard).
  pub async fn invalidate_all_paths(&self, tx_id: &str) {
    let prefix = format!("{tx_id}:");
    let keys: Vec<String> = {
      let index = self.index.lock().await;
      index.keys().filter(|k| k.starts_with(&prefix)).cloned().collect()
    };
    for key in keys {
      self.evict_key(&key).await;
    }
  }

  pub async fn current_size(&self) -> u64 {
    *self.current_size.lock().await
  }

  pub async fn len(&self) -> usize {
    self.index.lock().await.len()
  }
}

/// `10 × log2(accessCount+1) + 100/(ageMinutes+1) − 0.5 × sizeMB`; higher is
/// "keep longer", so the minimum-scoring entry is evicted first.
fn eviction_score(content: &CachedContent) -> f64 {
  let access_term = 10.0 * ((content.access_count as f64) + 1.0).log2();
  let age_minutes = content
    .last_accessed
    .elapsed()
    .map(|d| d.as_secs_f64() / 60.0)
    .unwrap_or(0.0);
  let recency_term = 100.0 / (age_minutes + 1.0);
  let size_mb = content.content_length as f64 / (1024.0 * 1024.0);
  access_term + recency_term - 0.5 * size_mb
}

/// Cache-control and provenance headers for a response served from cache.
pub fn cache_response_headers(content: &CachedContent) -> Vec<(String, String)> {
  let mut headers = content.headers.clone();
  if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("cache-control")) {
    headers.push((
      "cache-control".to_string(),
      "public, max-age=31536000, immutable".to_string(),
    ));
  }
  headers.push(("x-wayfinder-cached".to_string(), "true".to_string()));
  let age_secs = content.verified_at.elapsed().map(|d| d.as_secs()).unwrap_or(0);
  headers.push(("x-wayfinder-cache-age".to_string(), age_secs.to_string()));
  headers
}

#[cfg(test)]
mod tests {
  use super::*;

  fn content(tx_id: &str, bytes: &[u8]) -> CachedContent {
    CachedContent {
      data: bytes::Bytes::copy_from_slice(bytes),
      content_type: Some("text/plain".to_string()),
      content_length: bytes.len(),
      headers: vec![],
      verified_at: SystemTime::now(),
      tx_id: tx_id.to_string(),
      hash: None,
      access_count: 0,
      last_accessed: SystemTime::now(),
    }
  }

  #[tokio::test]
  async fn stores_and_retrieves_in_memory() {
    let cache = ContentCache::new(None, 1024 * 1024, 1024 * 1024).await;
    cache.put("AAA", "", content("AAA", b"hello")).await;
    let got = cache.get("AAA", "").await.unwrap();
    assert_eq!(&got.data[..], b"hello");
  }

  #[tokio::test]
  async fn rejects_oversized_items() {
    let cache = ContentCache::new(None, 10, 5).await;
    cache.put("AAA", "", content("AAA", b"way too large")).await;
    assert!(cache.get("AAA", "").await.is_none());
  }

  #[tokio::test]
  async fn eviction_keeps_under_max_size() {
    let cache = ContentCache::new(None, 30, 30).await;
    cache.put("A", "", content("A", &[0u8; 15])).await;
    cache.put("B", "", content("B", &[0u8; 15])).await;
    cache.put("C", "", content("C", &[0u8; 15])).await;
    assert!(cache.current_size().await <= 30);
  }

  #[tokio::test]
  async fn invalidate_all_paths_removes_every_entry_for_tx_id() {
    let cache = ContentCache::new(None, 1024, 1024).await;
    cache.put("AAA", "/a", content("AAA", b"1")).await;
    cache.put("AAA", "/b", content("AAA", b"2")).await;
    cache.put("BBB", "", content("BBB", b"3")).await;

    cache.invalidate_all_paths("AAA").await;

    assert!(cache.get("AAA", "/a").await.is_none());
    assert!(cache.get("AAA", "/b").await.is_none());
    assert!(cache.get("BBB", "").await.is_some());
  }

  #[tokio::test]
  async fn disk_backed_round_trips_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ContentCache::new(Some(dir.path().to_path_buf()), 1024 * 1024, 1024 * 1024).await;
    cache.put("AAA", "", content("AAA", b"disk bytes")).await;

    let reopened = ContentCache::new(Some(dir.path().to_path_buf()), 1024 * 1024, 1024 * 1024).await;
    let got = reopened.get("AAA", "").await.unwrap();
    assert_eq!(&got.data[..], b"disk bytes");
  }

  #[tokio::test]
  async fn restart_cleans_up_orphan_meta_files() {
    let dir = tempfile::tempdir().unwrap();
    let meta = CacheEntryMeta {
      key: "AAA:".to_string(),
      content_type: None,
      content_length: 3,
      headers: vec![],
      verified_at_unix_ms: 0,
      tx_id: "AAA".to_string(),
      hash: None,
    };
    let hash = key_hash("AAA:");
    tokio::fs::write(dir.path().join(format!("{hash}.meta.json")), serde_json::to_vec(&meta).unwrap())
      .await
      .unwrap();

    let cache = ContentCache::new(Some(dir.path().to_path_buf()), 1024, 1024).await;
    assert_eq!(cache.len().await, 0);
    assert!(!dir.path().join(format!("{hash}.meta.json")).exists());
  }

  #[test]
  fn response_headers_include_provenance() {
    let c = content("AAA", b"x");
    let headers = cache_response_headers(&c);
    assert!(headers.iter().any(|(k, v)| k == "x-wayfinder-cached" && v == "true"));
    assert!(headers.iter().any(|(k, _)| k == "x-wayfinder-cache-age"));
  }
}
