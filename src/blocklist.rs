//! In-process blocklist store: transaction IDs and ArNS names rejected
//! before any fetch is attempted.
//!
//! Persists to disk with a write-tmp-then-rename so a crash mid-write never
//! leaves a truncated blocklist behind.

use std::collections::HashSet;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::types::{BlocklistEntry, BlocklistEntryType, BlocklistFile};

const BLOCKLIST_VERSION: u32 = 1;

struct State {
  arns_set: HashSet<String>,
  tx_id_set: HashSet<String>,
  entries: Vec<BlocklistEntry>,
}

pub struct BlocklistStore {
  state: RwLock<State>,
  path: Option<PathBuf>,
}

impl BlocklistStore {
  pub fn empty(path: Option<PathBuf>) -> Self {
    Self {
      state: RwLock::new(State { arns_set: HashSet::new(), tx_id_set: HashSet::new(), entries: Vec::new() }),
      path,
    }
  }

  pub async fn load(path: Option<PathBuf>) -> Self {
    let store = Self::empty(path);
    store.reload_from_disk().await;
    store
  }

  pub async fn reload_from_disk(&self) {
    let Some(path) = &self.path else { return };
    let Ok(raw) = tokio::fs::read_to_string(path).await else { return };
    let Ok(file) = serde_json::from_str::<BlocklistFile>(&raw) else { return };

    let mut state = self.state.write().await;
    state.arns_set.clear();
    state.tx_id_set.clear();
    for entry in &file.entries {
      match entry.entry_type {
        BlocklistEntryType::Arns => {
          state.arns_set.insert(entry.value.clone());
        }
        BlocklistEntryType::Txid => {
          state.tx_id_set.insert(entry.value.clone());
        }
      }
    }
    state.entries = file.entries;
  }

  pub async fn is_blocked_arns(&self, name: &str) -> bool {
    self.state.read().await.arns_set.contains(name)
  }

  pub async fn is_blocked_txid(&self, tx_id: &str) -> bool {
    self.state.read().await.tx_id_set.contains(tx_id)
  }

  pub async fn block(&self, entry: BlocklistEntry) -> Result<(), std::io::Error> {
    {
      let mut state = self.state.write().await;
      match entry.entry_type {
        BlocklistEntryType::Arns => {
          state.arns_set.insert(entry.value.clone());
        }
        BlocklistEntryType::Txid => {
          state.tx_id_set.insert(entry.value.clone());
        }
      }
      state.entries.push(entry);
    }
    self.persist().await
  }

  pub async fn unblock(&self, entry_type: BlocklistEntryType, value: &str) -> Result<(), std::io::Error> {
    {
      let mut state = self.state.write().await;
      match entry_type {
        BlocklistEntryType::Arns => {
          state.arns_set.remove(value);
        }
        BlocklistEntryType::Txid => {
          state.tx_id_set.remove(value);
        }
      }
      state.entries.retain(|e| !(e.entry_type == entry_type && e.value == value));
    }
    self.persist().await
  }

  pub async fn list(&self) -> Vec<BlocklistEntry> {
    self.state.read().await.entries.clone()
  }

  async fn persist(&self) -> Result<(), std::io::Error> {
    let Some(path) = &self.path else { return Ok(()) };
    let entries = self.state.read().await.entries.clone();
    let file = BlocklistFile {
      version: BLOCKLIST_VERSION,
      updated_at: chrono::Utc::now(),
      entries,
    };
    let json = serde_json::to_vec_pretty(&file)?;

    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &json).await?;
    tokio::fs::rename(&tmp_path, path).await
  }
}
