//! Temperature store: rolling window of latency/success samples per
//! gateway, scored for weighted selection.
//!
//! A gateway's score combines a latency penalty with a success bonus;
//! selection draws from the cumulative weight of the candidate set, falling
//! back to a uniform pick when samples are too sparse to trust.

use dashmap::DashMap;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{Origin, TemperatureSample};

const DEFAULT_MAX_SAMPLES: usize = 64;
const DEFAULT_WINDOW_MS: u64 = 5 * 60_000;
const MIN_SAMPLES_FOR_SCORE: usize = 3;
const NEUTRAL_SCORE: f64 = 1.0;

pub struct TemperatureConfig {
  pub window_ms: u64,
  pub max_samples: usize,
}

impl Default for TemperatureConfig {
  fn default() -> Self {
    Self {
      window_ms: DEFAULT_WINDOW_MS,
      max_samples: DEFAULT_MAX_SAMPLES,
    }
  }
}

struct Window {
  samples: VecDeque<TemperatureSample>,
}

pub struct TemperatureStore {
  windows: DashMap<Origin, Mutex<Window>>,
  config: TemperatureConfig,
}

fn now_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

impl TemperatureStore {
  pub fn new(config: TemperatureConfig) -> Self {
    Self {
      windows: DashMap::new(),
      config,
    }
  }

  pub fn record_success(&self, origin: &str, latency_ms: u32) {
    self.push(
      origin,
      TemperatureSample {
        timestamp_ms: now_ms(),
        latency_ms,
        success: true,
      },
    );
  }

  pub fn record_failure(&self, origin: &str) {
    self.push(
      origin,
      TemperatureSample {
        timestamp_ms: now_ms(),
        latency_ms: 0,
        success: false,
      },
    );
  }

  fn push(&self, origin: &str, sample: TemperatureSample) {
    let entry = self
      .windows
      .entry(origin.to_string())
      .or_insert_with(|| Mutex::new(Window { samples: VecDeque::new() }));
    let mut window = entry.lock().unwrap();
    window.samples.push_back(sample);
    while window.samples.len() > self.config.max_samples {
      window.samples.pop_front();
    }
    self.evict_expired(&mut window);
  }

  fn evict_expired(&self, window: &mut Window) {
    let cutoff = now_ms().saturating_sub(self.config.window_ms);
    while window
      .samples
      .front()
      .map(|s| s.timestamp_ms < cutoff)
      .unwrap_or(false)
    {
      window.samples.pop_front();
    }
  }

  /// `score = popularity_boost(successRate) / log(avgLatency + 1)`, monotone
  /// increasing in success rate and decreasing in latency. New or
  /// under-sampled gateways get a neutral default so they keep getting
  /// picked instead of being starved out before they have enough samples.
  pub fn score(&self, origin: &str) -> f64 {
    let Some(entry) = self.windows.get(origin) else {
      return NEUTRAL_SCORE;
    };
    let window = entry.lock().unwrap();
    if window.samples.len() < MIN_SAMPLES_FOR_SCORE {
      return NEUTRAL_SCORE;
    }

    let total = window.samples.len() as f64;
    let successes = window.samples.iter().filter(|s| s.success).count() as f64;
    let success_rate = successes / total;

    let latencies: Vec<f64> = window
      .samples
      .iter()
      .filter(|s| s.success)
      .map(|s| s.latency_ms as f64)
      .collect();
    let avg_latency = if latencies.is_empty() {
      0.0
    } else {
      latencies.iter().sum::<f64>() / latencies.len() as f64
    };

    let popularity_boost = 0.2 + success_rate.powf(2.0);
    popularity_boost / (avg_latency + 1.0).ln().max(0.001)
  }

  pub fn get_all_scores(&self, origins: &[Origin]) -> Vec<(Origin, f64)> {
    origins
      .iter()
      .map(|origin| (origin.clone(), self.score(origin)))
      .collect()
  }

  /// Weighted random pick among `candidates`. Falls back to a uniform pick
  /// when every candidate scores zero (all unknown/unscored).
  pub fn select_weighted(&self, candidates: &[Origin]) -> Option<Origin> {
    if candidates.is_empty() {
      return None;
    }

    let scores = self.get_all_scores(candidates);
    let total: f64 = scores.iter().map(|(_, s)| s).sum();

    if total <= 0.0 {
      let index = rand::thread_rng().gen_range(0..candidates.len());
      return Some(candidates[index].clone());
    }

    let mut draw = rand::thread_rng().gen_range(0.0..total);
    for (origin, score) in &scores {
      if draw < *score {
        return Some(origin.clone());
      }
      draw -= score;
    }
    scores.last().map(|(o, _)| o.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn neutral_score_for_unknown_gateway() {
    let store = TemperatureStore::new(TemperatureConfig::default());
    assert_eq!(store.score("https://new.example"), NEUTRAL_SCORE);
  }

  #[test]
  fn successful_low_latency_scores_higher_than_failures() {
    let store = TemperatureStore::new(TemperatureConfig::default());
    for _ in 0..5 {
      store.record_success("https://fast.example", 10);
    }
    for _ in 0..5 {
      store.record_failure("https://slow.example");
    }
    assert!(store.score("https://fast.example") > store.score("https://slow.example"));
  }

  #[test]
  fn select_weighted_picks_from_candidates() {
    let store = TemperatureStore::new(TemperatureConfig::default());
    let candidates = vec!["https://a.example".to_string(), "https://b.example".to_string()];
    let picked = store.select_weighted(&candidates).unwrap();
    assert!(candidates.contains(&picked));
  }

  #[test]
  fn select_weighted_empty_is_none() {
    let store = TemperatureStore::new(TemperatureConfig::default());
    assert!(store.select_weighted(&[]).is_none());
  }
}
