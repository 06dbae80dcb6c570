//! Structured audit trail for request lifecycle, verification outcomes, and
//! moderation actions.
//!
//! Events are written through `tracing` and also buffered in memory, with a
//! background task periodically flushing the buffer so callers never block
//! on I/O to record an event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
  RequestReceived,
  RequestCompleted,
  RequestFailed,

  VerificationSucceeded,
  VerificationFailed,
  ConsensusFailed,
  ResolutionTimedOut,

  GatewayMarkedUnhealthy,
  CircuitOpened,

  CacheHit,
  CacheMiss,
  CacheEviction,

  ContentBlocked,
  ModerationBlockAdded,
  ModerationBlockRemoved,

  GatewayStartup,
  GatewayShutdown,
  InternalError,
}

impl AuditEventType {
  pub fn severity(&self) -> AuditSeverity {
    match self {
      AuditEventType::VerificationFailed | AuditEventType::ContentBlocked => AuditSeverity::High,
      AuditEventType::ConsensusFailed
      | AuditEventType::ResolutionTimedOut
      | AuditEventType::RequestFailed
      | AuditEventType::CircuitOpened => AuditSeverity::Medium,
      AuditEventType::GatewayMarkedUnhealthy | AuditEventType::InternalError => AuditSeverity::Low,
      _ => AuditSeverity::Info,
    }
  }

  pub fn is_immediate(&self) -> bool {
    matches!(self.severity(), AuditSeverity::High | AuditSeverity::Medium)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
  High,
  Medium,
  Low,
  Info,
}

impl std::fmt::Display for AuditSeverity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      AuditSeverity::High => write!(f, "high"),
      AuditSeverity::Medium => write!(f, "medium"),
      AuditSeverity::Low => write!(f, "low"),
      AuditSeverity::Info => write!(f, "info"),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
  pub event_id: String,
  pub timestamp: DateTime<Utc>,
  pub event_type: AuditEventType,
  pub severity: AuditSeverity,

  pub request_id: String,
  pub method: String,
  pub path: String,
  pub tx_id: Option<String>,
  pub gateway_origin: Option<String>,
  pub client_ip: Option<String>,

  pub status_code: Option<u16>,
  pub response_time_ms: Option<u64>,
  pub verified: Option<bool>,
  pub cached: Option<bool>,

  pub details: HashMap<String, serde_json::Value>,
  pub error_message: Option<String>,

  pub gateway_version: String,
  pub gateway_instance: String,
}

impl AuditEvent {
  pub fn new(event_type: AuditEventType, request_id: String) -> Self {
    let severity = event_type.severity();
    Self {
      event_id: Uuid::new_v4().to_string(),
      timestamp: Utc::now(),
      event_type,
      severity,
      request_id,
      method: String::new(),
      path: String::new(),
      tx_id: None,
      gateway_origin: None,
      client_ip: None,
      status_code: None,
      response_time_ms: None,
      verified: None,
      cached: None,
      details: HashMap::new(),
      error_message: None,
      gateway_version: env!("CARGO_PKG_VERSION").to_string(),
      gateway_instance: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
    }
  }

  pub fn with_request(mut self, method: String, path: String, client_ip: Option<String>) -> Self {
    self.method = method;
    self.path = path;
    self.client_ip = client_ip;
    self
  }

  pub fn with_content(mut self, tx_id: Option<String>, gateway_origin: Option<String>) -> Self {
    self.tx_id = tx_id;
    self.gateway_origin = gateway_origin;
    self
  }

  pub fn with_response(mut self, status: u16, response_time: Duration) -> Self {
    self.status_code = Some(status);
    self.response_time_ms = Some(response_time.as_millis() as u64);
    self
  }

  pub fn with_verification(mut self, verified: bool, cached: bool) -> Self {
    self.verified = Some(verified);
    self.cached = Some(cached);
    self
  }

  pub fn with_error(mut self, message: String) -> Self {
    self.error_message = Some(message);
    self
  }

  pub fn with_detail<T: Serialize>(mut self, key: &str, value: T) -> Self {
    if let Ok(json_value) = serde_json::to_value(value) {
      self.details.insert(key.to_string(), json_value);
    }
    self
  }

  pub fn log_level(&self) -> tracing::Level {
    match self.severity {
      AuditSeverity::High => tracing::Level::WARN,
      AuditSeverity::Medium => tracing::Level::WARN,
      AuditSeverity::Low => tracing::Level::INFO,
      AuditSeverity::Info => tracing::Level::INFO,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
  pub enabled: bool,
  pub buffer_size: usize,
  pub flush_interval_secs: u64,
  pub excluded_paths: Vec<String>,
}

impl Default for AuditConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      buffer_size: 10_000,
      flush_interval_secs: 60,
      excluded_paths: vec!["/wayfinder/health".to_string(), "/wayfinder/metrics".to_string()],
    }
  }
}

pub struct GatewayAuditLogger {
  config: AuditConfig,
  event_buffer: Arc<tokio::sync::Mutex<Vec<AuditEvent>>>,
}

impl GatewayAuditLogger {
  pub fn new(config: AuditConfig) -> Self {
    let logger = Self {
      event_buffer: Arc::new(tokio::sync::Mutex::new(Vec::new())),
      config: config.clone(),
    };
    if config.enabled {
      logger.start_flush_task();
    }
    logger
  }

  pub async fn log_event(&self, event: AuditEvent) {
    if !self.config.enabled {
      return;
    }
    if self.config.excluded_paths.iter().any(|path| event.path.starts_with(path)) {
      return;
    }

    if event.event_type.is_immediate() {
      self.write_event(&event);
    }

    let mut buffer = self.event_buffer.lock().await;
    buffer.push(event);
    if buffer.len() >= self.config.buffer_size {
      self.flush_buffer(&mut buffer);
    }
  }

  pub async fn log_request_completed(
    &self,
    request_id: String,
    method: String,
    path: String,
    status: u16,
    response_time: Duration,
    tx_id: Option<String>,
    gateway_origin: Option<String>,
    verified: bool,
    cached: bool,
  ) {
    let event = AuditEvent::new(AuditEventType::RequestCompleted, request_id)
      .with_request(method, path, None)
      .with_content(tx_id, gateway_origin)
      .with_response(status, response_time)
      .with_verification(verified, cached);
    self.log_event(event).await;
  }

  pub async fn log_verification_failure(&self, request_id: String, tx_id: String, gateway_origin: String, reason: String) {
    let event = AuditEvent::new(AuditEventType::VerificationFailed, request_id)
      .with_content(Some(tx_id), Some(gateway_origin))
      .with_error(reason);
    self.log_event(event).await;
  }

  pub async fn log_consensus_failure(&self, request_id: String, name: String, detail: String) {
    let event = AuditEvent::new(AuditEventType::ConsensusFailed, request_id)
      .with_detail("name", name)
      .with_error(detail);
    self.log_event(event).await;
  }

  pub async fn log_content_blocked(&self, request_id: String, tx_id: Option<String>, reason: String) {
    let event = AuditEvent::new(AuditEventType::ContentBlocked, request_id)
      .with_content(tx_id, None)
      .with_error(reason);
    self.log_event(event).await;
  }

  pub async fn log_moderation_action(&self, request_id: String, added: bool, value: String, admin: String) {
    let event_type = if added { AuditEventType::ModerationBlockAdded } else { AuditEventType::ModerationBlockRemoved };
    let event = AuditEvent::new(event_type, request_id)
      .with_detail("value", value)
      .with_detail("admin", admin);
    self.log_event(event).await;
  }

  fn write_event(&self, event: &AuditEvent) {
    match event.log_level() {
      tracing::Level::WARN => {
        warn!(
          event_id = %event.event_id,
          event_type = ?event.event_type,
          severity = ?event.severity,
          request_id = %event.request_id,
          tx_id = ?event.tx_id,
          gateway_origin = ?event.gateway_origin,
          status_code = ?event.status_code,
          response_time_ms = ?event.response_time_ms,
          error_message = ?event.error_message,
          "audit event"
        );
      }
      _ => {
        info!(
          event_id = %event.event_id,
          event_type = ?event.event_type,
          request_id = %event.request_id,
          tx_id = ?event.tx_id,
          status_code = ?event.status_code,
          response_time_ms = ?event.response_time_ms,
          "audit event"
        );
      }
    }
  }

  fn start_flush_task(&self) {
    let buffer = Arc::clone(&self.event_buffer);
    let flush_interval = Duration::from_secs(self.config.flush_interval_secs);

    tokio::spawn(async move {
      let mut interval = tokio::time::interval(flush_interval);
      loop {
        interval.tick().await;
        let mut buffer_guard = buffer.lock().await;
        buffer_guard.clear();
      }
    });
  }

  fn flush_buffer(&self, buffer: &mut Vec<AuditEvent>) {
    for event in buffer.iter() {
      self.write_event(event);
    }
    buffer.clear();
  }

  pub async fn get_audit_stats(&self) -> AuditStats {
    let buffer_size = self.event_buffer.lock().await.len();
    AuditStats {
      events_buffered: buffer_size as u64,
      buffer_capacity: self.config.buffer_size as u64,
      flush_interval_secs: self.config.flush_interval_secs,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditStats {
  pub events_buffered: u64,
  pub buffer_capacity: u64,
  pub flush_interval_secs: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn event_severity_matches_taxonomy() {
    assert_eq!(AuditEventType::VerificationFailed.severity(), AuditSeverity::High);
    assert_eq!(AuditEventType::ConsensusFailed.severity(), AuditSeverity::Medium);
    assert_eq!(AuditEventType::RequestCompleted.severity(), AuditSeverity::Info);
  }

  #[tokio::test]
  async fn buffers_events_and_reports_stats() {
    let logger = GatewayAuditLogger::new(AuditConfig::default());
    logger
      .log_request_completed(
        "req-1".to_string(),
        "GET".to_string(),
        "/AAAA".to_string(),
        200,
        Duration::from_millis(12),
        Some("AAAA".to_string()),
        Some("https://g1.example".to_string()),
        true,
        false,
      )
      .await;

    let stats = logger.get_audit_stats().await;
    assert_eq!(stats.events_buffered, 1);
  }

  #[tokio::test]
  async fn excluded_paths_are_not_buffered() {
    let logger = GatewayAuditLogger::new(AuditConfig::default());
    let event = AuditEvent::new(AuditEventType::RequestCompleted, "req-2".to_string())
      .with_request("GET".to_string(), "/wayfinder/health".to_string(), None);
    logger.log_event(event).await;

    let stats = logger.get_audit_stats().await;
    assert_eq!(stats.events_buffered, 0);
  }
}
