//! Typed error taxonomy for the gateway request pipeline.
//!
//! Every variant carries the HTTP status the external interface promises and
//! renders to the `{ error, message, code? }` JSON body shape via
//! `IntoResponse`. Bootstrap-time failures (config load, listener bind) are
//! not part of this taxonomy; those stay `anyhow::Error` at the `main`
//! boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
  #[error("malformed request: {0}")]
  Classification(String),

  #[error("no healthy gateways available")]
  NoHealthyGateways,

  #[error("upstream gateway error ({status}): {message}")]
  Gateway { status: u16, message: String },

  #[error("ArNS consensus failed for '{name}': {detail}")]
  Consensus { name: String, detail: String },

  #[error("ArNS resolution timed out for '{name}' after {responses} of {required} required responses")]
  ResolutionTimeout {
    name: String,
    responses: usize,
    required: usize,
  },

  #[error("verification failed: {0}")]
  Verification(String),

  #[error("manifest error: {0}")]
  Manifest(String),

  #[error("path '{path}' not found in manifest {manifest_tx_id}")]
  ManifestPathNotFound {
    manifest_tx_id: String,
    path: String,
  },

  #[error("content is blocked: {reason}")]
  BlockedContent { reason: String },

  #[error("request outside permitted root host")]
  RestrictionMode,

  #[error("retry budget exhausted after {attempts} attempt(s): {}", summarize_attempts(.failures))]
  RetryExhausted {
    attempts: usize,
    failures: Vec<(String, String)>,
  },

  #[error("internal error: {0}")]
  Internal(String),
}

fn summarize_attempts(failures: &[(String, String)]) -> String {
  failures
    .iter()
    .map(|(gateway, err)| format!("{gateway}: {err}"))
    .collect::<Vec<_>>()
    .join("; ")
}

impl GatewayError {
  pub fn status_code(&self) -> StatusCode {
    match self {
      GatewayError::Classification(_) => StatusCode::BAD_REQUEST,
      GatewayError::NoHealthyGateways => StatusCode::SERVICE_UNAVAILABLE,
      GatewayError::Gateway { status, .. } => {
        StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
      }
      GatewayError::Consensus { .. } => StatusCode::BAD_GATEWAY,
      GatewayError::ResolutionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
      GatewayError::Verification(_) => StatusCode::BAD_GATEWAY,
      GatewayError::Manifest(_) => StatusCode::BAD_GATEWAY,
      GatewayError::ManifestPathNotFound { .. } => StatusCode::NOT_FOUND,
      GatewayError::BlockedContent { .. } => StatusCode::FORBIDDEN,
      GatewayError::RestrictionMode => StatusCode::NOT_FOUND,
      GatewayError::RetryExhausted { .. } => StatusCode::BAD_GATEWAY,
      GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  /// Short machine-readable code, surfaced as the optional `code` field.
  pub fn code(&self) -> &'static str {
    match self {
      GatewayError::Classification(_) => "classification_error",
      GatewayError::NoHealthyGateways => "no_healthy_gateways",
      GatewayError::Gateway { .. } => "gateway_error",
      GatewayError::Consensus { .. } => "consensus_error",
      GatewayError::ResolutionTimeout { .. } => "resolution_timeout",
      GatewayError::Verification(_) => "verification_error",
      GatewayError::Manifest(_) => "manifest_error",
      GatewayError::ManifestPathNotFound { .. } => "manifest_path_not_found",
      GatewayError::BlockedContent { .. } => "content_moderated",
      GatewayError::RestrictionMode => "restriction_mode",
      GatewayError::RetryExhausted { .. } => "retry_exhausted",
      GatewayError::Internal(_) => "internal_error",
    }
  }

  /// Verification faults are weighted more heavily against a gateway's
  /// health than plain availability faults.
  pub fn is_adversarial(&self) -> bool {
    matches!(self, GatewayError::Verification(_))
  }

  /// Consensus and manifest faults are terminal for the request: no gateway
  /// exclusion/retry makes sense since both come from trust-anchor quorums.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      GatewayError::Consensus { .. }
        | GatewayError::ResolutionTimeout { .. }
        | GatewayError::ManifestPathNotFound { .. }
        | GatewayError::BlockedContent { .. }
        | GatewayError::RestrictionMode
    )
  }
}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
  message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  code: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  detail: Option<HashMap<String, String>>,
}

impl IntoResponse for GatewayError {
  fn into_response(self) -> Response {
    let status = self.status_code();
    let code = Some(self.code().to_string());

    let detail = match &self {
      GatewayError::Consensus { detail, .. } => {
        let mut map = HashMap::new();
        map.insert("observed".to_string(), detail.clone());
        Some(map)
      }
      _ => None,
    };

    let body = ErrorBody {
      error: self.code().to_string(),
      message: self.to_string(),
      code,
      detail,
    };

    (status, Json(body)).into_response()
  }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
