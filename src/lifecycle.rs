//! Lifecycle controller: in-flight request tracking, graceful drain on
//! shutdown, and supervision of periodic background tasks.
//!
//! On shutdown, periodic tasks are cancelled via a shared
//! `tokio_util::sync::CancellationToken` and the controller waits for the
//! in-flight request count to reach zero, up to a bounded timeout, before
//! the process exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Lifecycle {
  in_flight: AtomicUsize,
  draining: std::sync::atomic::AtomicBool,
  cancellation: CancellationToken,
}

/// Decrements the in-flight counter when dropped, regardless of how the
/// request handler returns (success, error, or panic unwind).
pub struct RequestGuard<'a> {
  lifecycle: &'a Lifecycle,
}

impl Drop for RequestGuard<'_> {
  fn drop(&mut self) {
    self.lifecycle.in_flight.fetch_sub(1, Ordering::SeqCst);
  }
}

impl Lifecycle {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      in_flight: AtomicUsize::new(0),
      draining: std::sync::atomic::AtomicBool::new(false),
      cancellation: CancellationToken::new(),
    })
  }

  /// Registers a new in-flight request, or returns `None` if the server is
  /// already draining (the caller should respond 503).
  pub fn begin_request(&self) -> Option<RequestGuard<'_>> {
    if self.draining.load(Ordering::SeqCst) {
      return None;
    }
    self.in_flight.fetch_add(1, Ordering::SeqCst);
    Some(RequestGuard { lifecycle: self })
  }

  pub fn in_flight_count(&self) -> usize {
    self.in_flight.load(Ordering::SeqCst)
  }

  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancellation.clone()
  }

  /// Spawns `task` on an interval, stopping cleanly once shutdown begins.
  pub fn spawn_periodic<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, mut task: F)
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
  {
    let cancellation = self.cancellation.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      loop {
        tokio::select! {
          _ = interval.tick() => task().await,
          _ = cancellation.cancelled() => {
            info!(task = name, "periodic task stopped for shutdown");
            return;
          }
        }
      }
    });
  }

  /// Stops accepting new requests, waits up to `drain_timeout` for in-flight
  /// requests to finish, then cancels periodic tasks either way. Returns
  /// `true` if every request drained cleanly, `false` if the timeout forced
  /// a cutoff with requests still outstanding.
  pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
    self.draining.store(true, Ordering::SeqCst);
    info!(in_flight = self.in_flight_count(), "drain started");

    let deadline = Instant::now() + drain_timeout;
    let drained = loop {
      if self.in_flight_count() == 0 {
        break true;
      }
      if Instant::now() >= deadline {
        break false;
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    };

    if !drained {
      warn!(
        in_flight = self.in_flight_count(),
        "drain timeout elapsed with requests still in flight; forcing shutdown"
      );
    } else {
      info!("drain completed with no requests in flight");
    }

    self.cancellation.cancel();
    drained
  }
}
