//! Leader election health watchdog
//!
//! Answers the orchestrator's liveness probe purely from election timing,
//! never from workload health. A leader whose last successful renewal is
//! older than `lease_duration + grace` has stalled (or is partitioned)
//! and should be restarted; by then another replica may already lead.
//!
//! A replica that does not lead is healthy while its election loop keeps
//! completing round trips to the lock backend, and for a bounded startup
//! grace period before its first one.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Error;

/// Default port for the health endpoint
pub const DEFAULT_HEALTHZ_PORT: u16 = 8080;

/// Time beyond lease expiry during which checks still report healthy
pub const DEFAULT_HEALTH_GRACE: Duration = Duration::from_secs(20);

/// Liveness rule: healthy iff `now - last_renew <= lease_duration + grace`
pub fn is_healthy(
    now: Instant,
    last_renew: Instant,
    lease_duration: Duration,
    grace: Duration,
) -> bool {
    now.saturating_duration_since(last_renew) <= lease_duration + grace
}

/// Why the probe failed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    /// Leading, but the last renewal is too old
    #[error("last lease renewal was {elapsed:?} ago, allowed {allowed:?}")]
    LeaseStale {
        /// Time since the last successful renewal
        elapsed: Duration,
        /// `lease_duration + grace`
        allowed: Duration,
    },

    /// Not leading and the election loop has made no progress
    #[error("no election progress for {elapsed:?}, allowed {allowed:?}")]
    NoProgress {
        /// Time since the last round trip (or since start)
        elapsed: Duration,
        /// Threshold that was exceeded
        allowed: Duration,
    },
}

#[derive(Debug, Default)]
struct Timestamps {
    leading: bool,
    last_renewal: Option<Instant>,
    last_observation: Option<Instant>,
}

/// Election liveness tracker behind `/healthz`
#[derive(Debug)]
pub struct HealthWatchdog {
    lease_duration: Duration,
    grace: Duration,
    startup_grace: Duration,
    started_at: Instant,
    timestamps: Mutex<Timestamps>,
}

impl HealthWatchdog {
    /// Create a watchdog; the startup grace defaults to `lease_duration + grace`
    pub fn new(lease_duration: Duration, grace: Duration) -> Self {
        Self {
            lease_duration,
            grace,
            startup_grace: lease_duration + grace,
            started_at: Instant::now(),
            timestamps: Mutex::new(Timestamps::default()),
        }
    }

    /// Override how long a replica may run before its first election round trip
    pub fn with_startup_grace(mut self, startup_grace: Duration) -> Self {
        self.startup_grace = startup_grace;
        self
    }

    /// Record a successful acquisition or renewal
    pub fn record_renewal(&self) {
        let now = Instant::now();
        let mut ts = self.lock();
        ts.leading = true;
        ts.last_renewal = Some(now);
        ts.last_observation = Some(now);
    }

    /// Record a completed round trip to the lock backend while not leading
    pub fn record_observation(&self) {
        self.lock().last_observation = Some(Instant::now());
    }

    /// Probe at the current instant
    pub fn check(&self) -> Result<(), HealthError> {
        self.check_at(Instant::now())
    }

    /// Probe at `now`
    pub fn check_at(&self, now: Instant) -> Result<(), HealthError> {
        let allowed = self.lease_duration + self.grace;
        let ts = self.lock();

        if ts.leading {
            let last = ts.last_renewal.unwrap_or(self.started_at);
            if is_healthy(now, last, self.lease_duration, self.grace) {
                return Ok(());
            }
            return Err(HealthError::LeaseStale {
                elapsed: now.saturating_duration_since(last),
                allowed,
            });
        }

        if let Some(observed) = ts.last_observation {
            if is_healthy(now, observed, self.lease_duration, self.grace) {
                return Ok(());
            }
        }

        let since_start = now.saturating_duration_since(self.started_at);
        if since_start <= self.startup_grace {
            return Ok(());
        }

        let elapsed = ts
            .last_observation
            .map(|o| now.saturating_duration_since(o))
            .unwrap_or(since_start);
        Err(HealthError::NoProgress {
            elapsed,
            allowed: if ts.last_observation.is_some() {
                allowed
            } else {
                self.startup_grace
            },
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timestamps> {
        self.timestamps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build the health router
pub fn health_routes(watchdog: Arc<HealthWatchdog>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(watchdog)
}

async fn healthz(State(watchdog): State<Arc<HealthWatchdog>>) -> (StatusCode, String) {
    match watchdog.check() {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("[-]leaderElection failed: {}", e),
        ),
    }
}

/// Serve `/healthz` on `port` until `shutdown` fires
pub async fn serve_health(
    port: u16,
    watchdog: Arc<HealthWatchdog>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        Error::internal_with_context("healthz", format!("failed to bind {}: {}", addr, e))
    })?;
    info!(addr = %addr, "Start listening for health checks");

    axum::serve(listener, health_routes(watchdog))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::internal_with_context("healthz", format!("server error: {}", e)))
}
