//! Leadership metrics
//!
//! The only metric this control plane exports is whether the process
//! currently believes itself leader. It is written through the
//! [`LeaderMetrics`] seam by the election transition handler alone.

use std::sync::atomic::{AtomicI64, Ordering};

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Gauge, Meter};

/// Global meter for operator metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("mpi-operator"));

/// Gauge: 1 while this process leads, 0 otherwise
pub static IS_LEADER: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("mpi_operator_is_leader")
        .with_description("Is this client the leader of this mpi-operator client set?")
        .build()
});

/// Recorder for the leadership gauge
pub trait LeaderMetrics: Send + Sync {
    /// Record whether this process leads
    fn set_leader(&self, leading: bool);
}

/// Records to the OpenTelemetry `mpi_operator_is_leader` gauge
#[derive(Clone, Copy, Debug, Default)]
pub struct OtelLeaderMetrics;

impl LeaderMetrics for OtelLeaderMetrics {
    fn set_leader(&self, leading: bool) {
        IS_LEADER.record(i64::from(leading), &[]);
    }
}

/// Keeps the last recorded value in memory
#[derive(Debug, Default)]
pub struct InMemoryLeaderMetrics {
    value: AtomicI64,
    updates: AtomicI64,
}

impl InMemoryLeaderMetrics {
    /// Last recorded gauge value (0 before any update)
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Number of recorded updates
    pub fn updates(&self) -> i64 {
        self.updates.load(Ordering::SeqCst)
    }
}

impl LeaderMetrics for InMemoryLeaderMetrics {
    fn set_leader(&self, leading: bool) {
        self.value.store(i64::from(leading), Ordering::SeqCst);
        self.updates.fetch_add(1, Ordering::SeqCst);
    }
}
