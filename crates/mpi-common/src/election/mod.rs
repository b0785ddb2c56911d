//! Leader election over a conditionally-updatable lock record
//!
//! Exactly one candidate at a time holds the lock record and is allowed
//! to run the controller. Candidates never talk to each other; the lock
//! backend's compare-and-swap is the only synchronization.
//!
//! # Timing
//!
//! - `lease_duration`: how long a non-renewed claim stays valid. A claim
//!   expires this long after the renew time written into the record, and
//!   never later than this long after a waiting candidate first read that
//!   renewal. Waiting candidates take over only strictly after expiry and
//!   wake up for it instead of waiting out a full retry.
//! - `renew_deadline`: how long the leader keeps retrying a renewal
//!   before it must consider itself deposed.
//! - `retry_period`: pause between acquisition attempts and between
//!   renewals.

mod clock;
mod coordinator;
mod lock;
pub mod memory;

use std::time::Duration;

pub use clock::WallClock;
pub use coordinator::LeaseCoordinator;
pub use lock::{LeaseLock, LockBackend, LockError, LockName, LockRecord, VersionedRecord};
pub use memory::MemoryLock;

#[cfg(test)]
pub use lock::MockLockBackend;

use crate::Error;

/// Default time a claim stays valid without renewal
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
/// Default time a leader may spend failing to renew before stepping down
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(5);
/// Default wait between acquisition attempts
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(3);
/// Acquisition retries wait up to this factor of `retry_period` extra
pub const JITTER_FACTOR: f64 = 1.2;

/// Election timing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectionConfig {
    /// Maximum validity of a claim without renewal
    pub lease_duration: Duration,
    /// Maximum time for a renewal to succeed
    pub renew_deadline: Duration,
    /// Wait between attempts
    pub retry_period: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }
}

impl ElectionConfig {
    /// Check the timing invariants
    ///
    /// `renew_deadline < lease_duration` keeps a deposed leader from
    /// outliving its lease; `retry_period` (with jitter) must fit inside
    /// `renew_deadline` so a renewal gets more than one attempt.
    pub fn validate(&self) -> Result<(), Error> {
        if self.retry_period.is_zero() {
            return Err(Error::config("retry period must be greater than zero"));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(Error::config(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.retry_period >= self.renew_deadline
            || self.retry_period.mul_f64(JITTER_FACTOR) >= self.renew_deadline
        {
            return Err(Error::config(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?}) times {}",
                self.renew_deadline, self.retry_period, JITTER_FACTOR
            )));
        }
        Ok(())
    }
}

/// Election state of this candidate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionState {
    /// Not started
    Idle,
    /// Trying to obtain the lock record
    Acquiring,
    /// Holding the lock record
    Leading,
    /// Holding the lock record, renewal in flight
    Renewing,
    /// Stopped; terminal for this process
    Relinquished,
}

impl ElectionState {
    /// Returns true while this candidate holds leadership
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionState::Leading | ElectionState::Renewing)
    }
}

/// Why a leader stopped leading
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// No renewal succeeded within the renew deadline, or another
    /// holder was observed
    RenewFailed,
    /// The stop signal fired
    Cancelled,
}

/// Transition notifications emitted by the coordinator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderEvent {
    /// Election loop started
    Acquiring,
    /// This candidate now holds the lock record
    StartedLeading,
    /// Another candidate was observed holding the lock record
    NewLeader(String),
    /// This candidate no longer holds the lock record
    StoppedLeading(StopReason),
}

/// How the election loop ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Stopped by the stop signal; if it was leading, it stopped renewing
    Cancelled,
    /// Leadership was held and lost
    Lost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timing_is_valid() {
        ElectionConfig::default().validate().unwrap();
    }

    #[test]
    fn renew_deadline_must_be_below_lease_duration() {
        let config = ElectionConfig {
            lease_duration: Duration::from_secs(5),
            renew_deadline: Duration::from_secs(5),
            retry_period: Duration::from_secs(1),
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn retry_period_with_jitter_must_fit_renew_deadline() {
        let config = ElectionConfig {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(5),
            retry_period: Duration::from_millis(4500),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retry_period_is_rejected() {
        let config = ElectionConfig {
            retry_period: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn renewing_counts_as_leading() {
        assert!(ElectionState::Renewing.is_leader());
        assert!(ElectionState::Leading.is_leader());
        assert!(!ElectionState::Acquiring.is_leader());
        assert!(!ElectionState::Relinquished.is_leader());
    }
}
