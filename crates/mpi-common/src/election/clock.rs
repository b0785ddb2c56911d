//! Wall-clock source for lock record timestamps

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Where renew and acquire times come from
///
/// A waiting candidate judges a foreign claim by the renew time written
/// into the record, so all candidates sharing a lock read the same kind
/// of clock.
#[derive(Clone, Copy, Debug, Default)]
pub enum WallClock {
    /// The host clock
    #[default]
    System,
    /// Host time at `at`, advanced by the tokio clock since then
    ///
    /// Follows paused and advanced runtime time.
    Tokio {
        /// Host time when the clock was anchored
        anchor: DateTime<Utc>,
        /// Runtime instant matching `anchor`
        at: Instant,
    },
}

impl WallClock {
    /// A clock driven by the tokio runtime, anchored at the current host time
    pub fn tokio() -> Self {
        Self::Tokio {
            anchor: Utc::now(),
            at: Instant::now(),
        }
    }

    /// Current wall time
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Tokio { anchor, at } => {
                let elapsed = chrono::Duration::from_std(Instant::now().saturating_duration_since(*at))
                    .unwrap_or_else(|_| chrono::Duration::zero());
                *anchor + elapsed
            }
        }
    }

    /// Time elapsed since `then`; zero when `then` lies in the future
    pub fn since(&self, then: DateTime<Utc>) -> Duration {
        (self.now() - then).to_std().unwrap_or(Duration::ZERO)
    }
}
