//! Election loop for a single candidate
//!
//! Reads the lock record, decides whether this candidate may claim or
//! renew it, and writes back conditionally on the version it read. A
//! version mismatch means another candidate won the race and is never
//! treated as an error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::events::EventType;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::WallClock;
use super::lock::{LockBackend, LockError, LockRecord, VersionedRecord};
use super::{
    ElectionConfig, ElectionOutcome, ElectionState, LeaderEvent, StopReason, JITTER_FACTOR,
};
use crate::events::{lease_reference, reasons, EventPublisher, NoopEventPublisher};
use crate::health::HealthWatchdog;
use crate::identity::CandidateIdentity;
use crate::metrics::{LeaderMetrics, OtelLeaderMetrics};
use crate::Error;

/// Result of one read-decide-write round
#[derive(Clone, Debug, PartialEq, Eq)]
enum Attempt {
    /// This candidate holds the record after the round
    Held,
    /// Another candidate holds a valid claim
    HeldByOther(String),
    /// The round did not complete (backend error, timeout or lost race)
    Failed,
}

/// Wake this long after a foreign claim expires; the claim is still valid
/// at its expiry instant
const EXPIRY_SLACK: Duration = Duration::from_millis(1);

/// Last version of the record this candidate saw, and when its claim
/// runs out on the local clock
struct Observed {
    record: LockRecord,
    expires_at: Instant,
}

/// Runs leader election for one candidate against a lock backend
pub struct LeaseCoordinator {
    identity: CandidateIdentity,
    lock: Arc<dyn LockBackend>,
    config: ElectionConfig,
    clock: WallClock,
    watchdog: Option<Arc<HealthWatchdog>>,
    metrics: Arc<dyn LeaderMetrics>,
    publisher: Arc<dyn EventPublisher>,
    release_on_cancel: bool,
    state_tx: watch::Sender<ElectionState>,
    event_tx: mpsc::UnboundedSender<LeaderEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<LeaderEvent>>,
    observed: Option<Observed>,
    reported_leader: Option<String>,
}

impl LeaseCoordinator {
    /// Create a coordinator; fails if the timing is inconsistent
    pub fn new(
        identity: CandidateIdentity,
        lock: Arc<dyn LockBackend>,
        config: ElectionConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ElectionState::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            identity,
            lock,
            config,
            clock: WallClock::System,
            watchdog: None,
            metrics: Arc::new(OtelLeaderMetrics),
            publisher: Arc::new(NoopEventPublisher),
            release_on_cancel: false,
            state_tx,
            event_tx,
            event_rx: Some(event_rx),
            observed: None,
            reported_leader: None,
        })
    }

    /// Stamp and judge records with `clock` instead of the host clock
    pub fn with_wall_clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    /// Feed renewals and observations into a health watchdog
    pub fn with_watchdog(mut self, watchdog: Arc<HealthWatchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Record leadership in `metrics` instead of the global gauge
    pub fn with_metrics(mut self, metrics: Arc<dyn LeaderMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Publish Kubernetes Events on leadership changes
    pub fn with_event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Clear the holder when stopped while leading, so a standby can take
    /// over without waiting out the lease
    pub fn with_release_on_cancel(mut self, release: bool) -> Self {
        self.release_on_cancel = release;
        self
    }

    /// This candidate's identity
    pub fn identity(&self) -> &CandidateIdentity {
        &self.identity
    }

    /// Follow the election state
    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.state_tx.subscribe()
    }

    /// Take the transition event stream; only the first call gets it
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LeaderEvent>> {
        self.event_rx.take()
    }

    /// Run the election until leadership is lost or `stop` fires
    pub async fn run(mut self, stop: CancellationToken) -> ElectionOutcome {
        let lock = self.lock.lock_name();
        info!(identity = %self.identity, lock = %lock, "Attempting to acquire leader lease");
        self.set_state(ElectionState::Acquiring);
        self.metrics.set_leader(false);
        self.emit(LeaderEvent::Acquiring);

        if !self.acquire(&stop).await {
            info!(identity = %self.identity, "Stopped before acquiring leadership");
            self.set_state(ElectionState::Relinquished);
            return ElectionOutcome::Cancelled;
        }

        self.started_leading().await;
        let reason = self.renew(&stop).await;

        if reason == StopReason::Cancelled && self.release_on_cancel {
            self.release().await;
        }
        self.stopped_leading(reason).await;

        match reason {
            StopReason::Cancelled => ElectionOutcome::Cancelled,
            StopReason::RenewFailed => ElectionOutcome::Lost,
        }
    }

    /// Retry with jitter until the record is ours; false if stopped first
    async fn acquire(&mut self, stop: &CancellationToken) -> bool {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = stop.cancelled() => return false,
                attempt = self.try_acquire_or_renew() => attempt,
            };

            let wait = match attempt {
                Attempt::Held => return true,
                Attempt::HeldByOther(holder) => {
                    let until_expiry = self.until_expiry();
                    debug!(
                        identity = %self.identity,
                        holder = %holder,
                        expires_in = ?until_expiry,
                        "Lease held by another candidate"
                    );
                    jittered(self.config.retry_period).min(until_expiry)
                }
                Attempt::Failed => jittered(self.config.retry_period),
            };
            tokio::select! {
                biased;
                _ = stop.cancelled() => return false,
                _ = sleep(wait) => {}
            }
        }
    }

    /// Renew every retry period; returns why leadership ended
    async fn renew(&mut self, stop: &CancellationToken) -> StopReason {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return StopReason::Cancelled,
                _ = sleep(self.config.retry_period) => {}
            }

            self.set_state(ElectionState::Renewing);
            let deadline = Instant::now() + self.config.renew_deadline;

            let renewed = loop {
                let attempt = tokio::select! {
                    biased;
                    _ = stop.cancelled() => return StopReason::Cancelled,
                    attempt = timeout_at(deadline, self.try_acquire_or_renew()) => attempt,
                };

                match attempt {
                    Ok(Attempt::Held) => break true,
                    Ok(Attempt::HeldByOther(holder)) => {
                        warn!(identity = %self.identity, holder = %holder, "Lease taken over by another candidate");
                        break false;
                    }
                    Ok(Attempt::Failed) => {}
                    Err(_) => break false,
                }

                let next = (Instant::now() + self.config.retry_period).min(deadline);
                if next >= deadline {
                    break false;
                }
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return StopReason::Cancelled,
                    _ = sleep_until(next) => {}
                }
            };

            if !renewed {
                warn!(
                    identity = %self.identity,
                    renew_deadline = ?self.config.renew_deadline,
                    "Failed to renew lease within deadline"
                );
                return StopReason::RenewFailed;
            }
            self.set_state(ElectionState::Leading);
        }
    }

    /// One read-decide-write round against the lock backend
    async fn try_acquire_or_renew(&mut self) -> Attempt {
        let now = self.clock.now();
        let lease_duration = self.config.lease_duration;

        let current = match self.bounded(self.lock.get()).await {
            Ok(current) => current,
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "Failed to read lease");
                return Attempt::Failed;
            }
        };

        let Some(current) = current else {
            let record = LockRecord::new_term(self.identity.as_str(), lease_duration, now, 0);
            return match self.bounded(self.lock.create(&record)).await {
                Ok(created) => {
                    self.observe(&created);
                    self.record_renewal();
                    info!(identity = %self.identity, "Created new lease");
                    Attempt::Held
                }
                Err(LockError::Conflict) => {
                    debug!(identity = %self.identity, "Lease creation conflict, will retry");
                    Attempt::Failed
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to create lease");
                    Attempt::Failed
                }
            };
        };

        self.observe(&current);
        if let Some(watchdog) = &self.watchdog {
            watchdog.record_observation();
        }

        let holder = current.record.holder_identity.clone();
        let held_by_us = holder == self.identity.as_str();
        if !held_by_us && !current.record.is_released() && !self.observed_expired() {
            return Attempt::HeldByOther(holder);
        }

        let record = if held_by_us {
            current.record.renewed(now)
        } else {
            LockRecord::new_term(
                self.identity.as_str(),
                lease_duration,
                now,
                current.record.lease_transitions.saturating_add(1),
            )
        };

        match self.bounded(self.lock.update(&current.version, &record)).await {
            Ok(updated) => {
                self.observe(&updated);
                self.record_renewal();
                if held_by_us {
                    debug!(identity = %self.identity, "Lease renewed");
                } else {
                    info!(
                        identity = %self.identity,
                        previous = %holder,
                        transitions = updated.record.lease_transitions,
                        "Took over lease"
                    );
                }
                Attempt::Held
            }
            Err(LockError::Conflict) => {
                debug!(identity = %self.identity, "Lease update conflict, will retry");
                Attempt::Failed
            }
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "Failed to update lease");
                Attempt::Failed
            }
        }
    }

    /// Bound a backend call by the renew deadline
    async fn bounded<T, F>(&self, call: F) -> Result<T, LockError>
    where
        F: Future<Output = Result<T, LockError>>,
    {
        let limit = self.config.renew_deadline;
        timeout(limit, call)
            .await
            .map_err(|_| LockError::Timeout(limit))?
    }

    /// Track when the current claim expires, and report new foreign holders
    fn observe(&mut self, current: &VersionedRecord) {
        let changed = self
            .observed
            .as_ref()
            .map_or(true, |o| o.record != current.record);
        if changed {
            self.observed = Some(Observed {
                record: current.record.clone(),
                expires_at: Instant::now() + self.remaining_validity(&current.record),
            });
        }

        let holder = &current.record.holder_identity;
        if holder.is_empty() || self.reported_leader.as_deref() == Some(holder.as_str()) {
            return;
        }
        self.reported_leader = Some(holder.clone());
        if holder != self.identity.as_str() {
            info!(identity = %self.identity, leader = %holder, "New leader elected");
            self.emit(LeaderEvent::NewLeader(holder.clone()));
        }
    }

    /// Validity left on a claim: its advertised duration counted from its
    /// renew time, capped at a full duration from now when the holder's
    /// clock runs ahead of ours
    fn remaining_validity(&self, record: &LockRecord) -> Duration {
        let lease = Duration::from_secs(u64::try_from(record.lease_duration_seconds).unwrap_or(0));
        match record.renew_time {
            Some(renewed) => lease.saturating_sub(self.clock.since(renewed)),
            None => lease,
        }
    }

    /// A foreign claim is expired only strictly after its expiry instant
    fn observed_expired(&self) -> bool {
        self.observed
            .as_ref()
            .map_or(true, |o| Instant::now() > o.expires_at)
    }

    /// Time until just past the observed claim's expiry
    fn until_expiry(&self) -> Duration {
        self.observed.as_ref().map_or(Duration::ZERO, |o| {
            (o.expires_at + EXPIRY_SLACK).saturating_duration_since(Instant::now())
        })
    }

    fn record_renewal(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.record_renewal();
        }
    }

    /// Best-effort handoff: clear the holder if the record is still ours
    async fn release(&mut self) {
        let current = match self.bounded(self.lock.get()).await {
            Ok(Some(current)) if current.record.holder_identity == self.identity.as_str() => {
                current
            }
            Ok(_) => {
                debug!(identity = %self.identity, "Not the lease holder, nothing to release");
                return;
            }
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "Failed to read lease for release");
                return;
            }
        };

        let released = LockRecord {
            holder_identity: String::new(),
            lease_duration_seconds: 1,
            acquire_time: None,
            renew_time: None,
            lease_transitions: current.record.lease_transitions,
        };
        match self.bounded(self.lock.update(&current.version, &released)).await {
            Ok(_) => info!(identity = %self.identity, "Released lease"),
            Err(e) => warn!(identity = %self.identity, error = %e, "Failed to release lease"),
        }
    }

    async fn started_leading(&mut self) {
        info!(identity = %self.identity, "Started leading");
        self.set_state(ElectionState::Leading);
        self.metrics.set_leader(true);
        self.emit(LeaderEvent::StartedLeading);
        self.publisher
            .publish(
                &lease_reference(&self.lock.lock_name()),
                EventType::Normal,
                reasons::LEADER_ELECTION,
                reasons::ACTION_ACQUIRE,
                Some(format!("{} became leader", self.identity)),
            )
            .await;
    }

    async fn stopped_leading(&mut self, reason: StopReason) {
        match reason {
            StopReason::Cancelled => info!(identity = %self.identity, "Stopped leading"),
            StopReason::RenewFailed => warn!(identity = %self.identity, "Leadership lost"),
        }
        self.set_state(ElectionState::Relinquished);
        self.metrics.set_leader(false);
        self.emit(LeaderEvent::StoppedLeading(reason));
        self.publisher
            .publish(
                &lease_reference(&self.lock.lock_name()),
                EventType::Normal,
                reasons::LEADER_ELECTION,
                reasons::ACTION_RELEASE,
                Some(format!("{} stopped leading", self.identity)),
            )
            .await;
    }

    fn set_state(&self, state: ElectionState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: LeaderEvent) {
        // Nobody listening is fine
        let _ = self.event_tx.send(event);
    }
}

/// `base` plus a uniformly random extra of up to `JITTER_FACTOR * base`
fn jittered(base: Duration) -> Duration {
    let extra: f64 = rand::thread_rng().gen_range(0.0..JITTER_FACTOR);
    base + base.mul_f64(extra)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use k8s_openapi::api::core::v1::ObjectReference;

    use super::*;
    use crate::election::{LockName, MemoryLock, MockLockBackend};
    use crate::metrics::InMemoryLeaderMetrics;

    const DEFAULT_LEASE: Duration = Duration::from_secs(15);

    fn identity(name: &str) -> CandidateIdentity {
        CandidateIdentity::for_host(name).unwrap()
    }

    fn lock_name() -> LockName {
        LockName::new("mpi-operator", "mpi-operator")
    }

    fn coordinator(name: &str, lock: &MemoryLock) -> LeaseCoordinator {
        LeaseCoordinator::new(
            identity(name),
            Arc::new(lock.clone()),
            ElectionConfig::default(),
        )
        .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LeaderEvent>) -> Vec<LeaderEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[derive(Default)]
    struct RecordingPublisher {
        actions: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            _reason: &str,
            action: &str,
            _note: Option<String>,
        ) {
            self.actions.lock().unwrap().push(action.to_string());
        }
    }

    #[test]
    fn invalid_timing_is_rejected() {
        let config = ElectionConfig {
            lease_duration: Duration::from_secs(5),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(1),
        };
        let result = LeaseCoordinator::new(
            identity("a"),
            Arc::new(MemoryLock::new(lock_name())),
            config,
        );
        assert!(result.is_err());
    }

    #[test]
    fn jitter_stays_within_factor() {
        let base = Duration::from_secs(3);
        for _ in 0..100 {
            let wait = jittered(base);
            assert!(wait >= base);
            assert!(wait < base + base.mul_f64(JITTER_FACTOR));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_candidate_creates_lease() {
        let lock = MemoryLock::new(lock_name());
        let mut coordinator = coordinator("a", &lock);

        assert_eq!(coordinator.try_acquire_or_renew().await, Attempt::Held);

        let stored = lock.snapshot().unwrap();
        assert_eq!(stored.record.holder_identity, coordinator.identity.as_str());
        assert_eq!(stored.record.lease_transitions, 0);
        assert_eq!(stored.record.lease_duration_seconds, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_happens_strictly_after_lease_duration() {
        let lock = MemoryLock::new(lock_name());
        let clock = WallClock::tokio();
        let mut leader = coordinator("a", &lock).with_wall_clock(clock);
        let mut standby = coordinator("b", &lock).with_wall_clock(clock);

        assert_eq!(leader.try_acquire_or_renew().await, Attempt::Held);
        let leader_id = leader.identity.to_string();

        // First observation starts the expiry clock
        assert_eq!(
            standby.try_acquire_or_renew().await,
            Attempt::HeldByOther(leader_id.clone())
        );

        tokio::time::advance(DEFAULT_LEASE).await;
        assert_eq!(
            standby.try_acquire_or_renew().await,
            Attempt::HeldByOther(leader_id)
        );

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(standby.try_acquire_or_renew().await, Attempt::Held);

        let stored = lock.snapshot().unwrap();
        assert_eq!(stored.record.holder_identity, standby.identity.as_str());
        assert_eq!(stored.record.lease_transitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_resets_standby_expiry_clock() {
        let lock = MemoryLock::new(lock_name());
        let clock = WallClock::tokio();
        let mut leader = coordinator("a", &lock).with_wall_clock(clock);
        let mut standby = coordinator("b", &lock).with_wall_clock(clock);

        leader.try_acquire_or_renew().await;
        standby.try_acquire_or_renew().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(leader.try_acquire_or_renew().await, Attempt::Held);
        assert!(matches!(
            standby.try_acquire_or_renew().await,
            Attempt::HeldByOther(_)
        ));

        // 20s after the first observation, but only 10s after the renewal
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(
            standby.try_acquire_or_renew().await,
            Attempt::HeldByOther(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn late_first_read_expires_from_renew_time() {
        let lock = MemoryLock::new(lock_name());
        let clock = WallClock::tokio();
        let mut leader = coordinator("a", &lock).with_wall_clock(clock);
        let mut standby = coordinator("b", &lock).with_wall_clock(clock);

        assert_eq!(leader.try_acquire_or_renew().await, Attempt::Held);

        // The standby only reads the claim 10s into its lease
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(
            standby.try_acquire_or_renew().await,
            Attempt::HeldByOther(_)
        ));
        assert_eq!(standby.until_expiry(), Duration::from_secs(5) + EXPIRY_SLACK);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(
            standby.try_acquire_or_renew().await,
            Attempt::HeldByOther(_)
        ));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(standby.try_acquire_or_renew().await, Attempt::Held);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_claim_is_taken_over_on_first_read() {
        let lock = MemoryLock::new(lock_name());
        let clock = WallClock::tokio();
        let renewed = clock.now() - chrono::Duration::seconds(20);
        lock.create(&LockRecord::new_term("gone", DEFAULT_LEASE, renewed, 4))
            .await
            .unwrap();

        let mut standby = coordinator("b", &lock).with_wall_clock(clock);
        assert_eq!(standby.try_acquire_or_renew().await, Attempt::Held);
        assert_eq!(lock.snapshot().unwrap().record.lease_transitions, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn holder_clock_ahead_still_expires_one_lease_after_read() {
        let lock = MemoryLock::new(lock_name());
        let clock = WallClock::tokio();
        let ahead = clock.now() + chrono::Duration::hours(1);
        lock.create(&LockRecord::new_term("skewed", DEFAULT_LEASE, ahead, 0))
            .await
            .unwrap();

        let mut standby = coordinator("b", &lock).with_wall_clock(clock);
        assert!(matches!(
            standby.try_acquire_or_renew().await,
            Attempt::HeldByOther(_)
        ));

        tokio::time::advance(DEFAULT_LEASE).await;
        assert!(matches!(
            standby.try_acquire_or_renew().await,
            Attempt::HeldByOther(_)
        ));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(standby.try_acquire_or_renew().await, Attempt::Held);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_candidate_wakes_at_expiry_not_after_full_retry() {
        let lock = MemoryLock::new(lock_name());
        let clock = WallClock::tokio();
        // One second of validity left
        let renewed = clock.now() - chrono::Duration::seconds(14);
        lock.create(&LockRecord::new_term("other", DEFAULT_LEASE, renewed, 0))
            .await
            .unwrap();

        let coordinator = coordinator("b", &lock).with_wall_clock(clock);
        let mut state = coordinator.subscribe();
        let started = Instant::now();
        let handle = tokio::spawn(coordinator.run(CancellationToken::new()));

        state.wait_for(|s| s.is_leader()).await.unwrap();
        let waited = Instant::now() - started;
        assert!(waited > Duration::from_secs(1), "took over after {:?}", waited);
        assert!(
            waited <= Duration::from_secs(1) + Duration::from_millis(10),
            "took over after {:?}",
            waited
        );
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn released_lease_is_taken_immediately() {
        let lock = MemoryLock::new(lock_name());
        let first = lock
            .create(&LockRecord::new_term("a", DEFAULT_LEASE, Utc::now(), 2))
            .await
            .unwrap();
        let released = LockRecord {
            holder_identity: String::new(),
            lease_duration_seconds: 1,
            acquire_time: None,
            renew_time: None,
            lease_transitions: 2,
        };
        lock.update(&first.version, &released).await.unwrap();

        let mut standby = coordinator("b", &lock);
        assert_eq!(standby.try_acquire_or_renew().await, Attempt::Held);
        assert_eq!(lock.snapshot().unwrap().record.lease_transitions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn update_conflict_is_not_an_error() {
        let mut backend = MockLockBackend::new();
        backend.expect_lock_name().returning(lock_name);
        backend.expect_get().returning(|| {
            Ok(Some(VersionedRecord {
                record: LockRecord {
                    holder_identity: String::new(),
                    lease_duration_seconds: 1,
                    acquire_time: None,
                    renew_time: None,
                    lease_transitions: 0,
                },
                version: "7".to_string(),
            }))
        });
        backend
            .expect_update()
            .withf(|version, _| version == "7")
            .times(1)
            .returning(|_, _| Err(LockError::Conflict));

        let mut coordinator =
            LeaseCoordinator::new(identity("a"), Arc::new(backend), ElectionConfig::default())
                .unwrap();
        assert_eq!(coordinator.try_acquire_or_renew().await, Attempt::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_errors_fail_the_round() {
        let mut backend = MockLockBackend::new();
        backend.expect_lock_name().returning(lock_name);
        backend
            .expect_get()
            .returning(|| Err(LockError::Backend("etcd unavailable".to_string())));
        backend.expect_create().never();
        backend.expect_update().never();

        let mut coordinator =
            LeaseCoordinator::new(identity("a"), Arc::new(backend), ElectionConfig::default())
                .unwrap();
        assert_eq!(coordinator.try_acquire_or_renew().await, Attempt::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn new_leader_is_reported_once_and_never_for_self() {
        let lock = MemoryLock::new(lock_name());
        let mut leader = coordinator("a", &lock);
        let mut standby = coordinator("b", &lock);
        let mut leader_events = leader.take_events().unwrap();
        let mut standby_events = standby.take_events().unwrap();

        leader.try_acquire_or_renew().await;
        leader.try_acquire_or_renew().await;
        standby.try_acquire_or_renew().await;
        standby.try_acquire_or_renew().await;

        assert!(drain(&mut leader_events).is_empty());
        assert_eq!(
            drain(&mut standby_events),
            vec![LeaderEvent::NewLeader(leader.identity.to_string())]
        );
        assert!(standby.take_events().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_leading_returns_cancelled() {
        let lock = MemoryLock::new(lock_name());
        lock.create(&LockRecord::new_term("other", DEFAULT_LEASE, Utc::now(), 0))
            .await
            .unwrap();

        let metrics = Arc::new(InMemoryLeaderMetrics::default());
        let mut coordinator = coordinator("a", &lock).with_metrics(metrics.clone());
        let mut events = coordinator.take_events().unwrap();
        let state = coordinator.subscribe();

        let stop = CancellationToken::new();
        let handle = tokio::spawn(coordinator.run(stop.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.cancel();

        assert_eq!(handle.await.unwrap(), ElectionOutcome::Cancelled);
        assert_eq!(*state.borrow(), ElectionState::Relinquished);
        // A waiting candidate reports itself as not leading
        assert_eq!(metrics.value(), 0);
        assert!(metrics.updates() >= 1);
        assert_eq!(
            drain(&mut events),
            vec![
                LeaderEvent::Acquiring,
                LeaderEvent::NewLeader("other".to_string())
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn leader_renews_until_cancelled() {
        let lock = MemoryLock::new(lock_name());
        let metrics = Arc::new(InMemoryLeaderMetrics::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let mut coordinator = coordinator("a", &lock)
            .with_metrics(metrics.clone())
            .with_event_publisher(publisher.clone());
        let mut events = coordinator.take_events().unwrap();
        let mut state = coordinator.subscribe();

        let stop = CancellationToken::new();
        let handle = tokio::spawn(coordinator.run(stop.clone()));
        state.wait_for(|s| s.is_leader()).await.unwrap();
        assert_eq!(metrics.value(), 1);

        let acquired = lock.snapshot().unwrap().version;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_ne!(lock.snapshot().unwrap().version, acquired);

        stop.cancel();
        assert_eq!(handle.await.unwrap(), ElectionOutcome::Cancelled);
        assert_eq!(metrics.value(), 0);
        assert_eq!(
            drain(&mut events),
            vec![
                LeaderEvent::Acquiring,
                LeaderEvent::StartedLeading,
                LeaderEvent::StoppedLeading(StopReason::Cancelled),
            ]
        );
        assert_eq!(
            *publisher.actions.lock().unwrap(),
            vec![reasons::ACTION_ACQUIRE, reasons::ACTION_RELEASE]
        );
        // Not released by default
        assert!(!lock.snapshot().unwrap().record.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn release_on_cancel_clears_holder() {
        let lock = MemoryLock::new(lock_name());
        let coordinator = coordinator("a", &lock).with_release_on_cancel(true);
        let mut state = coordinator.subscribe();

        let stop = CancellationToken::new();
        let handle = tokio::spawn(coordinator.run(stop.clone()));
        state.wait_for(|s| s.is_leader()).await.unwrap();
        stop.cancel();
        handle.await.unwrap();

        let stored = lock.snapshot().unwrap();
        assert!(stored.record.is_released());
        assert_eq!(stored.record.lease_transitions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn renew_failure_past_deadline_loses_leadership() {
        let gets = Arc::new(AtomicUsize::new(0));

        // The first read finds no lease, every later read fails
        let mut backend = MockLockBackend::new();
        backend.expect_lock_name().returning(lock_name);
        let counter = gets.clone();
        backend.expect_get().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Err(LockError::Backend("connection refused".to_string()))
            }
        });
        backend.expect_create().times(1).returning(|record| {
            Ok(VersionedRecord {
                record: record.clone(),
                version: "1".to_string(),
            })
        });

        let metrics = Arc::new(InMemoryLeaderMetrics::default());
        let watchdog = Arc::new(HealthWatchdog::new(DEFAULT_LEASE, Duration::from_secs(20)));
        let mut coordinator =
            LeaseCoordinator::new(identity("a"), Arc::new(backend), ElectionConfig::default())
                .unwrap()
                .with_metrics(metrics.clone())
                .with_watchdog(watchdog.clone());
        let mut events = coordinator.take_events().unwrap();

        let outcome = coordinator.run(CancellationToken::new()).await;
        assert_eq!(outcome, ElectionOutcome::Lost);
        assert_eq!(metrics.value(), 0);
        assert_eq!(
            drain(&mut events).last(),
            Some(&LeaderEvent::StoppedLeading(StopReason::RenewFailed))
        );
        // Renewal ran every retry period until the deadline passed
        assert!(gets.load(Ordering::SeqCst) >= 2);
        assert!(watchdog.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_holder_during_renewal_loses_immediately() {
        let lock = MemoryLock::new(lock_name());
        let coordinator = coordinator("a", &lock);
        let mut state = coordinator.subscribe();

        let handle = tokio::spawn(coordinator.run(CancellationToken::new()));
        state.wait_for(|s| s.is_leader()).await.unwrap();

        // Simulate an operator force-assigning the lease elsewhere
        let current = lock.snapshot().unwrap();
        lock.update(
            &current.version,
            &LockRecord::new_term("intruder", DEFAULT_LEASE, Utc::now(), 1),
        )
        .await
        .unwrap();

        let started = Instant::now();
        assert_eq!(handle.await.unwrap(), ElectionOutcome::Lost);
        assert!(Instant::now() - started <= Duration::from_secs(3));
    }
}
