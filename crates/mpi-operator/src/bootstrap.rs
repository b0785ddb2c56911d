//! Bootstrap sequence
//!
//! Resolves clients, gates on the MPIJob API, starts the caches and the
//! health endpoint, then runs the election and hands the controller over
//! once this replica leads.
//!
//! Shutdown after leadership drains the controller before the election
//! stops, so the lease stays valid while in-flight work finishes. Losing
//! leadership is fatal and surfaces as [`ExitReason::LeadershipLost`].

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mpi_common::election::{
    ElectionConfig, ElectionOutcome, LeaderEvent, LeaseCoordinator, LeaseLock, LockName,
    StopReason,
};
use mpi_common::events::KubeEventPublisher;
use mpi_common::health::{serve_health, HealthWatchdog, DEFAULT_HEALTH_GRACE};
use mpi_common::identity::CandidateIdentity;
use mpi_common::kube_utils::{build_config, KUBECONFIG_ENV};
use mpi_common::workqueue::controller_queue;
use mpi_common::{Error, LEADER_LEASE_NAME, OPERATOR_NAME};

use crate::controller::{Controller, JobKey, JobObserver, MpiJobController};
use crate::options::Options;
use crate::startup::{
    check_capability, resolve_clients, Capability, KubeClientFactory, KubeJobLister,
};
use crate::version::VersionInfo;
use crate::watch::WatchCaches;

/// Why the process exits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean shutdown
    Success,
    /// Configuration, identity or client construction failed
    StartupFailed,
    /// The MPIJob resource is not served
    CapabilityMissing,
    /// Leadership was held and lost
    LeadershipLost,
    /// The controller returned an error
    ControllerFailed,
    /// The health endpoint failed
    HealthServerFailed,
}

impl ExitReason {
    /// Process exit code
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Success => 0,
            ExitReason::StartupFailed => 1,
            ExitReason::CapabilityMissing => 3,
            ExitReason::LeadershipLost => 4,
            ExitReason::ControllerFailed => 5,
            ExitReason::HealthServerFailed => 6,
        }
    }
}

/// Fatal bootstrap errors
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Startup did not complete
    #[error("startup failed: {0}")]
    Startup(#[from] Error),

    /// The MPIJob CRD is not installed
    #[error("MPIJob CRD doesn't exist")]
    CapabilityMissing,

    /// Leadership was lost
    #[error("leader election lost")]
    LeadershipLost,

    /// The controller failed
    #[error("error running controller: {0}")]
    Controller(Error),

    /// The health endpoint failed
    #[error("health server failed: {0}")]
    HealthServer(Error),
}

impl BootstrapError {
    /// Exit reason for this error
    pub fn exit_reason(&self) -> ExitReason {
        match self {
            BootstrapError::Startup(_) => ExitReason::StartupFailed,
            BootstrapError::CapabilityMissing => ExitReason::CapabilityMissing,
            BootstrapError::LeadershipLost => ExitReason::LeadershipLost,
            BootstrapError::Controller(_) => ExitReason::ControllerFailed,
            BootstrapError::HealthServer(_) => ExitReason::HealthServerFailed,
        }
    }
}

/// Run the operator until `shutdown` fires or a fatal error occurs
pub async fn run(options: Options, shutdown: CancellationToken) -> Result<(), BootstrapError> {
    info!(version = %VersionInfo::current(), "Starting");
    info!(options = ?options, "Server options");
    options.validate()?;

    let namespace = options.namespace_scope();
    match namespace {
        None => info!("Using cluster scoped operator"),
        Some(ns) => info!(namespace = %ns, "Scoping operator to namespace"),
    }

    let identity = CandidateIdentity::from_hostname()?;

    let kubeconfig_env = std::env::var(KUBECONFIG_ENV).ok();
    let connection = options.connection(kubeconfig_env.as_deref());
    let config = build_config(&connection).await?;
    let factory = KubeClientFactory::new(config, options.qps, options.burst);
    let clients = resolve_clients(&factory, options.gang_scheduler())?;

    let lister = KubeJobLister::new(clients.mpi_job.clone());
    if check_capability(&lister, namespace).await == Capability::Absent {
        error!("MPIJob CRD doesn't exist, exiting");
        return Err(BootstrapError::CapabilityMissing);
    }

    let queue = controller_queue::<JobKey>(&options.rate_limiter_spec())?;
    let mut caches = WatchCaches::new(&clients, namespace, queue.clone());
    let stores = caches.stores();
    let mut watches = caches.start(shutdown.clone());

    let election = ElectionConfig::default();
    let watchdog = Arc::new(HealthWatchdog::new(election.lease_duration, DEFAULT_HEALTH_GRACE));
    let mut health = tokio::spawn(serve_health(
        options.healthz_port,
        Arc::clone(&watchdog),
        shutdown.clone(),
    ));

    let lock = LeaseLock::new(
        clients.leader_election.clone(),
        LockName::new(&options.lock_namespace, LEADER_LEASE_NAME),
    );
    let publisher = KubeEventPublisher::new(
        clients.operator.clone(),
        OPERATOR_NAME,
        Some(identity.to_string()),
    );
    let coordinator = LeaseCoordinator::new(identity, Arc::new(lock), election)?
        .with_watchdog(watchdog)
        .with_event_publisher(Arc::new(publisher))
        .with_release_on_cancel(true);

    let controller: Arc<dyn Controller> = Arc::new(
        MpiJobController::new(queue, Arc::new(JobObserver::new(stores.jobs())))
            .with_cache_sync(Arc::new(stores)),
    );

    let lead = lead_and_run(coordinator, controller, options.threadiness, shutdown.clone());
    tokio::pin!(lead);

    let result = tokio::select! {
        result = &mut lead => result,
        served = &mut health => match flatten(served, "healthz") {
            Ok(()) => (&mut lead).await,
            Err(e) => {
                error!(error = %e, "Health server failed");
                shutdown.cancel();
                if let Err(lead_err) = (&mut lead).await {
                    warn!(error = %lead_err, "Election ended with error during health failure");
                }
                Err(BootstrapError::HealthServer(e))
            }
        },
    };

    shutdown.cancel();
    watches.shutdown().await;
    result
}

/// Run the election and start `controller` once this replica leads
///
/// Returns `Ok` when `shutdown` fires, after the controller drained and
/// the election stopped.
pub async fn lead_and_run(
    mut coordinator: LeaseCoordinator,
    controller: Arc<dyn Controller>,
    threadiness: usize,
    shutdown: CancellationToken,
) -> Result<(), BootstrapError> {
    let mut events = coordinator.take_events().ok_or_else(|| {
        Error::internal_with_context("bootstrap", "election events already taken")
    })?;

    let election_stop = CancellationToken::new();
    let election = tokio::spawn(coordinator.run(election_stop.clone()));
    let mut running: Option<JoinHandle<Result<(), Error>>> = None;

    let outcome = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            event = events.recv() => match event {
                Some(LeaderEvent::Acquiring) => {}
                Some(LeaderEvent::StartedLeading) => {
                    info!("Leading started");
                    let controller = Arc::clone(&controller);
                    let token = shutdown.child_token();
                    running = Some(tokio::spawn(async move {
                        controller.run(threadiness, token).await
                    }));
                }
                Some(LeaderEvent::NewLeader(leader)) => {
                    info!(leader = %leader, "New leader has been elected");
                }
                Some(LeaderEvent::StoppedLeading(StopReason::RenewFailed)) => {
                    error!("Leader election stopped");
                    break Err(BootstrapError::LeadershipLost);
                }
                Some(LeaderEvent::StoppedLeading(StopReason::Cancelled)) | None => {
                    break Err(BootstrapError::Startup(Error::internal_with_context(
                        "bootstrap",
                        "election ended without a stop signal",
                    )));
                }
            },
            finished = join_controller(&mut running) => {
                running = None;
                let err = match finished {
                    Ok(()) => Error::internal_with_context("controller", "exited before shutdown"),
                    Err(e) => e,
                };
                break Err(BootstrapError::Controller(err));
            }
        }
    };

    match outcome {
        Ok(()) => {
            // Drain the workload while the lease is still held
            let drained = match running.take() {
                Some(handle) => {
                    info!("Draining controller before releasing leadership");
                    flatten(handle.await, "controller")
                }
                None => Ok(()),
            };
            election_stop.cancel();
            if let Ok(ElectionOutcome::Lost) = election.await {
                warn!("Leadership was lost while shutting down");
            }
            drained.map_err(BootstrapError::Controller)
        }
        Err(e) => {
            if let Some(handle) = running.take() {
                handle.abort();
            }
            election_stop.cancel();
            election.abort();
            Err(e)
        }
    }
}

async fn join_controller(running: &mut Option<JoinHandle<Result<(), Error>>>) -> Result<(), Error> {
    match running {
        Some(handle) => flatten(handle.await, "controller"),
        None => std::future::pending().await,
    }
}

fn flatten(
    joined: Result<Result<(), Error>, tokio::task::JoinError>,
    context: &str,
) -> Result<(), Error> {
    joined.map_err(|e| Error::internal_with_context(context, format!("task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use mpi_common::election::{LockBackend, LockRecord, MemoryLock, WallClock};
    use tokio::time::sleep;

    use super::*;
    use crate::controller::MockController;

    fn lock() -> MemoryLock {
        MemoryLock::new(LockName::new("mpi-operator", "mpi-operator"))
    }

    fn coordinator(host: &str, lock: &MemoryLock) -> LeaseCoordinator {
        LeaseCoordinator::new(
            CandidateIdentity::for_host(host).unwrap(),
            Arc::new(lock.clone()),
            ElectionConfig::default(),
        )
        .unwrap()
        .with_release_on_cancel(true)
    }

    /// Runs until cancelled, then records that it drained
    #[derive(Default)]
    struct Draining {
        started: AtomicBool,
        drained: AtomicBool,
    }

    #[async_trait]
    impl Controller for Draining {
        async fn run(&self, _threadiness: usize, shutdown: CancellationToken) -> Result<(), Error> {
            self.started.store(true, Ordering::SeqCst);
            shutdown.cancelled().await;
            sleep(Duration::from_millis(100)).await;
            self.drained.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn exit_codes_are_distinct() {
        let reasons = [
            ExitReason::Success,
            ExitReason::StartupFailed,
            ExitReason::CapabilityMissing,
            ExitReason::LeadershipLost,
            ExitReason::ControllerFailed,
            ExitReason::HealthServerFailed,
        ];
        let codes: std::collections::HashSet<_> = reasons.iter().map(|r| r.exit_code()).collect();
        assert_eq!(codes.len(), reasons.len());
        assert_eq!(ExitReason::Success.exit_code(), 0);
    }

    #[test]
    fn errors_map_to_exit_reasons() {
        assert_eq!(
            BootstrapError::from(Error::config("bad")).exit_reason(),
            ExitReason::StartupFailed
        );
        assert_eq!(
            BootstrapError::CapabilityMissing.exit_reason(),
            ExitReason::CapabilityMissing
        );
        assert_eq!(
            BootstrapError::LeadershipLost.exit_reason(),
            ExitReason::LeadershipLost
        );
        assert_eq!(
            BootstrapError::Controller(Error::config("x")).exit_reason(),
            ExitReason::ControllerFailed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_leading_never_starts_controller() {
        let lock = lock();
        // Another candidate holds a fresh claim
        lock.create(&LockRecord::new_term(
            "other",
            Duration::from_secs(15),
            chrono::Utc::now(),
            0,
        ))
        .await
        .unwrap();

        let mut controller = MockController::new();
        controller.expect_run().never();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(lead_and_run(
            coordinator("standby", &lock),
            Arc::new(controller),
            2,
            shutdown.clone(),
        ));

        sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(lock.snapshot().unwrap().record.holder_identity, "other");
    }

    #[tokio::test(start_paused = true)]
    async fn standby_keeps_waiting_through_new_leader_then_takes_over() {
        let lock = lock();
        let clock = WallClock::tokio();
        lock.create(&LockRecord::new_term(
            "other",
            Duration::from_secs(15),
            clock.now(),
            0,
        ))
        .await
        .unwrap();

        let controller = Arc::new(Draining::default());
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(lead_and_run(
            coordinator("standby", &lock).with_wall_clock(clock),
            controller.clone(),
            2,
            shutdown.clone(),
        ));

        // Hearing about the foreign leader neither ends the run nor starts work
        sleep(Duration::from_secs(10)).await;
        assert!(!run.is_finished());
        assert!(!controller.started.load(Ordering::SeqCst));

        sleep(Duration::from_secs(6)).await;
        assert!(controller.started.load(Ordering::SeqCst));
        assert!(lock
            .snapshot()
            .unwrap()
            .record
            .holder_identity
            .starts_with("standby_"));

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_controller_then_releases_lease() {
        let lock = lock();
        let controller = Arc::new(Draining::default());
        let shutdown = CancellationToken::new();

        let run = tokio::spawn(lead_and_run(
            coordinator("leader", &lock),
            controller.clone(),
            2,
            shutdown.clone(),
        ));

        sleep(Duration::from_secs(10)).await;
        assert!(controller.started.load(Ordering::SeqCst));
        assert!(lock
            .snapshot()
            .unwrap()
            .record
            .holder_identity
            .starts_with("leader_"));

        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert!(controller.drained.load(Ordering::SeqCst));
        assert!(lock.snapshot().unwrap().record.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn controller_error_is_fatal() {
        let lock = lock();
        let mut controller = MockController::new();
        controller
            .expect_run()
            .times(1)
            .returning(|_, _| Err(Error::internal_with_context("controller", "boom")));

        let err = lead_and_run(
            coordinator("leader", &lock),
            Arc::new(controller),
            2,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_reason(), ExitReason::ControllerFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn deposed_leader_exits_with_leadership_lost() {
        let lock = lock();
        let controller = Arc::new(Draining::default());
        let shutdown = CancellationToken::new();

        let run = tokio::spawn(lead_and_run(
            coordinator("leader", &lock),
            controller.clone(),
            2,
            shutdown.clone(),
        ));
        sleep(Duration::from_secs(1)).await;
        assert!(controller.started.load(Ordering::SeqCst));

        // Another candidate overwrites the record behind the leader's back
        let current = lock.snapshot().unwrap();
        let stolen = LockRecord::new_term(
            "intruder",
            Duration::from_secs(15),
            chrono::Utc::now(),
            current.record.lease_transitions + 1,
        );
        lock.update(&current.version, &stolen).await.unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.exit_reason(), ExitReason::LeadershipLost);
        assert!(!shutdown.is_cancelled());
        // The workload was aborted, not drained
        assert!(!controller.drained.load(Ordering::SeqCst));
    }
}
