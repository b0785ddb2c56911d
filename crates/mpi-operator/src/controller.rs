//! MPIJob controller boundary
//!
//! The bootstrap sequence only knows [`Controller::run`]. The worker pool
//! here pulls keys from the shared work queue and hands them to a
//! [`Reconciler`]; what a reconcile actually does to pods and services is
//! up to the reconciler.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Resource, ResourceExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use mpi_common::crd::MPIJob;
use mpi_common::workqueue::WorkQueue;
use mpi_common::Error;

/// Queue key identifying one MPIJob
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    /// Namespace of the job
    pub namespace: String,
    /// Name of the job
    pub name: String,
}

impl JobKey {
    /// Key for the job `namespace/name`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object, `None` for cluster-scoped objects
    pub fn for_object<K: Resource>(obj: &K) -> Option<Self> {
        let namespace = obj.meta().namespace.clone()?;
        Some(Self::new(namespace, obj.name_any()))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The workload started once this replica leads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Controller: Send + Sync {
    /// Process work with `threadiness` workers until `shutdown` fires
    ///
    /// Returns once every worker has finished its current item.
    async fn run(&self, threadiness: usize, shutdown: CancellationToken) -> Result<(), Error>;
}

/// Reconciles one MPIJob
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Drive the job identified by `key` toward its desired state
    async fn reconcile(&self, key: &JobKey) -> Result<(), Error>;
}

/// Readiness of the caches a controller reads from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheSync: Send + Sync {
    /// Resolve once every cache has completed its initial list
    async fn wait_for_sync(&self) -> Result<(), Error>;
}

/// Worker pool over the controller work queue
pub struct MpiJobController {
    queue: WorkQueue<JobKey>,
    reconciler: Arc<dyn Reconciler>,
    caches: Option<Arc<dyn CacheSync>>,
}

impl MpiJobController {
    /// Create a controller consuming `queue`
    pub fn new(queue: WorkQueue<JobKey>, reconciler: Arc<dyn Reconciler>) -> Self {
        Self {
            queue,
            reconciler,
            caches: None,
        }
    }

    /// Hold workers back until `caches` have synced
    pub fn with_cache_sync(mut self, caches: Arc<dyn CacheSync>) -> Self {
        self.caches = Some(caches);
        self
    }

    /// Returns false if shutdown fired before the caches synced
    async fn wait_for_caches(&self, shutdown: &CancellationToken) -> Result<bool, Error> {
        let Some(caches) = &self.caches else {
            return Ok(true);
        };
        info!("Waiting for informer caches to sync");
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Ok(false),
            synced = caches.wait_for_sync() => synced.map(|()| true),
        }
    }
}

#[async_trait]
impl Controller for MpiJobController {
    async fn run(&self, threadiness: usize, shutdown: CancellationToken) -> Result<(), Error> {
        if threadiness == 0 {
            return Err(Error::config("controller needs at least one worker"));
        }
        if !self.wait_for_caches(&shutdown).await? {
            self.queue.shutdown();
            return Ok(());
        }
        info!(workers = threadiness, "Starting MPIJob workers");

        let mut workers = JoinSet::new();
        for worker in 0..threadiness {
            let queue = self.queue.clone();
            let reconciler = Arc::clone(&self.reconciler);
            workers.spawn(async move {
                while let Some(key) = queue.get().await {
                    process_item(&queue, reconciler.as_ref(), &key).await;
                }
                debug!(worker, "Worker stopped");
            });
        }

        shutdown.cancelled().await;
        info!("Shutting down MPIJob workers");
        self.queue.shutdown();

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                result = Err(Error::internal_with_context(
                    "controller",
                    format!("worker failed: {}", e),
                ));
            }
        }
        result
    }
}

async fn process_item(queue: &WorkQueue<JobKey>, reconciler: &dyn Reconciler, key: &JobKey) {
    match reconciler.reconcile(key).await {
        Ok(()) => queue.forget(key),
        Err(e) if e.is_retryable() => {
            warn!(job = %key, error = %e, requeues = queue.num_requeues(key), "Reconcile failed, requeueing");
            queue.add_rate_limited(key.clone());
        }
        Err(e) => {
            warn!(job = %key, error = %e, "Reconcile failed permanently, dropping");
            queue.forget(key);
        }
    }
    queue.done(key);
}

/// Reconciler that reports job progress from the MPIJob cache
pub struct JobObserver {
    jobs: Store<MPIJob>,
}

impl JobObserver {
    /// Create an observer reading from `jobs`
    pub fn new(jobs: Store<MPIJob>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Reconciler for JobObserver {
    async fn reconcile(&self, key: &JobKey) -> Result<(), Error> {
        let reference = ObjectRef::<MPIJob>::new(&key.name).within(&key.namespace);
        let Some(job) = self.jobs.get(&reference) else {
            debug!(job = %key, "MPIJob no longer exists");
            return Ok(());
        };

        let finished = job.status.as_ref().is_some_and(|s| s.is_finished());
        if finished {
            debug!(job = %key, "MPIJob already finished");
            return Ok(());
        }

        let replicas: i32 = job
            .spec
            .mpi_replica_specs
            .values()
            .map(|r| r.replicas.unwrap_or(1))
            .sum();
        info!(job = %key, replicas, "Observed MPIJob");
        Ok(())
    }
}
