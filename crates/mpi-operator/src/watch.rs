//! Watch caches feeding the controller queue
//!
//! One reflector per resource kind the controller reads. MPIJob changes
//! enqueue the job itself; changes to dependents (launcher Job, worker
//! pods, hostfile ConfigMap, headless Service, SSH Secret) enqueue the
//! MPIJob that controls them.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mpi_common::crd::{MPIJob, MPI_JOB_GROUP};
use mpi_common::workqueue::WorkQueue;
use mpi_common::Error;

use crate::controller::{CacheSync, JobKey};
use crate::startup::ClientBundle;

/// Watcher timeout (seconds), kept below the client read timeout (30s) so
/// the API server closes idle watches before the client gives up on them
const WATCH_TIMEOUT_SECS: u32 = 25;

type KeyFn<K> = fn(&K) -> Option<JobKey>;

/// Key of the MPIJob that controls `obj`, if any
pub fn controller_job_key<K: Resource>(obj: &K) -> Option<JobKey> {
    let namespace = obj.meta().namespace.as_deref()?;
    obj.owner_references()
        .iter()
        .find(|owner| {
            owner.controller == Some(true)
                && owner.kind == "MPIJob"
                && owner
                    .api_version
                    .split_once('/')
                    .is_some_and(|(group, _)| group == MPI_JOB_GROUP)
        })
        .map(|owner| JobKey::new(namespace, &owner.name))
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Reflected stores of everything the controller reads
#[derive(Clone)]
pub struct CacheStores {
    jobs: Store<MPIJob>,
    launchers: Store<Job>,
    pods: Store<Pod>,
    config_maps: Store<ConfigMap>,
    services: Store<Service>,
    secrets: Store<Secret>,
    priority_classes: Store<PriorityClass>,
}

impl CacheStores {
    /// MPIJob store
    pub fn jobs(&self) -> Store<MPIJob> {
        self.jobs.clone()
    }

    /// Wait until every store has completed its initial list
    pub async fn wait_until_ready(&self) -> Result<(), Error> {
        let not_ready = |kind: &'static str| {
            move |e: reflector::store::WriterDropped| {
                Error::internal_with_context("watch", format!("{} cache never synced: {}", kind, e))
            }
        };
        self.jobs.wait_until_ready().await.map_err(not_ready("mpijobs"))?;
        self.launchers.wait_until_ready().await.map_err(not_ready("jobs"))?;
        self.pods.wait_until_ready().await.map_err(not_ready("pods"))?;
        self.config_maps
            .wait_until_ready()
            .await
            .map_err(not_ready("configmaps"))?;
        self.services
            .wait_until_ready()
            .await
            .map_err(not_ready("services"))?;
        self.secrets.wait_until_ready().await.map_err(not_ready("secrets"))?;
        self.priority_classes
            .wait_until_ready()
            .await
            .map_err(not_ready("priorityclasses"))?;
        Ok(())
    }
}

#[async_trait]
impl CacheSync for CacheStores {
    async fn wait_for_sync(&self) -> Result<(), Error> {
        self.wait_until_ready().await
    }
}

/// Watches built from the client bundle, started on demand
pub struct WatchCaches {
    stores: CacheStores,
    pending: Vec<(&'static str, BoxFuture<'static, ()>)>,
}

impl WatchCaches {
    /// Build the reflectors; nothing is watched until [`start`](Self::start)
    pub fn new(clients: &ClientBundle, namespace: Option<&str>, queue: WorkQueue<JobKey>) -> Self {
        let mut pending = Vec::new();
        let core = &clients.operator;

        let jobs = reflect(
            &mut pending,
            "mpijobs",
            api_for(&clients.mpi_job, namespace),
            queue.clone(),
            JobKey::for_object,
        );
        let launchers = reflect(
            &mut pending,
            "jobs",
            api_for(core, namespace),
            queue.clone(),
            controller_job_key,
        );
        let pods = reflect(
            &mut pending,
            "pods",
            api_for(core, namespace),
            queue.clone(),
            controller_job_key,
        );
        let config_maps = reflect(
            &mut pending,
            "configmaps",
            api_for(core, namespace),
            queue.clone(),
            controller_job_key,
        );
        let services = reflect(
            &mut pending,
            "services",
            api_for(core, namespace),
            queue.clone(),
            controller_job_key,
        );
        let secrets = reflect(
            &mut pending,
            "secrets",
            api_for(core, namespace),
            queue.clone(),
            controller_job_key,
        );
        // Cluster-scoped; read for pod group priorities only
        let priority_classes = reflect(
            &mut pending,
            "priorityclasses",
            Api::all(core.clone()),
            queue,
            |_: &PriorityClass| None,
        );

        Self {
            stores: CacheStores {
                jobs,
                launchers,
                pods,
                config_maps,
                services,
                secrets,
                priority_classes,
            },
            pending,
        }
    }

    /// Spawn every watch; they stop when `shutdown` fires or the set is dropped
    pub fn start(&mut self, shutdown: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for (kind, watch) in self.pending.drain(..) {
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => debug!(kind, "Watch stopped"),
                    _ = watch => warn!(kind, "Watch stream ended"),
                }
            });
        }
        info!(watches = tasks.len(), "Started watch caches");
        tasks
    }

    /// Shared handles to the reflected stores
    pub fn stores(&self) -> CacheStores {
        self.stores.clone()
    }

    /// Number of watches built but not yet started
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn reflect<K>(
    pending: &mut Vec<(&'static str, BoxFuture<'static, ()>)>,
    kind: &'static str,
    api: Api<K>,
    queue: WorkQueue<JobKey>,
    key_of: KeyFn<K>,
) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let (reader, writer) = reflector::store();
    let stream = watcher::watcher(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff()
        .reflect(writer)
        .touched_objects();

    let watch = async move {
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(obj) => {
                    if let Some(key) = key_of(&obj) {
                        queue.add(key);
                    }
                }
                Err(e) => warn!(kind, error = %e, "Watch error"),
            }
        }
    }
    .boxed();

    pending.push((kind, watch));
    reader
}
