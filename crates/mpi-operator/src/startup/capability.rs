//! MPIJob API presence check
//!
//! Only a definite "not found" from the API server stops startup. Any
//! other failure (timeouts, throttling, even authorization errors) is
//! logged and startup continues, so a flaky API server cannot keep the
//! operator from starting. This asymmetry is intentional and kept as is,
//! though failing closed on authorization errors is worth revisiting.

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use mpi_common::crd::MPIJob;

/// Whether the MPIJob resource is served
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Served (or could not be ruled out)
    Present,
    /// The API server reported the resource as not found
    Absent,
}

/// Lists MPIJobs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobLister: Send + Sync {
    /// List at most one MPIJob in `namespace`, or in all namespaces
    async fn list_one(&self, namespace: Option<String>) -> Result<(), kube::Error>;
}

/// Lists MPIJobs through the MPIJob client
pub struct KubeJobLister {
    client: Client,
}

impl KubeJobLister {
    /// Create a lister using the MPIJob client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobLister for KubeJobLister {
    async fn list_one(&self, namespace: Option<String>) -> Result<(), kube::Error> {
        let api: Api<MPIJob> = match namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        api.list(&ListParams::default().limit(1)).await.map(|_| ())
    }
}

/// Probe for the MPIJob resource with a single read-only list call
pub async fn check_capability(lister: &dyn JobLister, namespace: Option<&str>) -> Capability {
    match lister.list_one(namespace.map(str::to_string)).await {
        Ok(()) => {
            info!("MPIJob API is available");
            Capability::Present
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            warn!(error = %e, "MPIJob CRD is not installed");
            Capability::Absent
        }
        Err(e) => {
            warn!(error = %e, "Could not verify MPIJob API, continuing");
            Capability::Present
        }
    }
}
