//! Common building blocks for the MPI operator: leader election, the
//! health watchdog, the controller work queue and the MPIJob CRD.

#![deny(missing_docs)]

pub mod crd;
pub mod election;
pub mod error;
pub mod events;
pub mod health;
pub mod identity;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;
pub mod workqueue;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Component name used for the field manager, events and user agents
pub const OPERATOR_NAME: &str = "mpi-operator";

/// Default namespace and name of the leader Lease
pub const DEFAULT_LOCK_NAMESPACE: &str = "mpi-operator";

/// Name of the leader Lease
pub const LEADER_LEASE_NAME: &str = "mpi-operator";
