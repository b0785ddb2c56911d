//! Startup utilities for the MPI operator
//!
//! Everything that runs before the election: client resolution, the
//! MPIJob capability gate and signal handling.

mod capability;
pub(crate) mod clients;
mod signals;

pub use capability::{check_capability, Capability, JobLister, KubeJobLister};
pub use clients::{
    resolve_clients, ClientBundle, ClientFactory, ClientRole, GangScheduler, KubeClientFactory,
    VOLCANO_SCHEDULER_NAME,
};
pub use signals::install_shutdown_handler;

