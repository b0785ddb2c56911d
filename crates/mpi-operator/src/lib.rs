//! Leader-elected bootstrap for the Kubeflow MPIJob controller

#![deny(missing_docs)]

/// Startup sequence and exit reasons
pub mod bootstrap;
/// Controller boundary and worker pool
pub mod controller;
/// Command-line options
pub mod options;
/// Startup utilities (clients, capability gate, signals)
pub mod startup;
/// Build version information
pub mod version;
/// Watch caches feeding the controller queue
pub mod watch;
