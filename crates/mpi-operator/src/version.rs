//! Build version information

use std::fmt;

/// API version of the MPIJob resource this build serves
pub const API_VERSION: &str = "v2";

/// Version details of this binary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    /// MPIJob API version
    pub api_version: &'static str,
    /// Crate version
    pub version: &'static str,
    /// Git commit, when provided at build time via `MPI_OPERATOR_GIT_SHA`
    pub git_sha: &'static str,
}

impl VersionInfo {
    /// Version of the running binary
    pub fn current() -> Self {
        Self {
            api_version: API_VERSION,
            version: env!("CARGO_PKG_VERSION"),
            git_sha: option_env!("MPI_OPERATOR_GIT_SHA").unwrap_or("unknown"),
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mpi-operator {} (API {}, git {})",
            self.version, self.api_version, self.git_sha
        )
    }
}
