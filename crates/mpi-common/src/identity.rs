//! Candidate identity for leader election
//!
//! The identity is the host name plus a random uniquifier so that two
//! processes on the same host never both believe they hold the lease.

use std::fmt;

use uuid::Uuid;

use crate::Error;

/// Process-unique leader election candidate identity
///
/// Written as the holder of the lock record. Immutable for the lifetime
/// of the process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CandidateIdentity(String);

impl CandidateIdentity {
    /// Derive an identity from the local host name
    pub fn from_hostname() -> Result<Self, Error> {
        let host = hostname::get()
            .map_err(|e| Error::identity(format!("failed to get hostname: {}", e)))?;
        let host = host
            .into_string()
            .map_err(|_| Error::identity("hostname is not valid UTF-8"))?;
        Self::for_host(&host)
    }

    /// Derive an identity for the given host name
    pub fn for_host(host: &str) -> Result<Self, Error> {
        let host = host.trim();
        if host.is_empty() {
            return Err(Error::identity("hostname is empty"));
        }
        Ok(Self(format!("{}_{}", host, Uuid::new_v4())))
    }

    /// The identity as written to the lock record
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CandidateIdentity> for String {
    fn from(id: CandidateIdentity) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_host_prefixed() {
        let id = CandidateIdentity::for_host("mpi-operator-7d9f").unwrap();
        assert!(id.as_str().starts_with("mpi-operator-7d9f_"));
        let suffix = id.as_str().trim_start_matches("mpi-operator-7d9f_");
        assert!(Uuid::parse_str(suffix).is_ok());
    }

    #[test]
    fn co_located_candidates_never_collide() {
        let a = CandidateIdentity::for_host("node-a").unwrap();
        let b = CandidateIdentity::for_host("node-a").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_host_is_rejected() {
        let err = CandidateIdentity::for_host("  ").unwrap_err();
        assert!(matches!(err, Error::Identity { .. }));
    }

    #[test]
    fn local_hostname_resolves() {
        let id = CandidateIdentity::from_hostname().unwrap();
        assert!(id.as_str().contains('_'));
    }
}
