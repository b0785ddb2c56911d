//! Lock records and the backends that store them
//!
//! A lock backend is any store offering atomic conditional writes on a
//! single named record. The only production backend is the Kubernetes
//! `coordination.k8s.io/v1` Lease, where `resourceVersion` provides the
//! compare-and-swap: if the Lease changed between read and write, the
//! write fails with 409 Conflict.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Address of a lock record
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockName {
    /// Namespace holding the record
    pub namespace: String,
    /// Record name
    pub name: String,
}

impl LockName {
    /// Create a lock name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Leadership record as stored by the lock backend
///
/// Field names mirror the Lease spec so external tooling that inspects
/// the Lease sees the usual holder and timing fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    /// Identity of the current holder; empty when released
    pub holder_identity: String,
    /// Lease duration the holder advertised
    pub lease_duration_seconds: i32,
    /// When the current holder acquired the lease
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the current holder last renewed the lease
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of holder changes over the record's lifetime
    pub lease_transitions: i32,
}

impl LockRecord {
    /// A record naming `holder` as a fresh leader at `now`
    pub fn new_term(
        holder: impl Into<String>,
        lease_duration: Duration,
        now: DateTime<Utc>,
        lease_transitions: i32,
    ) -> Self {
        Self {
            holder_identity: holder.into(),
            lease_duration_seconds: lease_duration.as_secs().min(i32::MAX as u64) as i32,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions,
        }
    }

    /// The same term, renewed at `now`
    pub fn renewed(&self, now: DateTime<Utc>) -> Self {
        Self {
            renew_time: Some(now),
            ..self.clone()
        }
    }

    /// Returns true if no candidate holds the record
    pub fn is_released(&self) -> bool {
        self.holder_identity.is_empty()
    }

    fn to_lease_spec(&self) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.holder_identity.clone()),
            lease_duration_seconds: Some(self.lease_duration_seconds),
            acquire_time: self.acquire_time.map(MicroTime),
            renew_time: self.renew_time.map(MicroTime),
            lease_transitions: Some(self.lease_transitions),
            ..Default::default()
        }
    }

    fn from_lease_spec(spec: Option<&LeaseSpec>) -> Self {
        Self {
            holder_identity: spec
                .and_then(|s| s.holder_identity.clone())
                .unwrap_or_default(),
            lease_duration_seconds: spec.and_then(|s| s.lease_duration_seconds).unwrap_or(0),
            acquire_time: spec.and_then(|s| s.acquire_time.as_ref()).map(|t| t.0),
            renew_time: spec.and_then(|s| s.renew_time.as_ref()).map(|t| t.0),
            lease_transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    }
}

/// A lock record together with the backend's version token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedRecord {
    /// The record contents
    pub record: LockRecord,
    /// Opaque token that must match for a conditional update to succeed
    pub version: String,
}

/// Lock backend errors
#[derive(Debug, Error)]
pub enum LockError {
    /// The record changed since it was read (or already exists on create)
    ///
    /// Not a failure: another candidate won the race.
    #[error("lock record was modified concurrently")]
    Conflict,

    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Backend returned something unusable
    #[error("lock backend error: {0}")]
    Backend(String),

    /// The backend did not answer in time
    #[error("lock backend call timed out after {0:?}")]
    Timeout(Duration),
}

/// Conditional read-modify-write access to a single lock record
///
/// Implementations must make `create` fail with [`LockError::Conflict`]
/// when the record already exists, and `update` fail with
/// [`LockError::Conflict`] when `expected_version` no longer matches.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Address of the record this backend arbitrates
    fn lock_name(&self) -> LockName;

    /// Read the current record, `None` if it does not exist
    async fn get(&self) -> Result<Option<VersionedRecord>, LockError>;

    /// Create the record; conflicts if it already exists
    async fn create(&self, record: &LockRecord) -> Result<VersionedRecord, LockError>;

    /// Overwrite the record if its version still equals `expected_version`
    async fn update(
        &self,
        expected_version: &str,
        record: &LockRecord,
    ) -> Result<VersionedRecord, LockError>;
}

/// Lock backend over a Kubernetes Lease
pub struct LeaseLock {
    api: Api<Lease>,
    name: LockName,
}

impl LeaseLock {
    /// Create a Lease lock using the given (leader-election) client
    pub fn new(client: Client, name: LockName) -> Self {
        Self {
            api: Api::namespaced(client, &name.namespace),
            name,
        }
    }

    fn lease(&self, record: &LockRecord, resource_version: Option<String>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.name.clone()),
                namespace: Some(self.name.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(record.to_lease_spec()),
        }
    }
}

fn versioned_from_lease(lease: Lease) -> Result<VersionedRecord, LockError> {
    let version = lease
        .metadata
        .resource_version
        .clone()
        .ok_or_else(|| LockError::Backend("Lease missing resourceVersion".to_string()))?;
    Ok(VersionedRecord {
        record: LockRecord::from_lease_spec(lease.spec.as_ref()),
        version,
    })
}

#[async_trait]
impl LockBackend for LeaseLock {
    fn lock_name(&self) -> LockName {
        self.name.clone()
    }

    async fn get(&self) -> Result<Option<VersionedRecord>, LockError> {
        match self.api.get(&self.name.name).await {
            Ok(lease) => versioned_from_lease(lease).map(Some),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, record: &LockRecord) -> Result<VersionedRecord, LockError> {
        let lease = self.lease(record, None);
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(created) => versioned_from_lease(created),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(LockError::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        expected_version: &str,
        record: &LockRecord,
    ) -> Result<VersionedRecord, LockError> {
        let lease = self.lease(record, Some(expected_version.to_string()));
        match self
            .api
            .replace(&self.name.name, &PostParams::default(), &lease)
            .await
        {
            Ok(updated) => versioned_from_lease(updated),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(LockError::Conflict),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_spec_keeps_external_schema_fields() {
        let now = Utc::now();
        let record = LockRecord::new_term("host_abc", Duration::from_secs(15), now, 3);
        let spec = record.to_lease_spec();

        assert_eq!(spec.holder_identity.as_deref(), Some("host_abc"));
        assert_eq!(spec.lease_duration_seconds, Some(15));
        assert_eq!(spec.acquire_time.as_ref().map(|t| t.0), Some(now));
        assert_eq!(spec.renew_time.as_ref().map(|t| t.0), Some(now));
        assert_eq!(spec.lease_transitions, Some(3));

        assert_eq!(LockRecord::from_lease_spec(Some(&spec)), record);
    }

    #[test]
    fn missing_spec_reads_as_released() {
        let record = LockRecord::from_lease_spec(None);
        assert!(record.is_released());
        assert_eq!(record.lease_transitions, 0);
        assert!(record.renew_time.is_none());
    }

    #[test]
    fn renewal_keeps_term_fields() {
        let start = Utc::now();
        let record = LockRecord::new_term("a", Duration::from_secs(15), start, 1);
        let later = start + chrono::Duration::seconds(3);
        let renewed = record.renewed(later);

        assert_eq!(renewed.acquire_time, Some(start));
        assert_eq!(renewed.renew_time, Some(later));
        assert_eq!(renewed.lease_transitions, 1);
        assert_eq!(renewed.holder_identity, "a");
    }

    #[test]
    fn lease_without_resource_version_is_rejected() {
        let lease = Lease {
            metadata: ObjectMeta::default(),
            spec: None,
        };
        assert!(matches!(
            versioned_from_lease(lease),
            Err(LockError::Backend(_))
        ));
    }

    #[test]
    fn lock_name_displays_as_namespace_slash_name() {
        let name = LockName::new("mpi-operator", "mpi-operator");
        assert_eq!(name.to_string(), "mpi-operator/mpi-operator");
    }
}
