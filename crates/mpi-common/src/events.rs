//! Leadership transitions recorded as Kubernetes Events on the Lease
//!
//! Publishing is best effort. A failed write is logged and dropped; the
//! election loop never waits on or fails because of an event.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::election::LockName;

/// Sink for leadership events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `reason`/`action` on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `component`.
    ///
    /// `instance` is the candidate identity, so events from different
    /// replicas can be told apart.
    pub fn new(client: Client, component: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.into(),
            note,
            action: action.into(),
            secondary: None,
        };
        let lease = resource_ref.name.as_deref().unwrap_or_default();
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(lease, reason, action, error = %e, "Failed to record leader election event");
        }
    }
}

/// Discards every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Object reference for the Lease backing `lock`
pub fn lease_reference(lock: &LockName) -> ObjectReference {
    ObjectReference {
        api_version: Some("coordination.k8s.io/v1".to_string()),
        kind: Some("Lease".to_string()),
        namespace: Some(lock.namespace.clone()),
        name: Some(lock.name.clone()),
        ..Default::default()
    }
}

/// Event reasons and actions
pub mod reasons {
    /// Leadership changed hands
    pub const LEADER_ELECTION: &str = "LeaderElection";
    /// This candidate acquired the lease
    pub const ACTION_ACQUIRE: &str = "Acquire";
    /// This candidate stopped leading
    pub const ACTION_RELEASE: &str = "Release";
}
