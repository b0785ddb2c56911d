//! MPIJob custom resource (`kubeflow.org/v2beta1`)
//!
//! Only the fields the control plane touches are modelled precisely; the
//! pod templates are passed through as upstream Kubernetes types.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the MPIJob resource
pub const MPI_JOB_GROUP: &str = "kubeflow.org";
/// Served version of the MPIJob resource
pub const MPI_JOB_VERSION: &str = "v2beta1";
/// Replica type key of the launcher
pub const REPLICA_LAUNCHER: &str = "Launcher";
/// Replica type key of the workers
pub const REPLICA_WORKER: &str = "Worker";

/// Which dependents are deleted once the job finishes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CleanPodPolicy {
    /// Delete no pods
    None,
    /// Delete pods still running
    #[default]
    Running,
    /// Delete every pod
    All,
}

/// Gang-scheduling parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingPolicy {
    /// Pods that must be schedulable together
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i32>,
    /// Scheduler queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Priority class of the pod group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,
    /// Seconds to wait for the whole gang before giving up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_timeout_seconds: Option<i32>,
}

/// Job lifetime policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    /// Pod cleanup after completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,
    /// Delete the job this long after it finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
    /// Terminate the job after running this long
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
    /// Launcher retries before the job is marked failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    /// Gang-scheduling settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
    /// Suspend the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

/// Pod template and count for one replica type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Desired pod count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Pod template
    #[serde(default)]
    pub template: PodTemplateSpec,
    /// Restart policy for the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
}

/// MPI job specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubeflow.org",
    version = "v2beta1",
    kind = "MPIJob",
    plural = "mpijobs",
    namespaced,
    status = "MPIJobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MPIJobSpec {
    /// MPI slots per worker pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots_per_worker: Option<i32>,
    /// Job lifetime policy
    #[serde(default)]
    pub run_policy: RunPolicy,
    /// Replica specs keyed by `Launcher` / `Worker`
    #[serde(rename = "mpiReplicaSpecs")]
    pub mpi_replica_specs: BTreeMap<String, ReplicaSpec>,
    /// MPI implementation (OpenMPI, Intel, MPICH)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpi_implementation: Option<String>,
}

/// A job condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    /// Condition type (Created, Running, Succeeded, ...)
    #[serde(rename = "type")]
    pub type_: String,
    /// True, False or Unknown
    pub status: String,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last time the condition changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

/// Pod counts for one replica type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    /// Running pods
    #[serde(default)]
    pub active: i32,
    /// Pods that succeeded
    #[serde(default)]
    pub succeeded: i32,
    /// Pods that failed
    #[serde(default)]
    pub failed: i32,
}

/// Observed MPIJob state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MPIJobStatus {
    /// Current conditions
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
    /// Pod counts by replica type
    #[serde(default)]
    pub replica_statuses: BTreeMap<String, ReplicaStatus>,
    /// When the job started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    /// When the job finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
}

impl MPIJobStatus {
    /// Returns true if a `Succeeded` or `Failed` condition is true
    pub fn is_finished(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| (c.type_ == "Succeeded" || c.type_ == "Failed") && c.status == "True")
    }
}
