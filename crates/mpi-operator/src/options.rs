//! Command-line options

use clap::Parser;

use mpi_common::health::DEFAULT_HEALTHZ_PORT;
use mpi_common::kube_utils::ConnectionConfig;
use mpi_common::workqueue::{RateLimiterSpec, DEFAULT_QUEUE_BURST, DEFAULT_QUEUE_QPS};
use mpi_common::{Error, DEFAULT_LOCK_NAMESPACE};

use crate::startup::GangScheduler;

/// MPI operator: runs the MPIJob controller on the elected replica
#[derive(Parser, Clone, Debug, PartialEq)]
#[command(name = "mpi-operator", disable_version_flag = true)]
pub struct Options {
    /// Address of the Kubernetes API server; overrides any value in kubeconfig
    #[arg(long, default_value = "")]
    pub master: String,

    /// Path to a kubeconfig; the KUBECONFIG environment variable takes precedence
    #[arg(long, default_value = "")]
    pub kubeconfig: String,

    /// Maximum QPS to the Kubernetes API server
    #[arg(long = "kube-api-qps", default_value_t = 5.0)]
    pub qps: f64,

    /// Maximum burst for throttle to the Kubernetes API server
    #[arg(long = "kube-api-burst", default_value_t = 10)]
    pub burst: u32,

    /// Namespace to watch; all namespaces when empty
    #[arg(long, default_value = "")]
    pub namespace: String,

    /// Gang scheduler: "volcano", or the scheduler name of scheduler-plugins
    #[arg(long = "gang-scheduling", default_value = "")]
    pub gang_scheduling: String,

    /// Retry rate limit of the controller queue (items per second)
    #[arg(long = "controller-queue-rate-limit", default_value_t = DEFAULT_QUEUE_QPS)]
    pub controller_rate_limit: f64,

    /// Retry burst of the controller queue
    #[arg(long = "controller-queue-burst", default_value_t = DEFAULT_QUEUE_BURST)]
    pub controller_burst: u32,

    /// Number of concurrent reconcile workers
    #[arg(long, default_value_t = 2)]
    pub threadiness: usize,

    /// Namespace of the leader election Lease
    #[arg(long = "lock-namespace", default_value = DEFAULT_LOCK_NAMESPACE)]
    pub lock_namespace: String,

    /// Print version information and exit
    #[arg(long = "version")]
    pub print_version: bool,

    /// Port of the /healthz endpoint
    #[arg(long = "healthz-port", default_value_t = DEFAULT_HEALTHZ_PORT)]
    pub healthz_port: u16,
}

impl Options {
    /// Reject values the clients or the queue cannot work with
    pub fn validate(&self) -> Result<(), Error> {
        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Err(Error::config(format!(
                "--kube-api-qps must be positive, got {}",
                self.qps
            )));
        }
        if self.burst == 0 {
            return Err(Error::config("--kube-api-burst must be at least 1"));
        }
        if self.threadiness == 0 {
            return Err(Error::config("--threadiness must be at least 1"));
        }
        if self.lock_namespace.trim().is_empty() {
            return Err(Error::config("--lock-namespace must not be empty"));
        }
        self.rate_limiter_spec().validate()
    }

    /// Namespace scope, `None` for cluster-wide
    pub fn namespace_scope(&self) -> Option<&str> {
        let ns = self.namespace.trim();
        (!ns.is_empty()).then_some(ns)
    }

    /// Selected gang scheduler, if any
    pub fn gang_scheduler(&self) -> Option<GangScheduler> {
        GangScheduler::from_name(&self.gang_scheduling)
    }

    /// Retry policy of the controller queue
    pub fn rate_limiter_spec(&self) -> RateLimiterSpec {
        RateLimiterSpec::with_bucket(self.controller_rate_limit, self.controller_burst)
    }

    /// API server location, honouring `KUBECONFIG` from `env`
    pub fn connection(&self, kubeconfig_env: Option<&str>) -> ConnectionConfig {
        ConnectionConfig::from_flags(&self.master, &self.kubeconfig, kubeconfig_env)
    }
}
