//! Client resolution
//!
//! Every logical role gets its own client on the same credentials so API
//! server audit logs and priority-and-fairness can tell them apart by
//! user agent. Gang-scheduler clients exist only when gang scheduling is
//! enabled.

use std::fmt;
use std::time::Duration;

use http::header::USER_AGENT;
use http::HeaderValue;
use kube::client::ClientBuilder;
use kube::{Client, Config};
use tower::limit::RateLimitLayer;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use mpi_common::Error;

/// Gang-scheduler name that selects Volcano
pub const VOLCANO_SCHEDULER_NAME: &str = "volcano";

/// Logical client roles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientRole {
    /// Core Kubernetes resources and events
    Operator,
    /// Lease reads and writes
    LeaderElection,
    /// MPIJob resources
    MpiJob,
    /// Volcano pod groups
    Volcano,
    /// scheduler-plugins pod groups
    SchedulerPlugins,
}

impl ClientRole {
    /// User agent sent by clients of this role
    pub fn user_agent(&self) -> &'static str {
        match self {
            ClientRole::Operator => "mpi-operator",
            ClientRole::LeaderElection => "leader-election",
            ClientRole::MpiJob => "mpi-job",
            ClientRole::Volcano => "volcano",
            ClientRole::SchedulerPlugins => "scheduler-plugins",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.user_agent())
    }
}

/// Gang-scheduling backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GangScheduler {
    /// Volcano
    Volcano,
    /// scheduler-plugins coscheduling with the given scheduler name
    SchedulerPlugins {
        /// Scheduler name set on pods
        scheduler_name: String,
    },
}

impl GangScheduler {
    /// Interpret the `--gang-scheduling` value; empty disables gang scheduling
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "" => None,
            VOLCANO_SCHEDULER_NAME => Some(GangScheduler::Volcano),
            other => Some(GangScheduler::SchedulerPlugins {
                scheduler_name: other.to_string(),
            }),
        }
    }

    /// Role of the client this backend needs
    pub fn client_role(&self) -> ClientRole {
        match self {
            GangScheduler::Volcano => ClientRole::Volcano,
            GangScheduler::SchedulerPlugins { .. } => ClientRole::SchedulerPlugins,
        }
    }
}

/// Builds a client for a role
#[cfg_attr(test, automock)]
pub trait ClientFactory: Send + Sync {
    /// Build the client for `role`
    fn build(&self, role: ClientRole) -> Result<Client, Error>;
}

/// Builds rate-limited clients from a resolved kube config
pub struct KubeClientFactory {
    config: Config,
    qps: f64,
    burst: u32,
}

impl KubeClientFactory {
    /// Create a factory; every client may send `burst` requests per `burst / qps` seconds
    pub fn new(config: Config, qps: f64, burst: u32) -> Self {
        Self { config, qps, burst }
    }

    fn rate_limit(&self) -> Result<RateLimitLayer, String> {
        if !self.qps.is_finite() || self.qps <= 0.0 || self.burst == 0 {
            return Err(format!(
                "invalid client rate limit qps={} burst={}",
                self.qps, self.burst
            ));
        }
        let period = Duration::try_from_secs_f64(f64::from(self.burst) / self.qps)
            .map_err(|e| format!("invalid client rate limit period: {}", e))?;
        Ok(RateLimitLayer::new(u64::from(self.burst), period))
    }
}

impl ClientFactory for KubeClientFactory {
    fn build(&self, role: ClientRole) -> Result<Client, Error> {
        let fail = |msg: String| Error::client_construction(role.user_agent(), msg);

        let mut config = self.config.clone();
        config.headers.retain(|(name, _)| name != USER_AGENT);
        config
            .headers
            .push((USER_AGENT, HeaderValue::from_static(role.user_agent())));

        let layer = self.rate_limit().map_err(fail)?;
        let builder = ClientBuilder::try_from(config).map_err(|e| fail(e.to_string()))?;
        Ok(builder.with_layer(&layer).build())
    }
}

/// Clients for every role the operator uses
#[derive(Clone)]
pub struct ClientBundle {
    /// Core resources and events
    pub operator: Client,
    /// Lease access
    pub leader_election: Client,
    /// MPIJob access
    pub mpi_job: Client,
    /// Present only with the Volcano gang scheduler
    pub volcano: Option<Client>,
    /// Present only with the scheduler-plugins gang scheduler
    pub scheduler_plugins: Option<Client>,
    /// Selected gang scheduler
    pub gang_scheduler: Option<GangScheduler>,
}

impl fmt::Debug for ClientBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBundle")
            .field("volcano", &self.volcano.is_some())
            .field("scheduler_plugins", &self.scheduler_plugins.is_some())
            .field("gang_scheduler", &self.gang_scheduler)
            .finish_non_exhaustive()
    }
}

impl ClientBundle {
    /// Returns true if gang scheduling is enabled
    pub fn gang_scheduling_enabled(&self) -> bool {
        self.gang_scheduler.is_some()
    }
}

/// Build the client bundle, failing on the first role that cannot be built
pub fn resolve_clients(
    factory: &dyn ClientFactory,
    gang_scheduler: Option<GangScheduler>,
) -> Result<ClientBundle, Error> {
    let operator = factory.build(ClientRole::Operator)?;
    let leader_election = factory.build(ClientRole::LeaderElection)?;
    let mpi_job = factory.build(ClientRole::MpiJob)?;

    if let Some(GangScheduler::SchedulerPlugins { scheduler_name }) = &gang_scheduler {
        info!(scheduler = %scheduler_name, "Using scheduler-plugins for gang scheduling");
    }
    let gang_client = gang_scheduler
        .as_ref()
        .map(|gang| factory.build(gang.client_role()))
        .transpose()?;
    let (volcano, scheduler_plugins) = match &gang_scheduler {
        Some(GangScheduler::Volcano) => (gang_client, None),
        Some(GangScheduler::SchedulerPlugins { .. }) => (None, gang_client),
        None => (None, None),
    };

    Ok(ClientBundle {
        operator,
        leader_election,
        mpi_job,
        volcano,
        scheduler_plugins,
        gang_scheduler,
    })
}
