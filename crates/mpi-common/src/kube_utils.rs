//! Connection configuration for the Kubernetes API
//!
//! Resolves where the API server is and which credentials to use, the
//! same way for every client the operator builds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Config;
use tracing::debug;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable that overrides the `--kubeconfig` flag
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Where to find the API server and credentials
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// API server URL; overrides the server named in the kubeconfig
    pub master: Option<String>,
    /// Path to a kubeconfig file
    pub kubeconfig: Option<PathBuf>,
}

impl ConnectionConfig {
    /// Combine flag values with the environment
    ///
    /// Empty strings mean "unset". A non-empty `KUBECONFIG` wins over the
    /// flag.
    pub fn from_flags(master: &str, kubeconfig_flag: &str, kubeconfig_env: Option<&str>) -> Self {
        Self {
            master: non_empty(master).map(str::to_string),
            kubeconfig: resolve_kubeconfig(kubeconfig_flag, kubeconfig_env),
        }
    }
}

/// Pick the kubeconfig path; the environment value takes precedence
pub fn resolve_kubeconfig(flag: &str, env: Option<&str>) -> Option<PathBuf> {
    env.and_then(non_empty)
        .or_else(|| non_empty(flag))
        .map(PathBuf::from)
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

/// Build a client configuration with default timeouts
///
/// - kubeconfig set: load it, then apply `master` if given
/// - only `master` set: talk to that URL with no credentials
/// - neither: in-cluster service account, falling back to the local kubeconfig
pub async fn build_config(connection: &ConnectionConfig) -> Result<Config, Error> {
    let mut config = match (&connection.kubeconfig, &connection.master) {
        (Some(path), master) => {
            let mut config = load_kubeconfig(path).await?;
            if let Some(master) = master {
                config.cluster_url = parse_master(master)?;
            }
            config
        }
        (None, Some(master)) => Config::new(parse_master(master)?),
        (None, None) => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };

    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    debug!(cluster_url = %config.cluster_url, "Resolved API server");
    Ok(config)
}

async fn load_kubeconfig(path: &Path) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::config(format!(
            "failed to read kubeconfig {}: {}",
            path.display(),
            e
        ))
    })?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))
}

fn parse_master(master: &str) -> Result<http::Uri, Error> {
    master
        .parse::<http::Uri>()
        .map_err(|e| Error::config(format!("invalid master URL {:?}: {}", master, e)))
}
