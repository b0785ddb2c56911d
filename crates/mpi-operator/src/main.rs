//! MPI Operator - runs the MPIJob controller on the elected replica

use clap::Parser;
use tracing::{error, info};

use mpi_common::telemetry::{init_telemetry, TelemetryConfig};
use mpi_operator::bootstrap;
use mpi_operator::options::Options;
use mpi_operator::startup::install_shutdown_handler;
use mpi_operator::version::VersionInfo;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube's rustls client needs a process-wide crypto provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             TLS connections to the API server cannot be made.",
            e
        );
        std::process::exit(1);
    }

    let options = Options::parse();
    if options.print_version {
        println!("{}", VersionInfo::current());
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;
    let shutdown = install_shutdown_handler()?;

    match bootstrap::run(options, shutdown).await {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            let reason = e.exit_reason();
            error!(error = %e, ?reason, "Operator exiting");
            std::process::exit(reason.exit_code());
        }
    }
}

