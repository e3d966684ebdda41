use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use vpn_concentrator::cli::{Args, Config};
use vpn_concentrator::dtls::DtlsListener;
use vpn_concentrator::error::ConcentratorError;
use vpn_concentrator::supervisor::Supervisor;

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(args.log_level.clone()))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error during startup");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), ConcentratorError> {
    let config = Config::try_from(args)?;

    info!(
        port = config.port,
        subnet = %config.nat.subnet_cidr,
        phys_iface = %config.nat.phys_iface,
        "starting vpn concentrator"
    );

    let dtls = DtlsListener::new(
        config.port,
        &config.ca_file,
        &config.cert_file,
        &config.key_file,
    )?;

    let supervisor = Arc::new(Supervisor::new(
        config.cidr,
        dtls,
        config.port,
        config.params_template,
        config.nat,
    ));

    supervisor.run_first()?;

    let shutdown_supervisor = Arc::clone(&supervisor);
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        shutdown_supervisor.shutdown();
        std::process::exit(0);
    })
    .map_err(|e| ConcentratorError::Config(format!("failed to install signal handler: {e}")))?;

    // The data plane runs entirely on the worker threads spawned by
    // `run_first`/`worker::spawn`; the main thread just waits for the
    // ctrlc handler to terminate the process.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
