//! ktest binary entrypoint.
//!
//! Wires the CLI, defaults file, pre-flight checks, and the virsh
//! backend into one session run, then maps the terminal outcome to the
//! process exit code. Logs go to stderr; the outcome summary goes to
//! stdout.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ktest::cli::Cli;
use ktest::config::FileConfig;
use ktest::error::SessionError;
use ktest::hypervisor::VirshHypervisor;
use ktest::session::{SessionOrchestrator, SessionResult};
use ktest::spec::SpecError;
use ktest::{deps, Hypervisor};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("KTEST_LOG").unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(result) => {
            report(&result);
            ExitCode::from(result.exit_code() as u8)
        }
        Err(e) => {
            error!(error = %e, "Session aborted");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<SessionResult, SessionError> {
    deps::check_host_dependencies()?;

    let defaults = FileConfig::load().map_err(|e| SessionError::Provision(e.to_string()))?;
    let (spec, uri) = cli.into_spec(defaults).map_err(|e| match e {
        SpecError::InvalidSize(s) => SessionError::InvalidSize(s),
        other => SessionError::Provision(other.to_string()),
    })?;

    let hv = VirshHypervisor::connect(&uri)
        .await
        .map_err(|e| SessionError::HypervisorUnavailable {
            uri: uri.clone(),
            reason: e.to_string(),
        })?;
    let hv: Arc<dyn Hypervisor> = Arc::new(hv);

    SessionOrchestrator::new(hv, spec).run().await
}

fn report(result: &SessionResult) {
    println!("outcome: {}", result.outcome);
    if let Some(cause) = &result.cause {
        println!("cause: {cause}");
    }
    if let Some(log) = &result.console_log {
        println!("console log: {}", log.display());
    }
    if let Some(dump) = &result.kdump_image {
        println!("crash dump: {}", dump.display());
    }
    for failure in &result.cleanup_failures {
        println!("cleanup failure: {failure}");
    }
}
