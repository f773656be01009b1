//! Binary entry point for the devicerig CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tracing::{field::display, info};
use tracing_subscriber::EnvFilter;

use devicerig::{
    AwsCli, DefenderRunOutcome, HarnessConfig, ProcessLauncher, RunError, RunOrchestrator,
    TestMapping, ctrl_c,
};

mod cli;

use cli::{AdvisorCommand, Cli, DefenderCommand, TunnelCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("[config] {0}")]
    Config(String),
    #[error("[{component}] {source}")]
    Run {
        component: &'static str,
        #[source]
        source: RunError,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Advisor(command) => run_advisor(command).await,
        Cli::Defender(command) => run_defender(command).await,
        Cli::Tunnel(command) => run_tunnel(command).await,
    }
}

async fn run_advisor(args: AdvisorCommand) -> Result<i32, CliError> {
    let config = load_config(args.region.as_deref())?;
    let mapping = TestMapping::load(Utf8Path::new(&args.mapping))
        .map_err(|err| CliError::Config(err.to_string()))?;
    let cloud = AwsCli::with_process_runner(config.aws_cli());

    let summary = RunOrchestrator::new(&cloud, &config)
        .run_advisor(&ProcessLauncher, &mapping, &args.tests, ctrl_c())
        .await
        .map_err(tagged("device advisor"))?;
    for outcome in &summary.outcomes {
        info!(
            test = display(&outcome.test_name),
            run = display(&outcome.suite_run_id),
            status = display(&outcome.status),
            "verdict"
        );
    }
    Ok(summary.exit_code())
}

async fn run_defender(args: DefenderCommand) -> Result<i32, CliError> {
    let config = load_config(args.region.as_deref())?;
    let cloud = AwsCli::with_process_runner(config.aws_cli());

    let outcome = RunOrchestrator::new(&cloud, &config)
        .run_defender(&ProcessLauncher, ctrl_c())
        .await
        .map_err(tagged("device defender"))?;
    if let DefenderRunOutcome::Completed(completed) = &outcome {
        info!(
            metrics = completed.metrics.len(),
            exit_code = ?completed.exit_code,
            "metrics exercise finished"
        );
    }
    Ok(outcome.exit_code())
}

async fn run_tunnel(args: TunnelCommand) -> Result<i32, CliError> {
    let config = load_config(args.region.as_deref())?;
    let cloud = AwsCli::with_process_runner(config.aws_cli());

    let outcome = RunOrchestrator::new(&cloud, &config)
        .run_tunnel(&ProcessLauncher, Utf8Path::new(&args.executable), ctrl_c())
        .await
        .map_err(tagged("secure tunnel"))?;
    Ok(outcome.exit_code())
}

fn load_config(region: Option<&str>) -> Result<HarnessConfig, CliError> {
    let mut config =
        HarnessConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    if let Some(value) = region {
        value.clone_into(&mut config.region);
    }
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

fn tagged(component: &'static str) -> impl FnOnce(RunError) -> CliError {
    move |source| CliError::Run {
        component: if source.is_provisioning() {
            "identity"
        } else {
            component
        },
        source,
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
