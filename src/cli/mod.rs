//! Command-line interface definitions for the `devicerig` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `devicerig` binary.
#[derive(Debug, Parser)]
#[command(
    name = "devicerig",
    about = "Provision throwaway IoT identities and run device conformance checks",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run remote conformance suites against freshly provisioned identities.
    #[command(
        name = "advisor",
        about = "Run remote conformance suites against a provisioned device"
    )]
    Advisor(AdvisorCommand),
    /// Exercise custom metrics with the device defender report sample.
    #[command(
        name = "defender",
        about = "Exercise custom metrics with the report sample"
    )]
    Defender(DefenderCommand),
    /// Run the tunnel sample as destination and source over one session.
    #[command(name = "tunnel", about = "Run the tunnel sample over a fresh session")]
    Tunnel(TunnelCommand),
}

/// Arguments for the `devicerig advisor` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct AdvisorCommand {
    /// JSON file mapping test names to suite definitions and executables.
    #[arg(long, value_name = "PATH")]
    pub(crate) mapping: String,
    /// Test to run; repeat to select several. Runs every mapped test when
    /// omitted.
    #[arg(long = "test", value_name = "NAME")]
    pub(crate) tests: Vec<String>,
    /// Override the configured region for this run.
    #[arg(long, value_name = "REGION")]
    pub(crate) region: Option<String>,
}

/// Arguments for the `devicerig defender` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DefenderCommand {
    /// Override the configured region for this run.
    #[arg(long, value_name = "REGION")]
    pub(crate) region: Option<String>,
}

/// Arguments for the `devicerig tunnel` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct TunnelCommand {
    /// Path to the tunnel sample executable.
    #[arg(long, value_name = "PATH")]
    pub(crate) executable: String,
    /// Override the configured region for this run.
    #[arg(long, value_name = "REGION")]
    pub(crate) region: Option<String>,
}
