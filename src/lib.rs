//! Core library for the devicerig IoT test harness.
//!
//! The crate provisions short-lived device identities, drives remote
//! conformance suites and tunnel sessions against them, and guarantees that
//! every created resource is removed again (provision → drive → teardown).

pub mod advisor;
pub mod cleanup;
pub mod config;
pub mod defender;
pub mod identity;
pub mod launcher;
pub mod ledger;
pub mod process;
pub mod run;
pub mod service;
pub mod test_support;
pub mod tunnel;

pub use advisor::{
    DriveReport, PollSettings, SuiteDriver, SuiteDriverError, TestCase, TestMapping, TestOutcome,
};
pub use cleanup::{CleanupError, ReversalError, TeardownReport, teardown};
pub use config::{ConfigError, HarnessConfig};
pub use defender::{DefenderError, DefenderOutcome, MetricsExercise};
pub use identity::{DeviceIdentity, ProvisionError, Provisioner};
pub use launcher::{LaunchError, LaunchSpec, Launcher, ProcessLauncher};
pub use ledger::{Ledger, LedgerEntry, Resource};
pub use process::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use run::{AdvisorSummary, DefenderRunOutcome, RunError, RunOrchestrator, ctrl_c};
pub use service::{AwsCli, AwsCliConfig, ServiceError};
pub use tunnel::{SessionCoordinator, SessionError, SessionOutcome};
