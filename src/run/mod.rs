//! Orchestrates the three harness variants end to end.
//!
//! Each variant provisions what it needs, drives its workload and tears the
//! ledger down on every exit path, including an interrupt. The drive phase
//! is raced against the interrupt future; once either finishes the ledger is
//! reversed before the result is reported. A failure is always reported as
//! the primary error with any leaked resources appended, and a clean drive
//! followed by a dirty teardown is itself a failure.

use std::future::{Future, pending};

use camino::Utf8Path;
use thiserror::Error;
use tracing::{field::display, info, warn};

use crate::advisor::{
    DeviceUnderTest, SuiteDriver, SuiteDriverError, TestMapping, TestOutcome, select_tests,
};
use crate::cleanup::{TeardownReport, teardown};
use crate::config::{ADVISOR_THING_PREFIX, DEFENDER_THING_PREFIX, HarnessConfig};
use crate::defender::{DefenderError, DefenderOutcome, MetricsExercise, platform_supported};
use crate::identity::{DeviceIdentity, ProvisionError, Provisioner};
use crate::launcher::{Launcher, ProcessSpawner};
use crate::ledger::Ledger;
use crate::service::{IdentityService, ServiceError, ShadowService, SuiteService, TunnelService};
use crate::tunnel::{SessionCoordinator, SessionError, SessionOutcome};

/// Errors surfaced by a harness run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Raised when the device identity could not be created.
    #[error("{message}")]
    Provision {
        /// Human-readable description of the failure, including teardown notes.
        message: String,
        /// Underlying provisioning error.
        #[source]
        source: Box<ProvisionError>,
    },
    /// Raised when the data endpoint could not be resolved.
    #[error("failed to describe the data endpoint: {message}")]
    Endpoint {
        /// Human-readable description of the failure, including teardown notes.
        message: String,
        /// Provider error.
        #[source]
        source: Box<ServiceError>,
    },
    /// Raised when the suite runner stops on an error.
    #[error("{message}")]
    Suite {
        /// Human-readable description of the failure, including teardown notes.
        message: String,
        /// Underlying driver error.
        #[source]
        source: Box<SuiteDriverError>,
    },
    /// Raised when the metrics exercise fails.
    #[error("{message}")]
    Metrics {
        /// Human-readable description of the failure, including teardown notes.
        message: String,
        /// Underlying exercise error.
        #[source]
        source: Box<DefenderError>,
    },
    /// Raised when the tunnel session fails.
    #[error("{message}")]
    Session {
        /// Human-readable description of the failure.
        message: String,
        /// Underlying coordinator error.
        #[source]
        source: Box<SessionError>,
    },
    /// Raised when the run was interrupted; resources were still torn down.
    #[error("{message}")]
    Interrupted {
        /// Human-readable description, including teardown notes.
        message: String,
    },
    /// Raised when teardown fails after the primary operation succeeded.
    #[error("{summary}")]
    Teardown {
        /// Resources that may need manual cleanup.
        summary: String,
    },
}

impl RunError {
    /// Returns `true` when the identity step failed.
    #[must_use]
    pub const fn is_provisioning(&self) -> bool {
        matches!(self, Self::Provision { .. })
    }
}

/// Failure of the drive phase before it is annotated with the teardown.
enum Failure {
    Provision(Box<ProvisionError>),
    Endpoint(Box<ServiceError>),
    Suite(Box<SuiteDriverError>),
    Metrics(Box<DefenderError>),
}

impl Failure {
    fn into_run_error(self, report: &TeardownReport) -> RunError {
        match self {
            Self::Provision(source) => RunError::Provision {
                message: report.annotate(source.to_string()),
                source,
            },
            Self::Endpoint(source) => RunError::Endpoint {
                message: report.annotate(source.to_string()),
                source,
            },
            Self::Suite(source) => RunError::Suite {
                message: report.annotate(source.to_string()),
                source,
            },
            Self::Metrics(source) => RunError::Metrics {
                message: report.annotate(source.to_string()),
                source,
            },
        }
    }
}

/// Verdicts of a completed suite run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdvisorSummary {
    /// Outcomes in execution order.
    pub outcomes: Vec<TestOutcome>,
}

impl AdvisorSummary {
    /// Returns `true` when every test passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(TestOutcome::passed)
    }

    /// Process exit code: zero when every test passed.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.passed())
    }
}

/// Result of the metrics variant.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DefenderRunOutcome {
    /// The platform cannot run the report sample.
    Skipped,
    /// The exercise ran.
    Completed(DefenderOutcome),
}

impl DefenderRunOutcome {
    /// Process exit code: zero when skipped or when the sample succeeded.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Skipped => 0,
            Self::Completed(outcome) => {
                if outcome.is_success() {
                    0
                } else {
                    1
                }
            }
        }
    }
}

/// Runs harness variants against one cloud service.
#[derive(Debug)]
pub struct RunOrchestrator<'a, C: ?Sized> {
    cloud: &'a C,
    config: &'a HarnessConfig,
}

impl<'a, C: ?Sized> RunOrchestrator<'a, C> {
    /// Creates an orchestrator using `config` for every component.
    #[must_use]
    pub const fn new(cloud: &'a C, config: &'a HarnessConfig) -> Self {
        Self { cloud, config }
    }

    /// Provisions a device, drives the selected tests and tears down.
    ///
    /// Unknown test names are rejected before anything is provisioned.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when any phase fails, the run is interrupted, or
    /// teardown leaves resources behind.
    pub async fn run_advisor<L, F>(
        &self,
        launcher: &L,
        mapping: &TestMapping,
        selected: &[String],
        interrupt: F,
    ) -> Result<AdvisorSummary, RunError>
    where
        C: IdentityService + SuiteService + ShadowService,
        L: Launcher + ?Sized,
        F: Future<Output = ()>,
    {
        select_tests(mapping, selected).map_err(|source| RunError::Suite {
            message: source.to_string(),
            source: Box::new(source),
        })?;
        let driver = SuiteDriver::new(self.cloud, launcher, self.config.build_dir())
            .with_settings(self.config.poll_settings())
            .with_launch_timeout(self.config.launch_timeout());

        let mut ledger = Ledger::new();
        let phase = {
            let work = async {
                let identity = self.provision(&mut ledger, ADVISOR_THING_PREFIX).await?;
                let endpoint = self.endpoint().await?;
                let device = DeviceUnderTest {
                    identity: &identity,
                    endpoint: &endpoint,
                };
                let report = driver.run_tests(mapping, selected, device).await;
                match report.error {
                    Some(error) => Err(Failure::Suite(Box::new(error))),
                    None => Ok(AdvisorSummary {
                        outcomes: report.outcomes,
                    }),
                }
            };
            tokio::select! {
                result = work => Some(result),
                () = interrupt => None,
            }
        };
        self.conclude(phase, &mut ledger).await
    }

    /// Provisions a device, runs the metrics exercise and tears down.
    ///
    /// Platforms without the report sample are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when any phase fails, the run is interrupted, or
    /// teardown leaves resources behind.
    pub async fn run_defender<L, F>(
        &self,
        launcher: &L,
        interrupt: F,
    ) -> Result<DefenderRunOutcome, RunError>
    where
        C: IdentityService,
        L: Launcher + ?Sized,
        F: Future<Output = ()>,
    {
        if !platform_supported() {
            info!("report sample is only built on Linux; skipping");
            return Ok(DefenderRunOutcome::Skipped);
        }
        let exercise = MetricsExercise::new(self.cloud, launcher, &self.config.build_dir())
            .with_report_timeout(self.config.report_timeout())
            .with_settle_period(self.config.report_settle());

        let mut ledger = Ledger::new();
        let phase = {
            let work = async {
                let identity = self.provision(&mut ledger, DEFENDER_THING_PREFIX).await?;
                exercise
                    .run(&mut ledger, &identity)
                    .await
                    .map(DefenderRunOutcome::Completed)
                    .map_err(|err| Failure::Metrics(Box::new(err)))
            };
            tokio::select! {
                result = work => Some(result),
                () = interrupt => None,
            }
        };
        self.conclude(phase, &mut ledger).await
    }

    /// Opens a tunnel session and runs both roles of `executable`.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Session`] when the coordinator fails.
    pub async fn run_tunnel<P, F>(
        &self,
        spawner: &P,
        executable: &Utf8Path,
        interrupt: F,
    ) -> Result<SessionOutcome, RunError>
    where
        C: TunnelService,
        P: ProcessSpawner,
        F: Future<Output = ()> + Send,
    {
        SessionCoordinator::new(self.cloud, spawner)
            .with_grace_period(self.config.grace_period())
            .run_session(executable, &self.config.region, interrupt)
            .await
            .map_err(|source| RunError::Session {
                message: source.to_string(),
                source: Box::new(source),
            })
    }

    async fn provision(
        &self,
        ledger: &mut Ledger,
        default_prefix: &str,
    ) -> Result<DeviceIdentity, Failure>
    where
        C: IdentityService,
    {
        Provisioner::new(self.cloud, self.config.credentials_dir())
            .with_policy(self.config.attach_policy)
            .provision(ledger, self.config.thing_prefix_or(default_prefix))
            .await
            .map_err(|err| Failure::Provision(Box::new(err)))
    }

    async fn endpoint(&self) -> Result<String, Failure>
    where
        C: IdentityService,
    {
        let endpoint = self
            .cloud
            .describe_endpoint()
            .await
            .map_err(|err| Failure::Endpoint(Box::new(err)))?;
        info!(endpoint = display(&endpoint), "data endpoint resolved");
        Ok(endpoint)
    }

    async fn conclude<T>(
        &self,
        phase: Option<Result<T, Failure>>,
        ledger: &mut Ledger,
    ) -> Result<T, RunError>
    where
        C: IdentityService,
    {
        let report = teardown(self.cloud, ledger).await;
        match phase {
            None => Err(RunError::Interrupted {
                message: report.annotate(String::from("interrupted before the run completed")),
            }),
            Some(Err(failure)) => Err(failure.into_run_error(&report)),
            Some(Ok(value)) => report
                .leak_summary()
                .map_or(Ok(value), |summary| Err(RunError::Teardown { summary })),
        }
    }
}

/// Resolves when the process receives Ctrl-C.
///
/// Never resolves if the signal handler cannot be installed.
pub async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("interrupt received; cleaning up"),
        Err(err) => {
            warn!(error = display(&err), "failed to listen for interrupts");
            pending::<()>().await;
        }
    }
}
