//! Drives remote conformance suites against a provisioned identity.
//!
//! For each selected test case the driver optionally seeds the device shadow,
//! starts a suite run, and polls it at a fixed interval. The local executable
//! is launched when the suite and its first test case both report RUNNING,
//! and polling ends on the first terminal suite status or when the maximum
//! wait elapses.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, field::display, info, warn};

use crate::identity::DeviceIdentity;
use crate::launcher::{LaunchError, LaunchSpec, Launcher, Platform, resolve_executable};
use crate::service::{ServiceError, ShadowService, SuiteService, SuiteStatus};

mod mapping;
mod state;

pub use mapping::{MappingError, ShadowBaseline, TestCase, TestMapping};
pub use state::{PollAction, RunEvent, SuiteState, apply_event, next_state};

/// Polling never runs faster than this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Default delay between suite polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default bound on polling a single suite run.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30 * 60);

/// Environment variable carrying the data endpoint.
pub const ENV_ENDPOINT: &str = "DA_ENDPOINT";
/// Environment variable carrying the certificate path.
pub const ENV_CERTIFICATE: &str = "DA_CERTI";
/// Environment variable carrying the private key path.
pub const ENV_KEY: &str = "DA_KEY";
/// Environment variable carrying the thing name.
pub const ENV_THING_NAME: &str = "DA_THING_NAME";
/// Environment variable carrying the MQTT topic.
pub const ENV_TOPIC: &str = "DA_TOPIC";
/// Environment variable carrying the shadow property.
pub const ENV_SHADOW_PROPERTY: &str = "DA_SHADOW_PROPERTY";
/// Environment variable carrying the shadow value to set.
pub const ENV_SHADOW_VALUE: &str = "DA_SHADOW_VALUE_SET";

/// Interval and bound used while polling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSettings {
    interval: Duration,
    max_wait: Duration,
}

impl PollSettings {
    /// Creates settings, raising `interval` to [`MIN_POLL_INTERVAL`].
    #[must_use]
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval: interval.max(MIN_POLL_INTERVAL),
            max_wait,
        }
    }

    /// Delay between polls.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Maximum time spent polling one suite run or shadow baseline.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        self.max_wait
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_WAIT)
    }
}

/// Errors that stop the driver.
#[derive(Debug, Error)]
pub enum SuiteDriverError {
    /// A selected test is not in the mapping.
    #[error("test `{name}` is not defined in the test mapping")]
    UnknownTest {
        /// Requested test name.
        name: String,
    },
    /// A remote call failed.
    #[error(
        "remote call for test `{test}` failed (suite run {}): {source}",
        .suite_run_id.as_deref().unwrap_or("not started")
    )]
    Remote {
        /// Test being driven.
        test: String,
        /// Last suite run identifier, if the run was started.
        suite_run_id: Option<String>,
        /// Provider error.
        #[source]
        source: ServiceError,
    },
    /// The local executable could not be run.
    #[error("failed to run the executable for test `{test}` (suite run {suite_run_id}): {source}")]
    Launch {
        /// Test being driven.
        test: String,
        /// Suite run the executable was launched for.
        suite_run_id: String,
        /// Launcher error.
        #[source]
        source: LaunchError,
    },
    /// The shadow baseline never became visible.
    #[error(
        "shadow property `{property}` for test `{test}` was not reported within {} seconds",
        .waited.as_secs()
    )]
    BaselineTimeout {
        /// Test being driven.
        test: String,
        /// Shadow property that was awaited.
        property: String,
        /// Time spent waiting.
        waited: Duration,
    },
}

/// Result of driving one test case.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestOutcome {
    /// Test case name.
    pub test_name: String,
    /// Suite run identifier.
    pub suite_run_id: String,
    /// Final verdict.
    pub status: SuiteStatus,
    /// Number of times the executable was launched.
    pub launches: u32,
    /// Exit code of the last launch.
    pub exit_code: Option<i32>,
    /// `true` when polling stopped because the maximum wait elapsed.
    pub deadline_exceeded: bool,
}

impl TestOutcome {
    /// Returns `true` when the suite passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == SuiteStatus::Pass
    }
}

/// Outcomes of every test driven, plus the error that stopped the driver.
#[derive(Debug, Default)]
pub struct DriveReport {
    /// Completed outcomes in execution order.
    pub outcomes: Vec<TestOutcome>,
    /// Error that stopped the remaining tests.
    pub error: Option<SuiteDriverError>,
}

impl DriveReport {
    /// Returns `true` when every test ran and passed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.outcomes.iter().all(TestOutcome::passed)
    }
}

/// Device the suites run against.
#[derive(Clone, Copy, Debug)]
pub struct DeviceUnderTest<'a> {
    /// Provisioned identity.
    pub identity: &'a DeviceIdentity,
    /// Data endpoint devices connect to.
    pub endpoint: &'a str,
}

/// Runs mapped tests one at a time against a single device.
#[derive(Debug)]
pub struct SuiteDriver<'a, C: ?Sized, L: ?Sized> {
    cloud: &'a C,
    launcher: &'a L,
    build_dir: Utf8PathBuf,
    platform: Platform,
    settings: PollSettings,
    launch_timeout: Option<Duration>,
}

impl<'a, C, L> SuiteDriver<'a, C, L>
where
    C: SuiteService + ShadowService + ?Sized,
    L: Launcher + ?Sized,
{
    /// Creates a driver resolving executables under `build_dir`.
    #[must_use]
    pub fn new(cloud: &'a C, launcher: &'a L, build_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cloud,
            launcher,
            build_dir: build_dir.into(),
            platform: Platform::current(),
            settings: PollSettings::default(),
            launch_timeout: None,
        }
    }

    /// Overrides the polling settings.
    #[must_use]
    pub const fn with_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Overrides the platform used to resolve executables.
    #[must_use]
    pub const fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Applies a hard timeout to every launch.
    #[must_use]
    pub const fn with_launch_timeout(mut self, limit: Option<Duration>) -> Self {
        self.launch_timeout = limit;
        self
    }

    /// Drives `selected` tests in order, or every mapped test when empty.
    ///
    /// Unknown names are rejected before any suite starts. The first error
    /// stops the remaining tests; completed outcomes are kept.
    pub async fn run_tests(
        &self,
        mapping: &TestMapping,
        selected: &[String],
        device: DeviceUnderTest<'_>,
    ) -> DriveReport {
        let tests = match select_tests(mapping, selected) {
            Ok(tests) => tests,
            Err(error) => {
                return DriveReport {
                    outcomes: Vec::new(),
                    error: Some(error),
                };
            }
        };

        let mut report = DriveReport::default();
        for test in tests {
            match self.run_test(test, device).await {
                Ok(outcome) => {
                    info!(
                        test = display(&outcome.test_name),
                        status = display(&outcome.status),
                        launches = outcome.launches,
                        "test finished"
                    );
                    report.outcomes.push(outcome);
                }
                Err(error) => {
                    warn!(
                        test = display(&test.name),
                        error = display(&error),
                        "stopping remaining tests"
                    );
                    report.error = Some(error);
                    break;
                }
            }
        }
        report
    }

    /// Drives a single test case to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteDriverError`] when a remote call or the launch fails, or
    /// when the shadow baseline never appears.
    pub async fn run_test(
        &self,
        test: &TestCase,
        device: DeviceUnderTest<'_>,
    ) -> Result<TestOutcome, SuiteDriverError> {
        let thing_name = device.identity.thing_name.as_str();
        if let Some(baseline) = &test.shadow {
            self.establish_baseline(test, thing_name, baseline).await?;
        }

        info!(
            test = display(&test.name),
            suite = display(&test.suite_definition_id),
            "starting suite run"
        );
        let mut state = SuiteState::Starting;
        let suite_run_id = self
            .cloud
            .start_suite_run(&test.suite_definition_id, &device.identity.thing_arn)
            .await
            .map_err(|source| {
                abandon(
                    test,
                    state,
                    SuiteDriverError::Remote {
                        test: test.name.clone(),
                        suite_run_id: None,
                        source,
                    },
                )
            })?;
        state = enter(test, state, apply_event(state, RunEvent::Started));

        let spec = self.launch_spec(test, device);
        let deadline = Instant::now() + self.settings.max_wait();
        let mut launches = 0;
        let mut exit_code = None;
        loop {
            let snapshot = self
                .cloud
                .get_suite_run(&test.suite_definition_id, &suite_run_id)
                .await
                .map_err(|source| {
                    abandon(
                        test,
                        state,
                        SuiteDriverError::Remote {
                            test: test.name.clone(),
                            suite_run_id: Some(suite_run_id.clone()),
                            source,
                        },
                    )
                })?;
            let (next, action) = next_state(state, &snapshot);
            state = enter(test, state, next);

            match action {
                PollAction::Finish(status) => {
                    return Ok(TestOutcome {
                        test_name: test.name.clone(),
                        suite_run_id,
                        status,
                        launches,
                        exit_code,
                        deadline_exceeded: false,
                    });
                }
                PollAction::Launch => {
                    launches += 1;
                    info!(
                        test = display(&test.name),
                        program = display(&spec.program),
                        "launching test executable"
                    );
                    let outcome = self.launcher.launch(&spec).await.map_err(|source| {
                        abandon(
                            test,
                            state,
                            SuiteDriverError::Launch {
                                test: test.name.clone(),
                                suite_run_id: suite_run_id.clone(),
                                source,
                            },
                        )
                    })?;
                    info!(
                        test = display(&test.name),
                        exit_code = ?outcome.exit_code,
                        "test executable exited"
                    );
                    exit_code = outcome.exit_code;
                }
                PollAction::Wait => {}
            }

            if Instant::now() >= deadline {
                warn!(
                    test = display(&test.name),
                    run = display(&suite_run_id),
                    "maximum wait elapsed"
                );
                return Ok(TestOutcome {
                    test_name: test.name.clone(),
                    suite_run_id,
                    status: SuiteStatus::Timeout,
                    launches,
                    exit_code,
                    deadline_exceeded: true,
                });
            }
            sleep(self.settings.interval()).await;
        }
    }

    async fn establish_baseline(
        &self,
        test: &TestCase,
        thing_name: &str,
        baseline: &ShadowBaseline,
    ) -> Result<(), SuiteDriverError> {
        let remote_error = |source| SuiteDriverError::Remote {
            test: test.name.clone(),
            suite_run_id: None,
            source,
        };
        let property = baseline.property.as_str();
        let value = baseline.value.as_str();
        let document = json!({
            "state": {
                "desired": { property: value },
                "reported": { property: value },
            }
        });
        info!(test = display(&test.name), property, "seeding shadow baseline");
        self.cloud
            .update_shadow(thing_name, &document)
            .await
            .map_err(remote_error)?;

        let started = Instant::now();
        let deadline = started + self.settings.max_wait();
        loop {
            let shadow = self
                .cloud
                .get_shadow(thing_name)
                .await
                .map_err(remote_error)?;
            if shadow.as_ref().is_some_and(|doc| reports(doc, property)) {
                debug!(test = display(&test.name), "shadow baseline visible");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SuiteDriverError::BaselineTimeout {
                    test: test.name.clone(),
                    property: baseline.property.clone(),
                    waited: started.elapsed(),
                });
            }
            sleep(self.settings.interval()).await;
        }
    }

    fn launch_spec(&self, test: &TestCase, device: DeviceUnderTest<'_>) -> LaunchSpec {
        let program = resolve_executable(self.platform, &self.build_dir, &test.executable);
        let identity = device.identity;
        let mut spec = LaunchSpec::new(program)
            .env(ENV_ENDPOINT, device.endpoint)
            .env(ENV_CERTIFICATE, identity.credentials.certificate.as_str())
            .env(ENV_KEY, identity.credentials.private_key.as_str())
            .env(ENV_THING_NAME, identity.thing_name.as_str())
            .timeout(self.launch_timeout);
        if let Some(topic) = &test.topic {
            spec = spec.env(ENV_TOPIC, topic.as_str());
        }
        if let Some(baseline) = &test.shadow {
            spec = spec
                .env(ENV_SHADOW_PROPERTY, baseline.property.as_str())
                .env(ENV_SHADOW_VALUE, baseline.value.as_str());
        }
        spec
    }
}

fn enter(test: &TestCase, from: SuiteState, to: SuiteState) -> SuiteState {
    if from != to {
        debug!(test = display(&test.name), from = ?from, to = ?to, "suite state changed");
    }
    to
}

fn abandon(test: &TestCase, from: SuiteState, error: SuiteDriverError) -> SuiteDriverError {
    let to = apply_event(from, RunEvent::Errored);
    warn!(
        test = display(&test.name),
        from = ?from,
        to = ?to,
        error = display(&error),
        "suite polling abandoned"
    );
    error
}

fn reports(document: &Value, property: &str) -> bool {
    document
        .get("state")
        .and_then(|state| state.get("reported"))
        .and_then(|reported| reported.get(property))
        .is_some()
}

/// Resolves `selected` names against `mapping`, or every test when empty.
///
/// # Errors
///
/// Returns [`SuiteDriverError::UnknownTest`] for the first unmapped name.
pub fn select_tests<'m>(
    mapping: &'m TestMapping,
    selected: &[String],
) -> Result<Vec<&'m TestCase>, SuiteDriverError> {
    if selected.is_empty() {
        return Ok(mapping.tests().iter().collect());
    }
    selected
        .iter()
        .map(|name| {
            mapping
                .find(name)
                .ok_or_else(|| SuiteDriverError::UnknownTest { name: name.clone() })
        })
        .collect()
}
