//! Custom metric exercise for the device defender sample.
//!
//! Registers the custom metrics the report sample publishes, runs the sample
//! once against the provisioned identity and waits for the reports to settle.
//! Every metric is recorded in the ledger so teardown removes it.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{field::display, info};

use crate::identity::DeviceIdentity;
use crate::launcher::{LaunchError, LaunchSpec, Launcher, Platform, resolve_executable};
use crate::ledger::{Ledger, Resource};
use crate::service::{CustomMetric, IdentityService, MetricType, ServiceError};

/// Report sample path relative to the build directory.
pub const REPORT_EXECUTABLE: &str = "samples/device_defender/basic_report/basic_report";
/// Default hard limit on the report sample.
pub const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors raised by the metrics exercise.
#[derive(Debug, Error)]
pub enum DefenderError {
    /// The data endpoint could not be resolved.
    #[error("failed to describe the data endpoint: {0}")]
    Endpoint(#[source] ServiceError),
    /// A custom metric could not be created.
    #[error("failed to create custom metric `{name}`: {source}")]
    Metric {
        /// Metric name.
        name: String,
        /// Provider error.
        #[source]
        source: ServiceError,
    },
    /// The report sample could not be run.
    #[error("failed to run the report sample: {0}")]
    Launch(#[source] LaunchError),
}

/// Result of one exercise.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DefenderOutcome {
    /// Names of the metrics registered.
    pub metrics: Vec<String>,
    /// Exit code of the report sample.
    pub exit_code: Option<i32>,
}

impl DefenderOutcome {
    /// Returns `true` when the report sample exited with code zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Returns `true` on platforms the report sample supports.
#[must_use]
pub const fn platform_supported() -> bool {
    cfg!(target_os = "linux")
}

/// Custom metrics the report sample publishes.
#[must_use]
pub fn custom_metrics() -> Vec<CustomMetric> {
    [
        ("CustomNumber", "DD Custom Number", MetricType::Number),
        ("CustomNumberTwo", "DD Custom Number 2", MetricType::Number),
        ("CustomNumberList", "DD Custom Number list", MetricType::NumberList),
        ("CustomStringList", "DD Custom String list", MetricType::StringList),
        ("CustomIPList", "DD Custom IP list", MetricType::IpAddressList),
        ("cpu_usage", "DD CPU usage", MetricType::Number),
        ("memory_usage", "DD Memory usage", MetricType::Number),
        ("process_count", "DD Process count", MetricType::Number),
    ]
    .into_iter()
    .map(|(name, display_name, metric_type)| CustomMetric {
        name: name.to_owned(),
        display_name: display_name.to_owned(),
        metric_type,
    })
    .collect()
}

/// Runs the report sample against registered custom metrics.
#[derive(Debug)]
pub struct MetricsExercise<'a, S: ?Sized, L: ?Sized> {
    service: &'a S,
    launcher: &'a L,
    executable: Utf8PathBuf,
    report_timeout: Duration,
    settle: Duration,
}

impl<'a, S, L> MetricsExercise<'a, S, L>
where
    S: IdentityService + ?Sized,
    L: Launcher + ?Sized,
{
    /// Creates an exercise resolving the sample under `build_dir`.
    #[must_use]
    pub fn new(service: &'a S, launcher: &'a L, build_dir: &Utf8Path) -> Self {
        Self {
            service,
            launcher,
            executable: resolve_executable(Platform::current(), build_dir, REPORT_EXECUTABLE),
            report_timeout: DEFAULT_REPORT_TIMEOUT,
            settle: Duration::ZERO,
        }
    }

    /// Overrides the hard limit on the report sample.
    #[must_use]
    pub const fn with_report_timeout(mut self, limit: Duration) -> Self {
        self.report_timeout = limit;
        self
    }

    /// Sets how long to wait after the sample exits.
    #[must_use]
    pub const fn with_settle_period(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Registers the metrics, runs the sample and waits for the reports.
    ///
    /// # Errors
    ///
    /// Returns [`DefenderError`] when the endpoint lookup, a metric creation
    /// or the launch fails. Metrics created before the failure stay in
    /// `ledger`.
    pub async fn run(
        &self,
        ledger: &mut Ledger,
        identity: &DeviceIdentity,
    ) -> Result<DefenderOutcome, DefenderError> {
        let endpoint = self
            .service
            .describe_endpoint()
            .await
            .map_err(DefenderError::Endpoint)?;

        let mut metrics = Vec::new();
        for metric in custom_metrics() {
            self.service
                .create_custom_metric(&metric)
                .await
                .map_err(|source| DefenderError::Metric {
                    name: metric.name.clone(),
                    source,
                })?;
            info!(
                metric = display(&metric.name),
                kind = metric.metric_type.as_str(),
                "custom metric created"
            );
            ledger.record(Resource::CustomMetric {
                name: metric.name.clone(),
            });
            metrics.push(metric.name);
        }

        let spec = self.report_spec(&endpoint, identity);
        info!(program = display(&spec.program), "running report sample");
        let outcome = self
            .launcher
            .launch(&spec)
            .await
            .map_err(DefenderError::Launch)?;
        info!(exit_code = ?outcome.exit_code, "report sample exited");

        if !self.settle.is_zero() {
            info!(settle_secs = self.settle.as_secs(), "waiting for reports to settle");
            sleep(self.settle).await;
        }

        Ok(DefenderOutcome {
            metrics,
            exit_code: outcome.exit_code,
        })
    }

    fn report_spec(&self, endpoint: &str, identity: &DeviceIdentity) -> LaunchSpec {
        LaunchSpec::new(self.executable.clone())
            .flag("--endpoint", endpoint)
            .flag("--cert", identity.credentials.certificate.as_str())
            .flag("--key", identity.credentials.private_key.as_str())
            .flag("--thing_name", identity.thing_name.as_str())
            .flag("--count", "1")
            .timeout(Some(self.report_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CredentialFiles;
    use crate::ledger::ResourceKind;
    use crate::test_support::{FakeCloud, RecordingLauncher};
    use rstest::{fixture, rstest};

    #[fixture]
    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            thing_name: String::from("DDTest_1"),
            thing_arn: String::from("arn:aws:iot:us-east-1:123456789012:thing/DDTest_1"),
            certificate_id: String::from("cert-1"),
            certificate_arn: String::from("arn:aws:iot:us-east-1:123456789012:cert/cert-1"),
            policy_name: None,
            credentials: CredentialFiles {
                certificate: Utf8PathBuf::from("/tmp/DDTest_1-certificate.pem.crt"),
                private_key: Utf8PathBuf::from("/tmp/DDTest_1-private.pem.key"),
            },
        }
    }

    #[rstest]
    #[tokio::test]
    async fn registers_metrics_and_runs_the_sample_once(identity: DeviceIdentity) {
        let cloud = FakeCloud::new();
        let launcher = RecordingLauncher::new();
        let mut ledger = Ledger::new();

        let outcome = MetricsExercise::new(&cloud, &launcher, Utf8Path::new("build"))
            .run(&mut ledger, &identity)
            .await
            .expect("exercise should succeed");

        assert!(outcome.is_success());
        assert_eq!(outcome.metrics.len(), 8);
        assert_eq!(cloud.inventory().metrics, 8);
        assert_eq!(ledger.len(), 8);
        assert!(
            ledger
                .entries_in_reverse_order()
                .all(|entry| entry.resource.kind() == ResourceKind::CustomMetric)
        );

        let launches = launcher.launches();
        let spec = launches.first().expect("one launch");
        assert_eq!(launches.len(), 1);
        assert_eq!(
            spec.flag_value("--endpoint"),
            Some("example-ats.iot.us-east-1.amazonaws.com")
        );
        assert_eq!(spec.flag_value("--thing_name"), Some("DDTest_1"));
        assert_eq!(spec.flag_value("--count"), Some("1"));
        assert_eq!(spec.timeout, Some(DEFAULT_REPORT_TIMEOUT));
    }

    #[rstest]
    #[tokio::test]
    async fn metric_failure_keeps_nothing_unrecorded(identity: DeviceIdentity) {
        let cloud = FakeCloud::new();
        cloud.fail_on("create-custom-metric");
        let launcher = RecordingLauncher::new();
        let mut ledger = Ledger::new();

        let err = MetricsExercise::new(&cloud, &launcher, Utf8Path::new("build"))
            .run(&mut ledger, &identity)
            .await
            .expect_err("metric creation should fail");

        assert!(
            matches!(err, DefenderError::Metric { ref name, .. } if name == "CustomNumber"),
            "got {err:?}"
        );
        assert!(ledger.is_empty());
        assert!(launcher.launches().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn failing_sample_is_reported_in_the_outcome(identity: DeviceIdentity) {
        let cloud = FakeCloud::new();
        let launcher = RecordingLauncher::new();
        launcher.push_exit_code(5);
        let mut ledger = Ledger::new();

        let outcome = MetricsExercise::new(&cloud, &launcher, Utf8Path::new("build"))
            .with_report_timeout(Duration::from_secs(5))
            .run(&mut ledger, &identity)
            .await
            .expect("exercise completes");

        assert!(!outcome.is_success());
        assert_eq!(outcome.exit_code, Some(5));
        assert_eq!(ledger.len(), 8);
    }

    #[rstest]
    fn metric_list_covers_every_kind() {
        let metrics = custom_metrics();
        for kind in [
            MetricType::Number,
            MetricType::NumberList,
            MetricType::StringList,
            MetricType::IpAddressList,
        ] {
            assert!(metrics.iter().any(|metric| metric.metric_type == kind));
        }
    }
}
