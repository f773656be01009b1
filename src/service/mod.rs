//! Seams for the remote services the harness consumes.
//!
//! Each trait covers one provider API family. Components receive the service
//! value by reference, so a single client constructed per run is threaded
//! through provisioning, polling and teardown without any global state.

use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

mod aws_cli;

pub use aws_cli::{AwsCli, AwsCliConfig};

/// Future returned by service operations.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ServiceError>> + Send + 'a>>;

/// Errors raised by remote service calls.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ServiceError {
    /// Raised when the provider rejects or fails a call.
    #[error("{operation} failed with status {status_text}: {message}")]
    Call {
        /// Provider operation that failed (for example `create-thing`).
        operation: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Error text reported by the provider.
        message: String,
    },
    /// Raised when a response cannot be decoded.
    #[error("failed to parse {operation} response: {message}")]
    Parse {
        /// Provider operation whose response was malformed.
        operation: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when the provider client cannot be started.
    #[error("failed to invoke {operation}: {message}")]
    Unavailable {
        /// Provider operation being attempted.
        operation: String,
        /// Operating system or client error.
        message: String,
    },
}

/// Thing returned by the identity service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThingRecord {
    /// Registered thing name.
    pub thing_name: String,
    /// Amazon resource name of the thing.
    pub thing_arn: String,
}

/// Certificate and key pair returned by the identity service.
#[derive(Clone, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    /// Provider certificate identifier.
    pub certificate_id: String,
    /// Amazon resource name of the certificate.
    pub certificate_arn: String,
    /// PEM encoded certificate.
    pub certificate_pem: String,
    /// Generated key pair.
    pub key_pair: KeyPair,
}

impl std::fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("certificate_id", &self.certificate_id)
            .field("certificate_arn", &self.certificate_arn)
            .finish_non_exhaustive()
    }
}

/// Key material generated alongside a certificate.
#[derive(Clone, Deserialize, Eq, PartialEq)]
pub struct KeyPair {
    /// PEM encoded public key.
    #[serde(rename = "PublicKey")]
    pub public_key: String,
    /// PEM encoded private key.
    #[serde(rename = "PrivateKey")]
    pub private_key: String,
}

/// Target status when updating a certificate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertificateStatus {
    /// Certificate may be used to connect.
    Active,
    /// Certificate is rejected; required before deletion.
    Inactive,
}

impl CertificateStatus {
    /// Provider spelling of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        }
    }
}

/// Value type of a device defender custom metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricType {
    /// Single number.
    Number,
    /// List of numbers.
    NumberList,
    /// List of strings.
    StringList,
    /// List of IP addresses.
    IpAddressList,
}

impl MetricType {
    /// Provider spelling of the metric type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::NumberList => "number-list",
            Self::StringList => "string-list",
            Self::IpAddressList => "ip-address-list",
        }
    }
}

/// Custom metric definition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CustomMetric {
    /// Metric name, unique per account.
    pub name: String,
    /// Console display name.
    pub display_name: String,
    /// Value type.
    pub metric_type: MetricType,
}

/// Status reported for a suite run or a single test case.
///
/// Only [`SuiteStatus::Pending`] and [`SuiteStatus::Running`] are
/// non-terminal. Values the provider adds later are preserved in
/// [`SuiteStatus::Other`] and treated as terminal.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(from = "String")]
pub enum SuiteStatus {
    /// Queued; test groups may not be loaded yet.
    Pending,
    /// Executing.
    Running,
    /// Completed successfully.
    Pass,
    /// Completed with failures.
    Fail,
    /// Stopped by an operator.
    Stopped,
    /// Cancelled before completion.
    Cancelled,
    /// Remote or local wait bound exceeded.
    Timeout,
    /// Remote infrastructure error.
    Error,
    /// Any status not listed above.
    Other(String),
}

impl SuiteStatus {
    /// Returns `true` for every status except PENDING and RUNNING.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Provider spelling of the status.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Stopped => "STOPPED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
            Self::Other(value) => value,
        }
    }
}

impl From<String> for SuiteStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "PASS" => Self::Pass,
            "FAIL" => Self::Fail,
            "STOPPED" => Self::Stopped,
            "CANCELLED" => Self::Cancelled,
            "TIMEOUT" => Self::Timeout,
            "ERROR" => Self::Error,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for SuiteStatus {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}

impl std::fmt::Display for SuiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one test case inside a suite run.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct TestCaseResult {
    /// Test case definition name.
    #[serde(rename = "testCaseDefinitionName", default)]
    pub name: String,
    /// Current status.
    pub status: SuiteStatus,
}

/// Ordered test cases of one group.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct TestGroupResult {
    /// Test cases in execution order.
    #[serde(default)]
    pub tests: Vec<TestCaseResult>,
}

/// Point-in-time view of a suite run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SuiteRunSnapshot {
    /// Overall status.
    pub status: SuiteStatus,
    /// Test groups in execution order; empty until the suite loads them.
    pub groups: Vec<TestGroupResult>,
}

impl SuiteRunSnapshot {
    /// Status of the first test case of the first group, when loaded.
    #[must_use]
    pub fn first_test_status(&self) -> Option<&SuiteStatus> {
        self.groups
            .first()
            .and_then(|group| group.tests.first())
            .map(|test| &test.status)
    }
}

/// Remote tunnel session correlating two local processes.
#[derive(Clone, Eq, PartialEq)]
pub struct SessionHandle {
    /// Provider session identifier.
    pub session_id: String,
    /// Token for the source role.
    pub source_access_token: String,
    /// Token for the destination role.
    pub destination_access_token: String,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Device identity management.
pub trait IdentityService: Send + Sync {
    /// Registers a new thing.
    fn create_thing<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ThingRecord>;

    /// Deletes a thing.
    fn delete_thing<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()>;

    /// Creates an active certificate together with a fresh key pair.
    fn create_keys_and_certificate(&self) -> ServiceFuture<'_, CertificateRecord>;

    /// Changes the status of a certificate.
    fn update_certificate_status<'a>(
        &'a self,
        certificate_id: &'a str,
        status: CertificateStatus,
    ) -> ServiceFuture<'a, ()>;

    /// Force-deletes a certificate. It must be inactive first.
    fn delete_certificate<'a>(&'a self, certificate_id: &'a str) -> ServiceFuture<'a, ()>;

    /// Attaches a principal (certificate ARN) to a thing.
    fn attach_thing_principal<'a>(
        &'a self,
        thing_name: &'a str,
        principal: &'a str,
    ) -> ServiceFuture<'a, ()>;

    /// Detaches a principal from a thing.
    fn detach_thing_principal<'a>(
        &'a self,
        thing_name: &'a str,
        principal: &'a str,
    ) -> ServiceFuture<'a, ()>;

    /// Creates a policy from a JSON document.
    fn create_policy<'a>(&'a self, name: &'a str, document: &'a str) -> ServiceFuture<'a, ()>;

    /// Attaches a policy to a target (certificate ARN).
    fn attach_policy<'a>(&'a self, name: &'a str, target: &'a str) -> ServiceFuture<'a, ()>;

    /// Detaches a policy from a target.
    fn detach_policy<'a>(&'a self, name: &'a str, target: &'a str) -> ServiceFuture<'a, ()>;

    /// Deletes a policy.
    fn delete_policy<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()>;

    /// Returns the data endpoint host devices connect to.
    fn describe_endpoint(&self) -> ServiceFuture<'_, String>;

    /// Registers a custom metric.
    fn create_custom_metric<'a>(&'a self, metric: &'a CustomMetric) -> ServiceFuture<'a, ()>;

    /// Deletes a custom metric.
    fn delete_custom_metric<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()>;
}

/// Remote conformance suite execution.
pub trait SuiteService: Send + Sync {
    /// Starts a suite run against a thing and returns its run id.
    fn start_suite_run<'a>(
        &'a self,
        suite_definition_id: &'a str,
        thing_arn: &'a str,
    ) -> ServiceFuture<'a, String>;

    /// Fetches the current state of a suite run.
    fn get_suite_run<'a>(
        &'a self,
        suite_definition_id: &'a str,
        suite_run_id: &'a str,
    ) -> ServiceFuture<'a, SuiteRunSnapshot>;
}

/// Device shadow documents.
pub trait ShadowService: Send + Sync {
    /// Replaces the shadow state with `document`.
    fn update_shadow<'a>(&'a self, thing_name: &'a str, document: &'a Value)
    -> ServiceFuture<'a, ()>;

    /// Fetches the shadow document, `None` when the thing has no shadow yet.
    fn get_shadow<'a>(&'a self, thing_name: &'a str) -> ServiceFuture<'a, Option<Value>>;
}

/// Brokered tunnel sessions.
pub trait TunnelService: Send + Sync {
    /// Opens a session and returns both role tokens.
    fn open_session(&self) -> ServiceFuture<'_, SessionHandle>;

    /// Closes and deletes a session.
    fn close_session<'a>(&'a self, session_id: &'a str) -> ServiceFuture<'a, ()>;
}
