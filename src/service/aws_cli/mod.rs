//! Service implementation that shells out to the `aws` CLI.
//!
//! Every call runs `aws <service> <operation> ... --region <r> --output json`
//! through a [`CommandRunner`] and decodes the JSON written to stdout.

use std::ffi::OsString;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::task;
use tracing::{debug, field::display};

use crate::process::{CommandRunner, ProcessCommandRunner, render_command_line};

use super::{
    CertificateRecord, CertificateStatus, CustomMetric, IdentityService, ServiceError,
    ServiceFuture, SessionHandle, ShadowService, SuiteRunSnapshot, SuiteService, SuiteStatus,
    TestGroupResult, ThingRecord, TunnelService,
};

const ENDPOINT_TYPE: &str = "iot:Data-ATS";
const MISSING_SHADOW_MARKER: &str = "ResourceNotFoundException";

/// Connection settings for the `aws` CLI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AwsCliConfig {
    /// Path to the `aws` executable.
    pub aws_bin: String,
    /// Region every call is scoped to.
    pub region: String,
    /// Optional named profile.
    pub profile: Option<String>,
}

/// Cloud service backed by the `aws` CLI.
///
/// Each call runs on the blocking pool, so a pending call never stalls the
/// runtime and dropping its future stops waiting on it.
#[derive(Clone, Debug)]
pub struct AwsCli<R: CommandRunner> {
    config: AwsCliConfig,
    runner: Arc<R>,
}

impl AwsCli<ProcessCommandRunner> {
    /// Creates a client wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(config: AwsCliConfig) -> Self {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner + 'static> AwsCli<R> {
    /// Creates a client using the provided runner.
    #[must_use]
    pub fn new(config: AwsCliConfig, runner: R) -> Self {
        Self {
            config,
            runner: Arc::new(runner),
        }
    }

    /// Returns the CLI settings.
    #[must_use]
    pub const fn config(&self) -> &AwsCliConfig {
        &self.config
    }

    fn build_args(&self, service: &str, operation: &str, params: Vec<OsString>) -> Vec<OsString> {
        let mut args = Vec::with_capacity(params.len() + 8);
        args.push(OsString::from(service));
        args.push(OsString::from(operation));
        args.extend(params);
        args.push(OsString::from("--region"));
        args.push(OsString::from(&self.config.region));
        if let Some(profile) = &self.config.profile {
            args.push(OsString::from("--profile"));
            args.push(OsString::from(profile));
        }
        args.push(OsString::from("--output"));
        args.push(OsString::from("json"));
        args
    }

    async fn invoke(
        &self,
        service: &str,
        operation: &str,
        params: Vec<OsString>,
    ) -> Result<String, ServiceError> {
        let args = self.build_args(service, operation, params);
        debug!(
            command = display(render_command_line(&self.config.aws_bin, &args)),
            "invoking provider CLI"
        );
        let unavailable = |message: String| ServiceError::Unavailable {
            operation: operation.to_owned(),
            message,
        };
        let runner = Arc::clone(&self.runner);
        let program = self.config.aws_bin.clone();
        let output = task::spawn_blocking(move || runner.run(&program, &args))
            .await
            .map_err(|err| unavailable(err.to_string()))?
            .map_err(|err| unavailable(err.to_string()))?;

        if output.is_success() {
            return Ok(output.stdout);
        }

        Err(ServiceError::Call {
            operation: operation.to_owned(),
            status_text: output.status_text(),
            message: output.stderr.trim().to_owned(),
        })
    }

    async fn invoke_json<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        params: Vec<OsString>,
    ) -> Result<T, ServiceError> {
        let stdout = self.invoke(service, operation, params).await?;
        parse_first_value(operation, &stdout)
    }

    async fn iot(&self, operation: &str, params: Vec<OsString>) -> Result<(), ServiceError> {
        self.invoke("iot", operation, params).await.map(drop)
    }
}

/// Decodes the first JSON value in `stdout`.
///
/// Commands that write a payload to `/dev/stdout` follow it with their own
/// response metadata, so trailing content is ignored.
fn parse_first_value<T: DeserializeOwned>(
    operation: &str,
    stdout: &str,
) -> Result<T, ServiceError> {
    let parse_error = |message: String| ServiceError::Parse {
        operation: operation.to_owned(),
        message,
    };
    serde_json::Deserializer::from_str(stdout)
        .into_iter::<T>()
        .next()
        .ok_or_else(|| parse_error(String::from("empty response")))?
        .map_err(|err| parse_error(err.to_string()))
}

fn os(value: &str) -> OsString {
    OsString::from(value)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointResponse {
    endpoint_address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSuiteRunResponse {
    suite_run_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetSuiteRunResponse {
    #[serde(default = "pending")]
    status: SuiteStatus,
    #[serde(default)]
    test_result: Option<TestResultResponse>,
}

#[derive(Deserialize)]
struct TestResultResponse {
    #[serde(default)]
    groups: Vec<TestGroupResult>,
}

fn pending() -> SuiteStatus {
    SuiteStatus::Pending
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenTunnelResponse {
    tunnel_id: String,
    source_access_token: String,
    destination_access_token: String,
}

impl<R: CommandRunner + 'static> IdentityService for AwsCli<R> {
    fn create_thing<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ThingRecord> {
        Box::pin(async move {
            self.invoke_json("iot", "create-thing", vec![os("--thing-name"), os(name)])
                .await
        })
    }

    fn delete_thing<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot("delete-thing", vec![os("--thing-name"), os(name)])
                .await
        })
    }

    fn create_keys_and_certificate(&self) -> ServiceFuture<'_, CertificateRecord> {
        Box::pin(async move {
            self.invoke_json(
                "iot",
                "create-keys-and-certificate",
                vec![os("--set-as-active")],
            )
            .await
        })
    }

    fn update_certificate_status<'a>(
        &'a self,
        certificate_id: &'a str,
        status: CertificateStatus,
    ) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot(
                "update-certificate",
                vec![
                    os("--certificate-id"),
                    os(certificate_id),
                    os("--new-status"),
                    os(status.as_str()),
                ],
            )
            .await
        })
    }

    fn delete_certificate<'a>(&'a self, certificate_id: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot(
                "delete-certificate",
                vec![
                    os("--certificate-id"),
                    os(certificate_id),
                    os("--force-delete"),
                ],
            )
            .await
        })
    }

    fn attach_thing_principal<'a>(
        &'a self,
        thing_name: &'a str,
        principal: &'a str,
    ) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot(
                "attach-thing-principal",
                vec![
                    os("--thing-name"),
                    os(thing_name),
                    os("--principal"),
                    os(principal),
                ],
            )
            .await
        })
    }

    fn detach_thing_principal<'a>(
        &'a self,
        thing_name: &'a str,
        principal: &'a str,
    ) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot(
                "detach-thing-principal",
                vec![
                    os("--thing-name"),
                    os(thing_name),
                    os("--principal"),
                    os(principal),
                ],
            )
            .await
        })
    }

    fn create_policy<'a>(&'a self, name: &'a str, document: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot(
                "create-policy",
                vec![
                    os("--policy-name"),
                    os(name),
                    os("--policy-document"),
                    os(document),
                ],
            )
            .await
        })
    }

    fn attach_policy<'a>(&'a self, name: &'a str, target: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot(
                "attach-policy",
                vec![os("--policy-name"), os(name), os("--target"), os(target)],
            )
            .await
        })
    }

    fn detach_policy<'a>(&'a self, name: &'a str, target: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot(
                "detach-policy",
                vec![os("--policy-name"), os(name), os("--target"), os(target)],
            )
            .await
        })
    }

    fn delete_policy<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot("delete-policy", vec![os("--policy-name"), os(name)])
                .await
        })
    }

    fn describe_endpoint(&self) -> ServiceFuture<'_, String> {
        Box::pin(async move {
            let response: EndpointResponse = self
                .invoke_json(
                    "iot",
                    "describe-endpoint",
                    vec![os("--endpoint-type"), os(ENDPOINT_TYPE)],
                )
                .await?;
            Ok(response.endpoint_address)
        })
    }

    fn create_custom_metric<'a>(&'a self, metric: &'a CustomMetric) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot(
                "create-custom-metric",
                vec![
                    os("--metric-name"),
                    os(&metric.name),
                    os("--display-name"),
                    os(&metric.display_name),
                    os("--metric-type"),
                    os(metric.metric_type.as_str()),
                ],
            )
            .await
        })
    }

    fn delete_custom_metric<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.iot("delete-custom-metric", vec![os("--metric-name"), os(name)])
                .await
        })
    }
}

impl<R: CommandRunner + 'static> SuiteService for AwsCli<R> {
    fn start_suite_run<'a>(
        &'a self,
        suite_definition_id: &'a str,
        thing_arn: &'a str,
    ) -> ServiceFuture<'a, String> {
        Box::pin(async move {
            let configuration = json!({
                "primaryDevice": { "thingArn": thing_arn },
                "parallelRun": true,
            });
            let response: StartSuiteRunResponse = self
                .invoke_json(
                    "iotdeviceadvisor",
                    "start-suite-run",
                    vec![
                        os("--suite-definition-id"),
                        os(suite_definition_id),
                        os("--suite-run-configuration"),
                        OsString::from(configuration.to_string()),
                    ],
                )
                .await?;
            Ok(response.suite_run_id)
        })
    }

    fn get_suite_run<'a>(
        &'a self,
        suite_definition_id: &'a str,
        suite_run_id: &'a str,
    ) -> ServiceFuture<'a, SuiteRunSnapshot> {
        Box::pin(async move {
            let response: GetSuiteRunResponse = self
                .invoke_json(
                    "iotdeviceadvisor",
                    "get-suite-run",
                    vec![
                        os("--suite-definition-id"),
                        os(suite_definition_id),
                        os("--suite-run-id"),
                        os(suite_run_id),
                    ],
                )
                .await?;
            Ok(SuiteRunSnapshot {
                status: response.status,
                groups: response
                    .test_result
                    .map(|result| result.groups)
                    .unwrap_or_default(),
            })
        })
    }
}

impl<R: CommandRunner + 'static> ShadowService for AwsCli<R> {
    fn update_shadow<'a>(
        &'a self,
        thing_name: &'a str,
        document: &'a Value,
    ) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.invoke(
                "iot-data",
                "update-thing-shadow",
                vec![
                    os("--thing-name"),
                    os(thing_name),
                    os("--cli-binary-format"),
                    os("raw-in-base64-out"),
                    os("--payload"),
                    OsString::from(document.to_string()),
                    os("/dev/null"),
                ],
            )
            .await
            .map(drop)
        })
    }

    fn get_shadow<'a>(&'a self, thing_name: &'a str) -> ServiceFuture<'a, Option<Value>> {
        Box::pin(async move {
            match self
                .invoke(
                    "iot-data",
                    "get-thing-shadow",
                    vec![os("--thing-name"), os(thing_name), os("/dev/stdout")],
                )
                .await
            {
                Ok(stdout) => parse_first_value("get-thing-shadow", &stdout).map(Some),
                Err(ServiceError::Call { message, .. })
                    if message.contains(MISSING_SHADOW_MARKER) =>
                {
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        })
    }
}

impl<R: CommandRunner + 'static> TunnelService for AwsCli<R> {
    fn open_session(&self) -> ServiceFuture<'_, SessionHandle> {
        Box::pin(async move {
            let destination = json!({ "services": ["ssh", "http"] });
            let response: OpenTunnelResponse = self
                .invoke_json(
                    "iotsecuretunneling",
                    "open-tunnel",
                    vec![
                        os("--destination-config"),
                        OsString::from(destination.to_string()),
                    ],
                )
                .await?;
            Ok(SessionHandle {
                session_id: response.tunnel_id,
                source_access_token: response.source_access_token,
                destination_access_token: response.destination_access_token,
            })
        })
    }

    fn close_session<'a>(&'a self, session_id: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            self.invoke(
                "iotsecuretunneling",
                "close-tunnel",
                vec![os("--tunnel-id"), os(session_id), os("--delete")],
            )
            .await
            .map(drop)
        })
    }
}

#[cfg(test)]
mod tests;
