//! Unit tests for the `aws` CLI service.

use std::time::{Duration, Instant};

use rstest::{fixture, rstest};
use serde_json::json;
use tokio::time::timeout;

use super::*;
use crate::process::{CommandOutput, SpawnError};
use crate::test_support::{CommandInvocation, ScriptedRunner};

fn cli_config(profile: Option<&str>) -> AwsCliConfig {
    AwsCliConfig {
        aws_bin: String::from("aws"),
        region: String::from("us-east-1"),
        profile: profile.map(str::to_owned),
    }
}

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn invocation(runner: &ScriptedRunner, index: usize) -> CommandInvocation {
    runner
        .invocations()
        .get(index)
        .cloned()
        .expect("invocation should be recorded")
}

#[rstest]
#[tokio::test]
async fn create_thing_builds_scoped_command(runner: ScriptedRunner) {
    runner.push_json(r#"{"thingName":"DATest_1","thingArn":"arn:thing/DATest_1","thingId":"x"}"#);
    let cli = AwsCli::new(cli_config(Some("ci")), runner.clone());

    let thing = cli.create_thing("DATest_1").await.expect("create thing");

    assert_eq!(thing.thing_arn, "arn:thing/DATest_1");
    assert_eq!(
        invocation(&runner, 0).command_string(),
        "aws iot create-thing --thing-name DATest_1 --region us-east-1 --profile ci --output json"
    );
}

#[rstest]
#[tokio::test]
async fn certificate_response_decodes_key_pair(runner: ScriptedRunner) {
    runner.push_json(
        json!({
            "certificateArn": "arn:cert/abc",
            "certificateId": "abc",
            "certificatePem": "PEM",
            "keyPair": { "PublicKey": "PUB", "PrivateKey": "PRIV" }
        })
        .to_string(),
    );
    let cli = AwsCli::new(cli_config(None), runner.clone());

    let record = cli.create_keys_and_certificate().await.expect("certificate");

    assert_eq!(record.certificate_id, "abc");
    assert_eq!(record.key_pair.private_key, "PRIV");
    assert!(invocation(&runner, 0).args.contains(&OsString::from("--set-as-active")));
}

#[rstest]
#[tokio::test]
async fn failing_commands_surface_trimmed_stderr(runner: ScriptedRunner) {
    runner.push_failure(254, "An error occurred (ResourceNotFoundException)\n");
    let cli = AwsCli::new(cli_config(None), runner);

    let err = cli.delete_thing("missing").await.expect_err("call should fail");

    assert_eq!(
        err,
        ServiceError::Call {
            operation: String::from("delete-thing"),
            status_text: String::from("254"),
            message: String::from("An error occurred (ResourceNotFoundException)"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn spawn_failures_map_to_unavailable(runner: ScriptedRunner) {
    let cli = AwsCli::new(cli_config(None), runner);

    let err = cli.describe_endpoint().await.expect_err("no response queued");

    assert!(matches!(err, ServiceError::Unavailable { .. }), "got {err:?}");
}

#[rstest]
#[tokio::test]
async fn start_suite_run_sends_primary_device_configuration(runner: ScriptedRunner) {
    runner.push_json(r#"{"suiteRunId":"run-9","suiteRunArn":"arn:run"}"#);
    let cli = AwsCli::new(cli_config(None), runner.clone());

    let run_id = cli
        .start_suite_run("suite-1", "arn:thing/DATest_1")
        .await
        .expect("start suite");

    assert_eq!(run_id, "run-9");
    let raw = invocation(&runner, 0)
        .flag_value("--suite-run-configuration")
        .expect("configuration flag");
    let configuration: Value = serde_json::from_str(&raw).expect("json configuration");
    assert_eq!(
        configuration,
        json!({"primaryDevice": {"thingArn": "arn:thing/DATest_1"}, "parallelRun": true})
    );
}

#[rstest]
#[case::loaded(
    r#"{"status":"RUNNING","testResult":{"groups":[{"tests":[{"testCaseDefinitionName":"connect","status":"PENDING"}]}]}}"#,
    SuiteStatus::Running,
    Some(SuiteStatus::Pending)
)]
#[case::no_result(r#"{"status":"PENDING"}"#, SuiteStatus::Pending, None)]
#[case::no_status(r"{}", SuiteStatus::Pending, None)]
#[case::unknown(
    r#"{"status":"PASS_WITH_WARNINGS"}"#,
    SuiteStatus::from("PASS_WITH_WARNINGS"),
    None
)]
#[tokio::test]
async fn get_suite_run_decodes_snapshots(
    runner: ScriptedRunner,
    #[case] stdout: &str,
    #[case] status: SuiteStatus,
    #[case] first_test: Option<SuiteStatus>,
) {
    runner.push_json(stdout);
    let cli = AwsCli::new(cli_config(None), runner);

    let snapshot = cli.get_suite_run("suite-1", "run-1").await.expect("snapshot");

    assert_eq!(snapshot.status, status);
    assert_eq!(snapshot.first_test_status(), first_test.as_ref());
}

#[rstest]
#[tokio::test]
async fn get_shadow_ignores_trailing_cli_output(runner: ScriptedRunner) {
    runner.push_json("{\"state\":{\"reported\":{\"color\":\"red\"}}}\n{}\n");
    let cli = AwsCli::new(cli_config(None), runner);

    let document = cli.get_shadow("DATest_1").await.expect("shadow");

    assert_eq!(
        document.and_then(|doc| doc.pointer("/state/reported/color").cloned()),
        Some(json!("red"))
    );
}

#[rstest]
#[tokio::test]
async fn get_shadow_returns_none_when_absent(runner: ScriptedRunner) {
    runner.push_failure(
        254,
        "An error occurred (ResourceNotFoundException) when calling GetThingShadow",
    );
    let cli = AwsCli::new(cli_config(None), runner);

    let document = cli.get_shadow("DATest_1").await.expect("missing shadow is ok");

    assert!(document.is_none());
}

#[rstest]
#[tokio::test]
async fn malformed_json_is_a_parse_error(runner: ScriptedRunner) {
    runner.push_json("not json");
    let cli = AwsCli::new(cli_config(None), runner);

    let err = cli.describe_endpoint().await.expect_err("parse should fail");

    assert!(matches!(err, ServiceError::Parse { .. }), "got {err:?}");
}

#[rstest]
#[tokio::test]
async fn tunnel_lifecycle_commands(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"tunnelId":"tun-1","tunnelArn":"arn:tun","sourceAccessToken":"S","destinationAccessToken":"D"}"#,
    );
    runner.push_success();
    let cli = AwsCli::new(cli_config(None), runner.clone());

    let session = cli.open_session().await.expect("open tunnel");
    cli.close_session(&session.session_id)
        .await
        .expect("close tunnel");

    assert_eq!(session.source_access_token, "S");
    assert_eq!(session.destination_access_token, "D");
    let destination = invocation(&runner, 0)
        .flag_value("--destination-config")
        .expect("destination config");
    assert_eq!(destination, r#"{"services":["ssh","http"]}"#);
    assert_eq!(
        invocation(&runner, 1).command_string(),
        "aws iotsecuretunneling close-tunnel --tunnel-id tun-1 --delete --region us-east-1 --output json"
    );
}

#[rstest]
#[tokio::test]
async fn certificate_teardown_commands(runner: ScriptedRunner) {
    runner.push_success();
    runner.push_success();
    let cli = AwsCli::new(cli_config(None), runner.clone());

    cli.update_certificate_status("abc", CertificateStatus::Inactive)
        .await
        .expect("deactivate");
    cli.delete_certificate("abc").await.expect("delete");

    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(CommandInvocation::command_string)
        .collect();
    assert_eq!(
        commands,
        vec![
            "aws iot update-certificate --certificate-id abc --new-status INACTIVE --region us-east-1 --output json",
            "aws iot delete-certificate --certificate-id abc --force-delete --region us-east-1 --output json",
        ]
    );
}

#[derive(Debug)]
struct SlowRunner {
    delay: Duration,
}

impl CommandRunner for SlowRunner {
    fn run(&self, _program: &str, _args: &[OsString]) -> Result<CommandOutput, SpawnError> {
        std::thread::sleep(self.delay);
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::from("{}"),
            stderr: String::new(),
        })
    }
}

#[rstest]
#[tokio::test]
async fn slow_calls_do_not_block_the_runtime() {
    let cli = AwsCli::new(
        cli_config(None),
        SlowRunner {
            delay: Duration::from_millis(500),
        },
    );
    let started = Instant::now();

    let outcome = timeout(Duration::from_millis(50), cli.delete_thing("DATest_1")).await;

    assert!(outcome.is_err(), "the call should still be pending");
    assert!(started.elapsed() < Duration::from_millis(400));
}
