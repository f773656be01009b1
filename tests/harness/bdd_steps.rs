//! BDD step definitions for the harness orchestrators.

use std::future::pending;

use camino::Utf8Path;
use devicerig::RunOrchestrator;
use devicerig::test_support::snapshot;
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{HarnessContext, RunResult, mapping_for};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

const KNOWN_OPERATIONS: [&str; 4] = [
    "start-suite-run",
    "delete-thing",
    "open-tunnel",
    "close-tunnel",
];

#[given("a harness with a clean cloud")]
fn clean_cloud(harness_context: HarnessContext) -> HarnessContext {
    harness_context
}

#[given("the suite reports \"{status}\" with first test \"{first}\"")]
fn suite_reports(harness_context: HarnessContext, status: String, first: String) -> HarnessContext {
    harness_context
        .cloud
        .push_snapshot(snapshot(&status, Some(first.as_str())));
    harness_context
}

#[given("the cloud rejects \"{operation}\"")]
fn cloud_rejects(
    harness_context: HarnessContext,
    operation: String,
) -> Result<HarnessContext, StepError> {
    let known = KNOWN_OPERATIONS
        .into_iter()
        .find(|candidate| *candidate == operation)
        .ok_or_else(|| StepError::Assertion(format!("unsupported operation {operation}")))?;
    harness_context.cloud.fail_on(known);
    Ok(harness_context)
}

#[given("the source process exits with \"{code}\"")]
fn source_exits(harness_context: HarnessContext, code: i32) -> HarnessContext {
    harness_context.spawner.set_exit_code("source", code);
    harness_context
}

#[when("I run the advisor for \"{test}\"")]
fn run_advisor(harness_context: HarnessContext, test: String) -> Result<HarnessContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let mapping = mapping_for(&test);
    let selected = vec![test];
    let result = runtime.block_on(async {
        RunOrchestrator::new(&harness_context.cloud, &harness_context.config)
            .run_advisor(&harness_context.launcher, &mapping, &selected, pending())
            .await
    });

    let outcome = match result {
        Ok(summary) => RunResult::Exit(summary.exit_code()),
        Err(err) => RunResult::Failure(err.to_string()),
    };
    Ok(HarnessContext {
        outcome: Some(outcome),
        ..harness_context
    })
}

#[when("I run the tunnel session")]
fn run_tunnel(harness_context: HarnessContext) -> Result<HarnessContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let result = runtime.block_on(async {
        RunOrchestrator::new(&harness_context.cloud, &harness_context.config)
            .run_tunnel(
                &harness_context.spawner,
                Utf8Path::new("build/samples/secure_tunnel/secure_tunnel"),
                pending(),
            )
            .await
    });

    let outcome = match result {
        Ok(session) => RunResult::Exit(session.exit_code()),
        Err(err) => RunResult::Failure(err.to_string()),
    };
    Ok(HarnessContext {
        outcome: Some(outcome),
        ..harness_context
    })
}

#[then("the run exit code is \"{code}\"")]
fn run_exit_code(harness_context: &HarnessContext, code: i32) -> Result<(), StepError> {
    match &harness_context.outcome {
        Some(RunResult::Exit(actual)) if *actual == code => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected exit code {code}, got {other:?}"
        ))),
    }
}

#[then("the run fails mentioning \"{text}\"")]
fn run_fails_mentioning(harness_context: &HarnessContext, text: String) -> Result<(), StepError> {
    match &harness_context.outcome {
        Some(RunResult::Failure(message)) if message.contains(&text) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected failure mentioning {text:?}, got {other:?}"
        ))),
    }
}

#[then("the test executable was launched \"{count}\" times")]
fn launched_times(harness_context: &HarnessContext, count: usize) -> Result<(), StepError> {
    let launches = harness_context.launcher.launches().len();
    if launches == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} launches, got {launches}"
        )))
    }
}

#[then("no cloud resources remain")]
fn nothing_remains(harness_context: &HarnessContext) -> Result<(), StepError> {
    let inventory = harness_context.cloud.inventory();
    if inventory.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "resources left behind: {inventory:?}"
        )))
    }
}

#[then("the tunnel session is closed")]
fn session_closed(harness_context: &HarnessContext) -> Result<(), StepError> {
    if harness_context.cloud.count("close-tunnel") == 1
        && harness_context.cloud.inventory().sessions == 0
    {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "tunnel session should be closed exactly once",
        )))
    }
}
