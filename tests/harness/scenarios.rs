//! BDD scenarios for the harness orchestrators.

use rstest_bdd_macros::scenario;

use super::test_helpers::{HarnessContext, harness_context};

#[scenario(
    path = "tests/features/advisor.feature",
    name = "Launch the executable once the first test case runs"
)]
fn scenario_launch_once(harness_context: HarnessContext) {
    let _ = harness_context;
}

#[scenario(
    path = "tests/features/advisor.feature",
    name = "Report a failing verdict"
)]
fn scenario_failing_verdict(harness_context: HarnessContext) {
    let _ = harness_context;
}

#[scenario(
    path = "tests/features/advisor.feature",
    name = "Surface suite failures and still tear down"
)]
fn scenario_suite_failure(harness_context: HarnessContext) {
    let _ = harness_context;
}

#[scenario(
    path = "tests/features/advisor.feature",
    name = "Surface teardown failure after success"
)]
fn scenario_teardown_failure(harness_context: HarnessContext) {
    let _ = harness_context;
}

#[scenario(
    path = "tests/features/tunnel.feature",
    name = "Propagate the source exit code"
)]
fn scenario_source_exit_code(harness_context: HarnessContext) {
    let _ = harness_context;
}

#[scenario(
    path = "tests/features/tunnel.feature",
    name = "Surface close failure after a successful source"
)]
fn scenario_close_failure(harness_context: HarnessContext) {
    let _ = harness_context;
}
