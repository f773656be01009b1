//! Shared fixtures for harness BDD scenarios.

use std::sync::Arc;

use camino::Utf8PathBuf;
use devicerig::advisor::TestCase;
use devicerig::test_support::{EventLog, FakeCloud, FakeSpawner, RecordingLauncher};
use devicerig::{HarnessConfig, TestMapping};
use rstest::fixture;
use tempfile::TempDir;

#[derive(Clone, Debug)]
pub struct HarnessContext {
    pub cloud: FakeCloud,
    pub launcher: RecordingLauncher,
    pub spawner: FakeSpawner,
    pub config: HarnessConfig,
    pub outcome: Option<RunResult>,
    pub(crate) credentials_tmp: Arc<TempDir>,
}

#[derive(Clone, Debug)]
pub enum RunResult {
    Exit(i32),
    Failure(String),
}

#[fixture]
pub fn harness_context() -> HarnessContext {
    let tmp_dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let credentials_dir = Utf8PathBuf::from_path_buf(tmp_dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 tempdir path: {}", path.display()));

    HarnessContext {
        cloud: FakeCloud::new(),
        launcher: RecordingLauncher::new(),
        spawner: FakeSpawner::with_event_log(EventLog::new()),
        config: HarnessConfig {
            credentials_dir: credentials_dir.into_string(),
            poll_interval_ms: 0,
            max_wait_secs: 5,
            grace_period_secs: 0,
            ..HarnessConfig::default()
        },
        outcome: None,
        credentials_tmp: Arc::new(tmp_dir),
    }
}

pub fn mapping_for(name: &str) -> TestMapping {
    TestMapping::from_tests(vec![TestCase {
        name: name.to_owned(),
        suite_definition_id: format!("suite-{name}"),
        executable: format!("deviceadvisor/tests/{name}/{name}"),
        topic: None,
        shadow: None,
    }])
    .unwrap_or_else(|err| panic!("mapping fixture should be valid: {err}"))
}
