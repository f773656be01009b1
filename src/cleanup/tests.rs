//! Unit tests for ledger teardown.

use std::error::Error as _;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tokio::time::timeout;

use super::*;
use crate::ledger::ResourceKind;
use crate::test_support::FakeCloud;

struct Provisioned {
    cloud: FakeCloud,
    ledger: Ledger,
}

/// Creates a thing, certificate and attachment through the fake so the
/// ledger mirrors real remote state.
async fn provision(cloud: FakeCloud) -> Provisioned {
    let mut ledger = Ledger::new();
    let thing = cloud
        .create_thing("DATest_1")
        .await
        .expect("thing should be created");
    ledger.record(Resource::Thing {
        name: thing.thing_name.clone(),
    });
    let certificate = cloud
        .create_keys_and_certificate()
        .await
        .expect("certificate should be created");
    ledger.record(Resource::Certificate {
        id: certificate.certificate_id.clone(),
    });
    cloud
        .attach_thing_principal(&thing.thing_name, &certificate.certificate_arn)
        .await
        .expect("attach should succeed");
    ledger.record(Resource::Attachment(Attachment::ThingPrincipal {
        thing_name: thing.thing_name,
        principal: certificate.certificate_arn,
    }));
    Provisioned { cloud, ledger }
}

#[fixture]
fn cloud() -> FakeCloud {
    FakeCloud::new()
}

#[rstest]
#[tokio::test]
async fn teardown_reverses_in_reverse_creation_order(cloud: FakeCloud) {
    let Provisioned { cloud, mut ledger } = provision(cloud).await;

    let report = teardown(&cloud, &mut ledger).await;

    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);
    let kinds: Vec<ResourceKind> = report
        .reversed
        .iter()
        .map(|entry| entry.resource.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            ResourceKind::Attachment,
            ResourceKind::Certificate,
            ResourceKind::Thing
        ]
    );
    let teardown_calls: Vec<&str> = cloud.operations().into_iter().skip(3).collect();
    assert_eq!(
        teardown_calls,
        vec![
            "detach-thing-principal",
            "update-certificate",
            "delete-certificate",
            "delete-thing"
        ]
    );
    assert!(cloud.inventory().is_empty());
}

#[rstest]
#[tokio::test]
async fn second_teardown_is_a_no_op(cloud: FakeCloud) {
    let Provisioned { cloud, mut ledger } = provision(cloud).await;
    let _first = teardown(&cloud, &mut ledger).await;
    let calls_after_first = cloud.calls().len();

    let second = teardown(&cloud, &mut ledger).await;

    assert_eq!(second.attempted(), 0);
    assert!(second.is_clean());
    assert_eq!(cloud.calls().len(), calls_after_first);
}

#[rstest]
#[tokio::test]
async fn failed_certificate_delete_does_not_block_thing_delete(cloud: FakeCloud) {
    let Provisioned { cloud, mut ledger } = provision(cloud).await;
    cloud.fail_on("delete-certificate");

    let report = teardown(&cloud, &mut ledger).await;

    assert_eq!(report.failures.len(), 1);
    let failure = report.failures.first().expect("one failure");
    assert_eq!(failure.entry.resource.kind(), ResourceKind::Certificate);
    assert_eq!(cloud.count("delete-thing"), 1);
    assert_eq!(cloud.inventory().things, 0);
    assert_eq!(cloud.inventory().certificates, 1);
    let summary = report.leak_summary().expect("leak should be reported");
    assert!(summary.starts_with("1 resource(s) may need manual cleanup"));
    assert!(summary.contains("certificate cert-1"));
    assert!(
        matches!(failure.source, ReversalError::Service(ServiceError::Call { .. })),
        "provider error should be kept: {:?}",
        failure.source
    );
    assert!(failure.source().is_some());
}

#[rstest]
#[tokio::test]
async fn interrupted_teardown_keeps_unreversed_entries(cloud: FakeCloud) {
    let Provisioned { cloud, mut ledger } = provision(cloud).await;
    cloud.set_latency(Duration::from_millis(100));

    let interrupted = timeout(Duration::from_millis(150), teardown(&cloud, &mut ledger)).await;

    assert!(interrupted.is_err(), "teardown should still be running");
    assert_eq!(ledger.len(), 2, "only the detach should have left the ledger");
    cloud.set_latency(Duration::ZERO);
    let report = teardown(&cloud, &mut ledger).await;
    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);
    assert!(ledger.is_empty());
    assert!(cloud.inventory().is_empty(), "{:?}", cloud.inventory());
}

#[rstest]
#[tokio::test]
async fn failed_deactivation_skips_certificate_delete(cloud: FakeCloud) {
    let Provisioned { cloud, mut ledger } = provision(cloud).await;
    cloud.fail_on("update-certificate");

    let report = teardown(&cloud, &mut ledger).await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(cloud.count("delete-certificate"), 0);
    assert_eq!(cloud.count("delete-thing"), 1);
}

#[rstest]
#[tokio::test]
async fn temporary_files_are_removed_and_missing_ones_tolerated(cloud: FakeCloud) {
    let temp = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 temp path");
    let present = root.join("certificate.pem.crt");
    std::fs::write(&present, "pem").expect("write credential");
    let missing = root.join("private.pem.key");

    let mut ledger = Ledger::new();
    ledger.record(Resource::TemporaryFile {
        path: present.clone(),
    });
    ledger.record(Resource::TemporaryFile { path: missing });

    let report = teardown(&cloud, &mut ledger).await;

    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);
    assert_eq!(report.reversed.len(), 2);
    assert!(!present.exists());
}

#[rstest]
fn annotate_appends_teardown_failures() {
    let report = TeardownReport {
        reversed: Vec::new(),
        failures: vec![CleanupError {
            entry: LedgerEntry {
                sequence: 0,
                resource: Resource::Thing {
                    name: String::from("DATest_1"),
                },
            },
            source: ReversalError::Service(ServiceError::Call {
                operation: String::from("delete-thing"),
                status_text: String::from("254"),
                message: String::from("denied"),
            }),
        }],
    };

    let annotated = report.annotate(String::from("suite run failed"));

    assert_eq!(
        annotated,
        concat!(
            "suite run failed (teardown also failed: 1 resource(s) may need manual cleanup: ",
            "failed to remove thing DATest_1: delete-thing failed with status 254: denied)"
        )
    );
}

#[rstest]
fn annotate_leaves_message_untouched_when_clean() {
    let report = TeardownReport::default();
    assert_eq!(report.annotate(String::from("boom")), "boom");
}
