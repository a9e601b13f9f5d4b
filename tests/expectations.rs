use std::time::Duration;

use gamedeployment::expectations::{ScaleAction, ScaleExpectations, UpdateExpectations};
use gamedeployment::resources::{Metadata, Pod, CONTROLLER_REVISION_HASH_LABEL};
use maplit::btreemap;

const KEY: &str = "default/web";

fn pod(name: &str, revision: &str) -> Pod {
    Pod {
        metadata: Metadata {
            name: name.to_owned(),
            namespace: "default".to_owned(),
            labels: btreemap! {CONTROLLER_REVISION_HASH_LABEL.to_owned() => revision.to_owned()},
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test_log::test]
fn scale_expectations_satisfied_once_observed() {
    let exp = ScaleExpectations::new();
    assert!(exp.satisfied_expectations(KEY).0);

    exp.expect_scale(KEY, ScaleAction::Create, "web-a");
    exp.expect_scale(KEY, ScaleAction::Delete, "web-b");
    let (satisfied, _, outstanding) = exp.satisfied_expectations(KEY);
    assert!(!satisfied);
    assert_eq!(outstanding[&ScaleAction::Create], vec!["web-a".to_owned()]);
    assert_eq!(outstanding[&ScaleAction::Delete], vec!["web-b".to_owned()]);

    exp.observe_scale(KEY, ScaleAction::Create, "web-a");
    assert!(!exp.satisfied_expectations(KEY).0);
    exp.observe_scale(KEY, ScaleAction::Delete, "web-b");
    assert!(exp.satisfied_expectations(KEY).0);
}

#[test_log::test]
fn observing_an_unexpected_name_changes_nothing() {
    let exp = ScaleExpectations::new();
    exp.expect_scale(KEY, ScaleAction::Create, "web-a");
    exp.observe_scale(KEY, ScaleAction::Create, "web-z");
    exp.observe_scale(KEY, ScaleAction::Delete, "web-a");
    assert!(!exp.satisfied_expectations(KEY).0);
    assert!(exp.satisfied_expectations("default/other").0);
}

#[test_log::test]
fn deleting_scale_expectations_forgets_the_key() {
    let exp = ScaleExpectations::new();
    exp.expect_scale(KEY, ScaleAction::Create, "web-a");
    exp.delete_expectations(KEY);
    assert!(exp.satisfied_expectations(KEY).0);
    assert!(exp.get_expectations(KEY).is_empty());
}

#[test_log::test]
fn update_expectations_wait_for_new_revision() {
    let exp = UpdateExpectations::new();
    let before = pod("web-a", "web-1");
    exp.expect_updated(KEY, "web-2", &before);
    assert!(!exp.satisfied_expectations(KEY, "web-2").0);

    // the cache still shows the old revision
    exp.observe_updated(KEY, "web-2", &before);
    let (satisfied, _, pods) = exp.satisfied_expectations(KEY, "web-2");
    assert!(!satisfied);
    assert_eq!(pods, vec!["web-a".to_owned()]);

    exp.observe_pod(KEY, &pod("web-a", "web-2"));
    assert!(exp.satisfied_expectations(KEY, "web-2").0);
}

#[test_log::test]
fn newer_revision_supersedes_update_expectations() {
    let exp = UpdateExpectations::new();
    exp.expect_updated(KEY, "web-2", &pod("web-a", "web-1"));
    assert!(exp.satisfied_expectations(KEY, "web-3").0);

    exp.expect_updated(KEY, "web-2", &pod("web-a", "web-1"));
    exp.expect_updated(KEY, "web-3", &pod("web-b", "web-1"));
    let (satisfied, _, pods) = exp.satisfied_expectations(KEY, "web-3");
    assert!(!satisfied);
    assert_eq!(pods, vec!["web-b".to_owned()]);
}

#[test_log::test]
fn unsatisfied_time_counts_from_the_first_expectation() {
    let exp = ScaleExpectations::new();
    exp.expect_scale(KEY, ScaleAction::Create, "web-a");
    std::thread::sleep(Duration::from_millis(20));
    exp.expect_scale(KEY, ScaleAction::Create, "web-b");
    let (_, waited, _) = exp.satisfied_expectations(KEY);
    assert!(waited >= Duration::from_millis(20));

    let updates = UpdateExpectations::new();
    updates.expect_updated(KEY, "web-2", &pod("web-a", "web-1"));
    std::thread::sleep(Duration::from_millis(20));
    let (_, waited, _) = updates.satisfied_expectations(KEY, "web-2");
    assert!(waited >= Duration::from_millis(20));
}
