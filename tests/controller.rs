use std::{sync::Arc, time::Duration};

use gamedeployment::cluster::memory::{ActionKind, MemoryCluster};
use gamedeployment::cluster::{ObjectClient, ObjectStore};
use gamedeployment::controller::{Controller, ControllerConfig};
use gamedeployment::expectations::ScaleAction;
use gamedeployment::resources::{
    GameDeploymentConditionType, CONTROLLER_REVISION_HASH_LABEL,
};
use stdext::function_name;
use tokio::sync::watch;

mod common;

use common::{new_game_deployment, orphan_pod, set_image, Harness, NAMESPACE};

#[test_log::test(tokio::test)]
async fn scales_up_and_settles() {
    let mut h = Harness::new();
    h.apply(new_game_deployment("web", 3));

    h.settle("web", 4).await;
    let deploy = h.deploy("web");
    let pods = h.pods("web");
    assert_eq!(pods.len(), 3);
    for pod in &pods {
        assert_eq!(
            pod.metadata.labels.get(CONTROLLER_REVISION_HASH_LABEL),
            Some(&deploy.status.update_revision)
        );
    }
    assert_eq!(deploy.status.replicas, 3);
    assert_eq!(deploy.status.ready_replicas, 3);
    assert_eq!(deploy.status.updated_ready_replicas, 3);
    assert_eq!(deploy.status.current_revision, deploy.status.update_revision);
    assert_eq!(deploy.status.observed_generation, deploy.metadata.generation);
    assert_eq!(h.cluster.controller_revisions(NAMESPACE).len(), 1);

    // nothing left to do
    h.cluster.clear_actions();
    assert_eq!(h.sync("web").await.unwrap(), None);
    assert_eq!(h.cluster.actions(), Vec::new());
}

#[test_log::test(tokio::test)]
async fn scales_down() {
    let mut h = Harness::new();
    h.apply(new_game_deployment("web", 3));
    h.settle("web", 3).await;

    let mut deploy = h.deploy("web");
    deploy.spec.replicas = Some(1);
    h.apply(deploy);
    h.cluster.clear_actions();
    h.sync("web").await.unwrap();

    assert_eq!(h.cluster.actions_of(ActionKind::DeletePod).len(), 2);
    assert_eq!(h.pods("web").len(), 1);
}

#[test_log::test(tokio::test)]
async fn rolls_out_a_new_template() {
    let mut h = Harness::new();
    h.apply(new_game_deployment("web", 3));
    h.settle("web", 3).await;
    let old_revision = h.deploy("web").status.update_revision;

    let mut deploy = h.deploy("web");
    set_image(&mut deploy, "game:2.0");
    h.apply(deploy);
    h.settle("web", 10).await;

    let deploy = h.deploy("web");
    assert_ne!(deploy.status.update_revision, old_revision);
    assert_eq!(deploy.status.current_revision, deploy.status.update_revision);
    assert_eq!(deploy.status.updated_ready_replicas, 3);
    let pods = h.pods("web");
    assert_eq!(pods.len(), 3);
    assert!(pods
        .iter()
        .all(|p| p.spec.containers[0].image == "game:2.0"));
}

#[test_log::test(tokio::test)]
async fn adopts_matching_orphans() {
    let mut h = Harness::new();
    let mut deploy = new_game_deployment("web", 1);
    // keep the adopted pod from being replaced right away
    deploy.spec.update_strategy.paused = true;
    let deploy = h.apply(deploy);
    h.cluster
        .insert_pod(orphan_pod("stray", &[("app", "web")]));
    h.cluster
        .insert_pod(orphan_pod("unrelated", &[("app", "db")]));
    let keys = h.drain();
    assert_eq!(keys, vec![deploy.key()]);

    h.sync("web").await.unwrap();
    let owned = h
        .pods("web")
        .into_iter()
        .map(|p| p.metadata.name)
        .collect::<Vec<_>>();
    assert_eq!(owned, vec!["stray".to_owned()]);
    assert!(h.cluster.actions_of(ActionKind::CreatePod).is_empty());
    let unrelated = h.cluster.pod(NAMESPACE, "unrelated").unwrap();
    assert!(unrelated.metadata.owner_references.is_empty());
}

#[test_log::test(tokio::test)]
async fn releases_pods_that_stop_matching() {
    let mut h = Harness::new();
    h.apply(new_game_deployment("web", 1));
    h.settle("web", 2).await;
    let pod = h.pods("web").remove(0);

    let mut relabeled = pod.clone();
    relabeled.metadata.labels.insert("app".to_owned(), "other".to_owned());
    h.cluster.insert_pod(relabeled);
    h.drain();
    h.sync("web").await.unwrap();

    let released = h.cluster.pod(NAMESPACE, &pod.metadata.name).unwrap();
    assert!(released.metadata.owner_references.is_empty());
    // a replacement is created for the released pod
    assert_eq!(h.cluster.actions_of(ActionKind::CreatePod).len(), 2);
}

#[test_log::test(tokio::test)]
async fn waits_on_unobserved_creates() {
    let mut h = Harness::new();
    let deploy = h.apply(new_game_deployment("web", 2));
    h.controller
        .scale_expectations()
        .expect_scale(&deploy.key(), ScaleAction::Create, "web-ghost");

    // looked at again before the expectations time out
    let requeue = h.sync("web").await.unwrap().unwrap();
    assert!(requeue <= Duration::from_secs(300));
    assert!(requeue > Duration::from_secs(290));
    assert!(h.cluster.actions_of(ActionKind::CreatePod).is_empty());
    assert!(h.cluster.actions_of(ActionKind::PatchGameDeploymentStatus).is_empty());
}

#[test_log::test(tokio::test)]
async fn expectation_timeout_requeues() {
    let mut h = Harness::with_timeout(Duration::from_millis(1));
    let deploy = h.apply(new_game_deployment("web", 2));
    h.controller
        .scale_expectations()
        .expect_scale(&deploy.key(), ScaleAction::Create, "web-ghost");
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        h.sync("web").await.unwrap(),
        Some(Duration::from_millis(1))
    );
    assert!(h.cluster.actions_of(ActionKind::CreatePod).is_empty());
}

#[test_log::test(tokio::test)]
async fn deleted_deployment_drops_expectations() {
    let mut h = Harness::new();
    let deploy = h.apply(new_game_deployment("web", 2));
    h.controller
        .scale_expectations()
        .expect_scale(&deploy.key(), ScaleAction::Create, "web-ghost");
    h.cluster.remove_game_deployment(NAMESPACE, "web");

    assert_eq!(h.sync("web").await.unwrap(), None);
    assert!(h.controller.scale_expectations().get_expectations(&deploy.key()).is_empty());
}

#[test_log::test(tokio::test)]
async fn scale_failure_sets_a_condition() {
    let mut h = Harness::new();
    let mut deploy = new_game_deployment("web", 2);
    deploy.spec.replicas = None;
    h.apply(deploy);

    assert!(h.sync("web").await.is_err());
    let conditions = h.deploy("web").status.conditions;
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].r#type, GameDeploymentConditionType::FailedScale);
    assert_eq!(conditions[0].reason, "ScaleFailed");

    let mut deploy = h.deploy("web");
    deploy.spec.replicas = Some(2);
    h.apply(deploy);
    h.sync("web").await.unwrap();
    assert!(h.deploy("web").status.conditions.is_empty());
}

fn runtime_controller(workers: usize) -> (Arc<MemoryCluster>, Arc<Controller>) {
    let cluster = Arc::new(MemoryCluster::new());
    let store: Arc<dyn ObjectStore> = Arc::clone(&cluster) as Arc<dyn ObjectStore>;
    let client: Arc<dyn ObjectClient> = Arc::clone(&cluster) as Arc<dyn ObjectClient>;
    let config = ControllerConfig {
        workers,
        ..Default::default()
    };
    (cluster, Arc::new(Controller::new(store, client, config)))
}

#[test_log::test(tokio::test)]
async fn invalid_keys_are_dropped() {
    let (_, controller) = runtime_controller(1);
    controller.queue().add("a/b/c");

    assert!(controller.process_next().await);
    assert_eq!(controller.queue().num_requeues("a/b/c"), 0);
    assert!(controller.queue().is_empty());
}

#[test_log::test(tokio::test)]
async fn failed_syncs_are_rate_limited() {
    let (cluster, controller) = runtime_controller(1);
    let mut deploy = new_game_deployment("web", 2);
    deploy.spec.replicas = None;
    let deploy = cluster.apply_game_deployment(deploy);
    controller.queue().add(&deploy.key());

    assert!(controller.process_next().await);
    assert_eq!(controller.queue().num_requeues(&deploy.key()), 1);
}

#[test_log::test(tokio::test)]
async fn runs_until_shut_down() {
    let (cluster, controller) = runtime_controller(2);
    let events = cluster.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn(Arc::clone(&controller).run(events, shutdown_rx));

    cluster.apply_game_deployment(new_game_deployment("web", 3));
    let mut created = 0;
    for _ in 0..500 {
        created = cluster.actions_of(ActionKind::CreatePod).len();
        if created == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(created, 3, "{}", function_name!());

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap();
    assert!(controller.queue().is_shutting_down());
}
