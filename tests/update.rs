use std::sync::Arc;

use gamedeployment::cluster::memory::{ActionKind, MemoryCluster};
use gamedeployment::cluster::{ObjectClient, ObjectStore};
use gamedeployment::controller::core::{CommonControl, WorkloadControl};
use gamedeployment::controller::update::UpdateControl;
use gamedeployment::expectations::{ScaleExpectations, UpdateExpectations};
use gamedeployment::hook::LifecycleHookControl;
use gamedeployment::resources::{
    ControllerRevision, EnvVar, GameDeployment, GameDeploymentStatus, HookPhase, HookRun, IntOrString,
    Metadata, Pod, UpdateStrategyType,
};
use gamedeployment::revision::new_revision;
use gamedeployment::Error;

mod common;

use common::{hook_step, hook_template, new_game_deployment, owned_pod, set_image, NAMESPACE};

struct Fixture {
    cluster: Arc<MemoryCluster>,
    update: UpdateControl,
    update_expectations: Arc<UpdateExpectations>,
}

fn fixture() -> Fixture {
    let cluster = Arc::new(MemoryCluster::new());
    let store: Arc<dyn ObjectStore> = Arc::clone(&cluster) as Arc<dyn ObjectStore>;
    let client: Arc<dyn ObjectClient> = Arc::clone(&cluster) as Arc<dyn ObjectClient>;
    let workload: Arc<dyn WorkloadControl> = Arc::new(CommonControl);
    let hooks = Arc::new(LifecycleHookControl::new(Arc::clone(&client), store));
    let update_expectations = Arc::new(UpdateExpectations::new());
    let update = UpdateControl::new(
        client,
        workload,
        hooks,
        Arc::new(ScaleExpectations::new()),
        Arc::clone(&update_expectations),
    );
    Fixture {
        cluster,
        update,
        update_expectations,
    }
}

/// Apply `deploy`, returning it with revisions for its current template and for `image`.
fn rollout(
    f: &Fixture,
    deploy: GameDeployment,
    image: &str,
) -> (GameDeployment, ControllerRevision, ControllerRevision) {
    let old = f.cluster.apply_game_deployment(deploy);
    let from = new_revision(&old, 1, 0).unwrap();
    let mut new = old.clone();
    set_image(&mut new, image);
    let new = f.cluster.apply_game_deployment(new);
    let to = new_revision(&new, 2, 0).unwrap();
    (new, from, to)
}

fn ready_pods(f: &Fixture, deploy: &GameDeployment, revision: &ControllerRevision, count: usize) -> Vec<Pod> {
    (0..count)
        .map(|i| {
            let pod = owned_pod(deploy, &format!("pod{}x", i), &revision.metadata.name);
            f.cluster.insert_pod(pod.clone());
            f.cluster.set_pod_ready(NAMESPACE, &pod.metadata.name, true);
            f.cluster.pod(NAMESPACE, &pod.metadata.name).unwrap()
        })
        .collect()
}

#[test_log::test(tokio::test)]
async fn rolling_update_respects_max_unavailable() {
    let f = fixture();
    let mut deploy = new_game_deployment("web", 4);
    deploy.spec.update_strategy.max_unavailable = Some(IntOrString::Int(1));
    let (deploy, from, to) = rollout(&f, deploy, "game:2.0");
    let pods = ready_pods(&f, &deploy, &from, 4);

    let mut status = GameDeploymentStatus::default();
    f.update
        .manage(&deploy, &to, &[from, to.clone()], &pods, 0, &mut status)
        .await
        .unwrap();

    assert_eq!(f.cluster.actions_of(ActionKind::DeletePod).len(), 1);
}

#[test_log::test(tokio::test)]
async fn default_max_unavailable_is_a_fifth() {
    let f = fixture();
    let (deploy, from, to) = rollout(&f, new_game_deployment("web", 10), "game:2.0");
    let pods = ready_pods(&f, &deploy, &from, 10);

    let mut status = GameDeploymentStatus::default();
    f.update
        .manage(&deploy, &to, &[from, to.clone()], &pods, 0, &mut status)
        .await
        .unwrap();

    assert_eq!(f.cluster.actions_of(ActionKind::DeletePod).len(), 2);
}

#[test_log::test(tokio::test)]
async fn partition_keeps_pods_on_the_old_revision() {
    let f = fixture();
    let mut deploy = new_game_deployment("web", 4);
    deploy.spec.update_strategy.max_unavailable = Some(IntOrString::from("100%"));
    let (deploy, from, to) = rollout(&f, deploy, "game:2.0");
    let pods = ready_pods(&f, &deploy, &from, 4);

    let mut status = GameDeploymentStatus::default();
    f.update
        .manage(&deploy, &to, &[from, to.clone()], &pods, 3, &mut status)
        .await
        .unwrap();

    assert_eq!(f.cluster.actions_of(ActionKind::DeletePod).len(), 1);
}

#[test_log::test(tokio::test)]
async fn paused_updates_do_nothing() {
    let f = fixture();
    let mut deploy = new_game_deployment("web", 2);
    deploy.spec.update_strategy.paused = true;
    let (deploy, from, to) = rollout(&f, deploy, "game:2.0");
    let pods = ready_pods(&f, &deploy, &from, 2);
    f.cluster.clear_actions();

    let mut status = GameDeploymentStatus::default();
    let delay = f
        .update
        .manage(&deploy, &to, &[from, to.clone()], &pods, 0, &mut status)
        .await
        .unwrap();

    assert_eq!(delay, None);
    assert!(f.cluster.actions().is_empty());
}

#[test_log::test(tokio::test)]
async fn in_place_update_patches_image_and_revision() {
    let f = fixture();
    let mut deploy = new_game_deployment("web", 1);
    deploy.spec.update_strategy.r#type = UpdateStrategyType::InPlaceUpdate;
    let (deploy, from, to) = rollout(&f, deploy, "game:2.0");
    let pods = ready_pods(&f, &deploy, &from, 1);

    let mut status = GameDeploymentStatus::default();
    f.update
        .manage(&deploy, &to, &[from, to.clone()], &pods, 0, &mut status)
        .await
        .unwrap();

    assert!(f.cluster.actions_of(ActionKind::DeletePod).is_empty());
    let pod = f.cluster.pod(NAMESPACE, &pods[0].metadata.name).unwrap();
    assert_eq!(pod.revision(), Some(to.metadata.name.as_str()));
    assert_eq!(pod.spec.containers[0].image, "game:2.0");

    // the update is expected until the cache catches up
    let key = deploy.key();
    assert!(!f.update_expectations.satisfied_expectations(&key, &to.metadata.name).0);
    f.update_expectations
        .observe_updated(&key, &to.metadata.name, &pod);
    assert!(f.update_expectations.satisfied_expectations(&key, &to.metadata.name).0);
}

#[test_log::test(tokio::test)]
async fn in_place_update_rejects_non_image_changes() {
    let f = fixture();
    let mut deploy = new_game_deployment("web", 1);
    deploy.spec.update_strategy.r#type = UpdateStrategyType::InPlaceUpdate;
    let old = f.cluster.apply_game_deployment(deploy);
    let from = new_revision(&old, 1, 0).unwrap();
    let mut new = old.clone();
    new.spec.template.spec.containers[0].env.push(EnvVar {
        name: "MODE".to_owned(),
        value: Some("hard".to_owned()),
        value_from: None,
    });
    let new = f.cluster.apply_game_deployment(new);
    let to = new_revision(&new, 2, 0).unwrap();
    let pods = ready_pods(&f, &new, &from, 1);

    let mut status = GameDeploymentStatus::default();
    let res = f
        .update
        .manage(&new, &to, &[from, to.clone()], &pods, 0, &mut status)
        .await;

    assert!(matches!(res, Err(Error::NotInPlaceUpdatable(_))));
    assert!(f.cluster.actions_of(ActionKind::PatchPod).is_empty());
}

#[test_log::test(tokio::test)]
async fn post_inplace_hook_is_started_after_update() {
    let f = fixture();
    f.cluster.insert_hook_template(hook_template("check"));
    let mut deploy = new_game_deployment("web", 1);
    deploy.spec.update_strategy.r#type = UpdateStrategyType::InPlaceUpdate;
    deploy.spec.post_inplace_update_strategy.hook = Some(hook_step("check"));
    let (deploy, from, to) = rollout(&f, deploy, "game:2.0");
    let pods = ready_pods(&f, &deploy, &from, 1);

    let mut status = GameDeploymentStatus::default();
    f.update
        .manage(&deploy, &to, &[from, to.clone()], &pods, 0, &mut status)
        .await
        .unwrap();

    let runs = f.cluster.actions_of(ActionKind::CreateHookRun);
    assert_eq!(runs.len(), 1);
    assert!(runs[0].name.starts_with("post-inplace-web-pod0x-"));
    assert_eq!(status.post_inplace_hook_conditions.len(), 1);
    assert_eq!(status.post_inplace_hook_conditions[0].pod_name, "web-pod0x");
}

#[test_log::test(tokio::test)]
async fn existing_post_inplace_hook_run_is_not_an_error() {
    let f = fixture();
    f.cluster.insert_hook_template(hook_template("check"));
    let mut deploy = new_game_deployment("web", 1);
    deploy.spec.update_strategy.r#type = UpdateStrategyType::InPlaceUpdate;
    deploy.spec.post_inplace_update_strategy.hook = Some(hook_step("check"));
    let (deploy, from, to) = rollout(&f, deploy, "game:2.0");
    let pods = ready_pods(&f, &deploy, &from, 1);

    let hash = to.metadata.name.trim_start_matches("web-");
    f.cluster.insert_hook_run(HookRun {
        metadata: Metadata {
            name: format!("post-inplace-web-pod0x-{}", hash),
            namespace: NAMESPACE.to_owned(),
            ..Default::default()
        },
        ..Default::default()
    });

    let mut status = GameDeploymentStatus::default();
    f.update
        .manage(&deploy, &to, &[from, to.clone()], &pods, 0, &mut status)
        .await
        .unwrap();

    assert!(f.cluster.actions_of(ActionKind::CreateHookRun).is_empty());
    assert!(status.post_inplace_hook_conditions.is_empty());
    let pod = f.cluster.pod(NAMESPACE, "web-pod0x").unwrap();
    assert_eq!(pod.revision(), Some(to.metadata.name.as_str()));
}

#[test_log::test(tokio::test)]
async fn hot_patch_ignores_pre_delete_hooks() {
    let f = fixture();
    f.cluster.insert_hook_template(hook_template("drain"));
    let mut deploy = new_game_deployment("web", 1);
    deploy.spec.update_strategy.r#type = UpdateStrategyType::HotPatchUpdate;
    deploy.spec.pre_delete_update_strategy.hook = Some(hook_step("drain"));
    let (deploy, from, to) = rollout(&f, deploy, "game:2.0");
    let pods = ready_pods(&f, &deploy, &from, 1);

    let mut status = GameDeploymentStatus::default();
    f.update
        .manage(&deploy, &to, &[from, to.clone()], &pods, 0, &mut status)
        .await
        .unwrap();

    assert!(f.cluster.actions_of(ActionKind::CreateHookRun).is_empty());
    let pod = f.cluster.pod(NAMESPACE, "web-pod0x").unwrap();
    assert_eq!(pod.revision(), Some(to.metadata.name.as_str()));
    assert_eq!(pod.spec.containers[0].image, "game:2.0");
}

#[test_log::test(tokio::test)]
async fn pre_inplace_hook_gates_the_update() {
    let f = fixture();
    f.cluster.insert_hook_template(hook_template("warmup"));
    let mut deploy = new_game_deployment("web", 1);
    deploy.spec.update_strategy.r#type = UpdateStrategyType::InPlaceUpdate;
    deploy.spec.pre_inplace_update_strategy.hook = Some(hook_step("warmup"));
    let (deploy, from, to) = rollout(&f, deploy, "game:2.0");
    let pods = ready_pods(&f, &deploy, &from, 1);

    let mut status = GameDeploymentStatus::default();
    f.update
        .manage(&deploy, &to, &[from.clone(), to.clone()], &pods, 0, &mut status)
        .await
        .unwrap();

    let runs = f.cluster.actions_of(ActionKind::CreateHookRun);
    assert_eq!(runs.len(), 1);
    assert!(f.cluster.actions_of(ActionKind::PatchPod).is_empty());
    assert_eq!(status.pre_inplace_hook_conditions.len(), 1);
    let pod = f.cluster.pod(NAMESPACE, "web-pod0x").unwrap();
    assert_eq!(pod.revision(), Some(from.metadata.name.as_str()));

    f.cluster
        .set_hook_run_phase(NAMESPACE, &runs[0].name, HookPhase::Successful);
    f.update
        .manage(&deploy, &to, &[from, to.clone()], &[pod], 0, &mut status)
        .await
        .unwrap();

    assert_eq!(f.cluster.actions_of(ActionKind::CreateHookRun).len(), 1);
    let pod = f.cluster.pod(NAMESPACE, "web-pod0x").unwrap();
    assert_eq!(pod.revision(), Some(to.metadata.name.as_str()));
    assert_eq!(pod.spec.containers[0].image, "game:2.0");
}
