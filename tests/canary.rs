use std::{sync::Arc, time::Duration};

use gamedeployment::cluster::memory::{ActionKind, MemoryCluster};
use gamedeployment::cluster::{ObjectClient, ObjectStore};
use gamedeployment::controller::canary::{
    complete_current_canary_step, compute_step_hash, current_canary_step, get_current_partition,
    CanaryContext,
};
use gamedeployment::controller::core::{CommonControl, WorkloadControl};
use gamedeployment::controller::status::{status_patch, StatusUpdater};
use gamedeployment::resources::{
    CanaryPause, CanaryStep, CanaryStrategy, GameDeployment, GameDeploymentStatus,
    PauseCondition, PauseReason, Time,
};
use time::OffsetDateTime;

mod common;

use common::{new_game_deployment, set_image, Harness, NAMESPACE};

fn partition_step(partition: i32) -> CanaryStep {
    CanaryStep {
        partition: Some(partition),
        ..Default::default()
    }
}

fn pause_step(duration: Option<i32>) -> CanaryStep {
    CanaryStep {
        pause: Some(CanaryPause { duration }),
        ..Default::default()
    }
}

fn with_steps(replicas: i32, steps: Vec<CanaryStep>) -> GameDeployment {
    let mut deploy = new_game_deployment("web", replicas);
    deploy.spec.update_strategy.canary = Some(CanaryStrategy { steps });
    deploy
}

fn paused_since(seconds_ago: i64) -> PauseCondition {
    PauseCondition {
        reason: PauseReason::CanaryPauseStep,
        start_time: Time(OffsetDateTime::now_utc() - time::Duration::seconds(seconds_ago)),
    }
}

/// A deployment in the middle of rolling from web-1 to web-2 at step `index`.
fn mid_rollout(mut deploy: GameDeployment, index: i32) -> GameDeployment {
    deploy.status.current_step_hash = compute_step_hash(&deploy).unwrap();
    deploy.status.current_step_index = Some(index);
    deploy.status.update_revision = "web-2".to_owned();
    deploy.status.current_revision = "web-1".to_owned();
    deploy.status.canary.revision = "web-1".to_owned();
    deploy
}

struct Fixture {
    cluster: Arc<MemoryCluster>,
    status: StatusUpdater,
}

fn fixture() -> Fixture {
    let cluster = Arc::new(MemoryCluster::new());
    let client: Arc<dyn ObjectClient> = Arc::clone(&cluster) as Arc<dyn ObjectClient>;
    let workload: Arc<dyn WorkloadControl> = Arc::new(CommonControl);
    Fixture {
        status: StatusUpdater::new(client, workload),
        cluster,
    }
}

impl Fixture {
    async fn pass(&self, deploy: GameDeployment) -> (CanaryContext, Option<Duration>) {
        let deploy = self.cluster.apply_game_deployment(deploy);
        let mut ctx = CanaryContext::new(deploy, Vec::new(), "web-2");
        let requeue = self
            .status
            .update_status(&mut ctx, &[], "web-1", "web-2", 0)
            .await
            .unwrap();
        (ctx, requeue)
    }

    fn stored(&self) -> GameDeployment {
        self.cluster.game_deployment(NAMESPACE, "web").unwrap()
    }
}

#[test]
fn partition_follows_the_current_step() {
    let deploy = with_steps(4, vec![partition_step(3), pause_step(None), partition_step(1)]);
    let at = |index: Option<i32>| {
        let status = GameDeploymentStatus {
            current_step_index: index,
            ..Default::default()
        };
        get_current_partition(&deploy, &status)
    };
    assert_eq!(at(None), 4);
    assert_eq!(at(Some(0)), 3);
    // a pause keeps the partition of the step before it
    assert_eq!(at(Some(1)), 3);
    assert_eq!(at(Some(2)), 1);
    assert_eq!(at(Some(3)), 0);
}

#[test]
fn explicit_partition_wins_over_steps() {
    let mut deploy = with_steps(4, vec![partition_step(3)]);
    deploy.spec.update_strategy.partition = Some(2);
    assert_eq!(get_current_partition(&deploy, &GameDeploymentStatus::default()), 2);

    let plain = new_game_deployment("web", 4);
    assert_eq!(get_current_partition(&plain, &GameDeploymentStatus::default()), 0);
}

#[test]
fn step_hash_tracks_the_steps() {
    assert_eq!(compute_step_hash(&new_game_deployment("web", 1)).unwrap(), "");
    let a = with_steps(2, vec![partition_step(1)]);
    let b = with_steps(2, vec![partition_step(0)]);
    let a_hash = compute_step_hash(&a).unwrap();
    assert!(!a_hash.is_empty());
    assert_eq!(a_hash, compute_step_hash(&a.clone()).unwrap());
    assert_ne!(a_hash, compute_step_hash(&b).unwrap());
}

#[test]
fn unchanged_status_makes_an_empty_patch() {
    let status = GameDeploymentStatus {
        replicas: 3,
        ready_replicas: 2,
        current_revision: "web-1".to_owned(),
        ..Default::default()
    };
    assert!(status_patch(&status, &status.clone()).unwrap().is_empty());

    let mut changed = status.clone();
    changed.ready_replicas = 3;
    let patch = status_patch(&status, &changed).unwrap();
    assert_eq!(patch.keys().collect::<Vec<_>>(), vec!["readyReplicas"]);
    assert_eq!(patch["readyReplicas"], 3);
}

#[test]
fn timed_pause_completes_once_expired() {
    let mut deploy = mid_rollout(with_steps(0, vec![pause_step(Some(1))]), 0);
    deploy.status.pause_conditions = vec![paused_since(5)];
    let ctx = CanaryContext::new(deploy.clone(), Vec::new(), "web-2");
    assert!(complete_current_canary_step(&ctx));

    deploy.status.pause_conditions = vec![paused_since(0)];
    deploy.spec.update_strategy.canary = Some(CanaryStrategy {
        steps: vec![pause_step(Some(60))],
    });
    let ctx = CanaryContext::new(deploy, Vec::new(), "web-2");
    assert!(!complete_current_canary_step(&ctx));
}

#[test]
fn untimed_pause_waits_for_unpause() {
    let mut deploy = mid_rollout(with_steps(0, vec![pause_step(None)]), 0);
    deploy.status.pause_conditions = vec![paused_since(3600)];
    deploy.spec.update_strategy.paused = true;
    let ctx = CanaryContext::new(deploy.clone(), Vec::new(), "web-2");
    assert!(!complete_current_canary_step(&ctx));

    deploy.spec.update_strategy.paused = false;
    let ctx = CanaryContext::new(deploy, Vec::new(), "web-2");
    assert!(complete_current_canary_step(&ctx));
}

#[test]
fn partition_step_waits_for_updated_ready_pods() {
    let mut deploy = mid_rollout(with_steps(4, vec![partition_step(2)]), 0);
    deploy.status.updated_ready_replicas = 1;
    deploy.status.ready_replicas = 4;
    deploy.status.available_replicas = 4;
    let ctx = CanaryContext::new(deploy.clone(), Vec::new(), "web-2");
    assert!(!complete_current_canary_step(&ctx));

    deploy.status.updated_ready_replicas = 2;
    let ctx = CanaryContext::new(deploy, Vec::new(), "web-2");
    assert!(complete_current_canary_step(&ctx));
}

#[test_log::test(tokio::test)]
async fn expired_pause_moves_to_the_next_step() {
    let f = fixture();
    let mut deploy = mid_rollout(with_steps(0, vec![pause_step(Some(1))]), 0);
    deploy.status.pause_conditions = vec![paused_since(5)];
    deploy.status.canary.current_step_hook_run = "web-2-0-analysis".to_owned();

    let (ctx, requeue) = f.pass(deploy).await;
    assert_eq!(requeue, None);
    assert_eq!(ctx.new_status.current_step_index, Some(1));

    let stored = f.stored();
    assert_eq!(stored.status.current_step_index, Some(1));
    assert!(stored.status.pause_conditions.is_empty());
    assert!(stored.status.canary.current_step_hook_run.is_empty());
    // that was the last step
    assert_eq!(stored.status.canary.revision, "web-2");
    assert!(f.cluster.actions_of(ActionKind::PatchGameDeployment).is_empty());
}

#[test_log::test(tokio::test)]
async fn running_pause_reports_time_left() {
    let f = fixture();
    let mut deploy = mid_rollout(with_steps(0, vec![pause_step(Some(60))]), 0);
    deploy.status.pause_conditions = vec![paused_since(10)];

    let (ctx, requeue) = f.pass(deploy).await;
    assert_eq!(ctx.new_status.current_step_index, Some(0));
    let left = requeue.expect("pause still running");
    assert!(left <= Duration::from_secs(50));
    assert!(left > Duration::from_secs(40));
}

#[test_log::test(tokio::test)]
async fn pause_step_pauses_the_deployment_until_resumed() {
    let f = fixture();
    let deploy = mid_rollout(with_steps(0, vec![pause_step(None)]), 0);

    let (ctx, _) = f.pass(deploy).await;
    assert!(ctx.new_paused);
    let stored = f.stored();
    assert!(stored.spec.update_strategy.paused);
    assert_eq!(stored.status.pause_conditions.len(), 1);
    assert_eq!(
        stored.status.pause_conditions[0].reason,
        PauseReason::CanaryPauseStep
    );

    let mut resumed = stored;
    resumed.spec.update_strategy.paused = false;
    let (ctx, _) = f.pass(resumed).await;
    assert_eq!(ctx.new_status.current_step_index, Some(1));
    assert!(f.stored().status.pause_conditions.is_empty());
}

#[test_log::test(tokio::test)]
async fn changed_steps_restart_the_rollout() {
    let f = fixture();
    let mut deploy = mid_rollout(with_steps(2, vec![partition_step(1), partition_step(0)]), 1);
    deploy.status.current_step_hash = "stale".to_owned();
    deploy.status.pause_conditions = vec![paused_since(5)];

    let (ctx, _) = f.pass(deploy).await;
    assert_eq!(ctx.new_status.current_step_index, Some(0));
    assert!(ctx.new_status.pause_conditions.is_empty());
    assert_eq!(ctx.new_status.canary.revision, "web-1");
    assert_eq!(
        ctx.new_status.current_step_hash,
        compute_step_hash(&ctx.deploy).unwrap()
    );
}

#[test_log::test(tokio::test)]
async fn fully_rolled_deployment_skips_the_steps() {
    let f = fixture();
    let mut deploy = with_steps(0, vec![partition_step(1), pause_step(None)]);
    deploy.status.update_revision = "web-2".to_owned();

    let (ctx, _) = f.pass(deploy).await;
    assert_eq!(ctx.new_status.current_step_index, Some(2));
    assert_eq!(ctx.new_status.canary.revision, "web-2");
    assert!(!ctx.new_paused);
}

#[test_log::test(tokio::test)]
async fn expired_timed_pause_resumes_the_rollout() {
    let f = fixture();
    let deploy = mid_rollout(with_steps(0, vec![pause_step(Some(1)), partition_step(0)]), 0);

    f.pass(deploy).await;
    let mut stored = f.stored();
    assert!(stored.spec.update_strategy.paused);
    assert_eq!(stored.status.pause_conditions.len(), 1);

    let started = stored.status.pause_conditions[0].start_time;
    stored.status.pause_conditions[0].start_time = Time(started.0 - time::Duration::seconds(5));
    let (ctx, _) = f.pass(stored).await;
    assert!(!ctx.new_paused);

    let stored = f.stored();
    assert_eq!(stored.status.current_step_index, Some(1));
    assert!(stored.status.pause_conditions.is_empty());
    assert!(!stored.spec.update_strategy.paused);
}

#[test]
fn steps_are_not_started_without_an_index() {
    let deploy = with_steps(2, vec![partition_step(1)]);
    let status = GameDeploymentStatus::default();
    assert_eq!(current_canary_step(&deploy, &status), (None, None));

    let started = GameDeploymentStatus {
        current_step_index: Some(0),
        ..Default::default()
    };
    assert_eq!(current_canary_step(&deploy, &started).1, Some(0));
}

#[test_log::test(tokio::test)]
async fn rollout_continues_after_a_timed_pause() {
    let mut h = Harness::new();
    let mut deploy = new_game_deployment("web", 2);
    deploy.spec.update_strategy.canary = Some(CanaryStrategy {
        steps: vec![partition_step(1), pause_step(Some(1)), partition_step(0)],
    });
    h.apply(deploy);
    h.settle("web", 4).await;
    assert_eq!(h.deploy("web").status.current_step_index, Some(3));

    let mut deploy = h.deploy("web");
    set_image(&mut deploy, "game:2.0");
    h.apply(deploy);
    h.settle("web", 8).await;

    let mut paused = h.deploy("web");
    assert_eq!(paused.status.current_step_index, Some(1));
    assert!(paused.spec.update_strategy.paused);
    assert_eq!(paused.status.pause_conditions.len(), 1);
    let updated = h
        .pods("web")
        .iter()
        .filter(|p| p.spec.containers[0].image == "game:2.0")
        .count();
    assert_eq!(updated, 1);

    let started = paused.status.pause_conditions[0].start_time;
    paused.status.pause_conditions[0].start_time = Time(started.0 - time::Duration::seconds(5));
    h.apply(paused);
    h.settle("web", 10).await;

    let deploy = h.deploy("web");
    assert!(!deploy.spec.update_strategy.paused);
    assert!(deploy.status.pause_conditions.is_empty());
    assert_eq!(deploy.status.current_step_index, Some(3));
    assert_eq!(deploy.status.current_revision, deploy.status.update_revision);
    let pods = h.pods("web");
    assert_eq!(pods.len(), 2);
    assert!(pods
        .iter()
        .all(|p| p.spec.containers[0].image == "game:2.0"));
}
