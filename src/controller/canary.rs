use std::time::Duration;

use crate::hasher::hash_with_collision_count;
use crate::resources::{
    CanaryStep, GameDeployment, GameDeploymentStatus, HookPhase, HookRun, PauseReason, Time,
    HOOK_REVISION_LABEL, HOOK_RUN_TYPE_LABEL, HOOK_STEP_INDEX_LABEL,
};
use crate::utils::{now, positive_duration};
use crate::Result;

pub const CANARY_STEP_HOOK_TYPE: &str = "canary-step";

/// Everything a reconcile pass knows about the canary rollout of one deployment.
#[derive(Clone, Debug)]
pub struct CanaryContext {
    pub deploy: GameDeployment,
    /// Step hook runs of the current step for the update revision.
    pub current_hook_runs: Vec<HookRun>,
    /// Every other step hook run owned by the deployment.
    pub other_hook_runs: Vec<HookRun>,
    /// Pause conditions to add when the status is written.
    pub pause_reasons: Vec<PauseReason>,
    pub new_status: GameDeploymentStatus,
    pub new_paused: bool,
}

impl CanaryContext {
    /// `hook_runs` must already be filtered to the runs owned by `deploy`.
    pub fn new(deploy: GameDeployment, hook_runs: Vec<HookRun>, update_revision: &str) -> Self {
        let mut new_status = deploy.status.clone();
        new_status.update_revision = update_revision.to_owned();
        let new_paused = deploy.spec.update_strategy.paused;
        let revision_hash = revision_hash(&deploy, update_revision).to_owned();
        let step_index = current_canary_step(&deploy, &new_status)
            .1
            .map(|i| i.to_string());

        let (current_hook_runs, other_hook_runs) = hook_runs
            .into_iter()
            .filter(|r| {
                r.metadata.labels.get(HOOK_RUN_TYPE_LABEL).map(String::as_str)
                    == Some(CANARY_STEP_HOOK_TYPE)
            })
            .partition(|r| {
                r.metadata.labels.get(HOOK_REVISION_LABEL) == Some(&revision_hash)
                    && step_index.is_some()
                    && r.metadata.labels.get(HOOK_STEP_INDEX_LABEL) == step_index.as_ref()
            });

        Self {
            deploy,
            current_hook_runs,
            other_hook_runs,
            pause_reasons: Vec::new(),
            new_status,
            new_paused,
        }
    }

    pub fn current_step(&self) -> (Option<&CanaryStep>, Option<i32>) {
        current_canary_step(&self.deploy, &self.new_status)
    }

    /// The hook run recorded as running for the current step.
    pub fn current_step_hook_run(&self) -> Option<&HookRun> {
        let name = &self.new_status.canary.current_step_hook_run;
        self.current_hook_runs
            .iter()
            .find(|r| !name.is_empty() && &r.metadata.name == name)
            .or_else(|| self.current_hook_runs.first())
    }

    pub fn has_pause_condition(&self, reason: PauseReason) -> bool {
        self.new_status
            .pause_conditions
            .iter()
            .any(|c| c.reason == reason)
    }

    pub fn add_pause_reason(&mut self, reason: PauseReason) {
        if !self.pause_reasons.contains(&reason) {
            self.pause_reasons.push(reason);
        }
    }
}

/// The suffix of a revision name that identifies its content.
pub fn revision_hash<'a>(deploy: &GameDeployment, revision: &'a str) -> &'a str {
    revision
        .strip_prefix(deploy.metadata.name.as_str())
        .and_then(|r| r.strip_prefix('-'))
        .unwrap_or(revision)
}

/// The step at `status.currentStepIndex` and its index.
///
/// Returns `(None, None)` without canary steps or before the steps have started, and
/// `(None, Some(index))` once every step is done.
pub fn current_canary_step<'a>(
    deploy: &'a GameDeployment,
    status: &GameDeploymentStatus,
) -> (Option<&'a CanaryStep>, Option<i32>) {
    let steps = match deploy.canary_steps() {
        Some(steps) if !steps.is_empty() => steps,
        _ => return (None, None),
    };
    let Some(index) = status.current_step_index else {
        return (None, None);
    };
    match usize::try_from(index).ok().and_then(|i| steps.get(i)) {
        Some(step) => (Some(step), Some(index)),
        None => (None, Some(index)),
    }
}

/// How many replicas stay on the current revision right now.
pub fn get_current_partition(deploy: &GameDeployment, status: &GameDeploymentStatus) -> i32 {
    if let Some(partition) = deploy.spec.update_strategy.partition {
        return partition;
    }
    let replicas = deploy.spec.replicas.unwrap_or_default();
    let steps = match deploy.canary_steps() {
        Some(steps) if !steps.is_empty() => steps,
        _ => return 0,
    };
    let Some(index) = status.current_step_index else {
        // not started, hold everything back
        return replicas;
    };
    if index < 0 || index as usize >= steps.len() {
        return 0;
    }
    steps[..=index as usize]
        .iter()
        .rev()
        .find_map(|s| s.partition)
        .unwrap_or(replicas)
}

/// Hash of the canary steps, empty without a canary strategy.
pub fn compute_step_hash(deploy: &GameDeployment) -> Result<String> {
    match &deploy.spec.update_strategy.canary {
        None => Ok(String::new()),
        Some(canary) => {
            let raw = serde_json::to_vec(&canary.steps)?;
            Ok(hash_with_collision_count(&raw, None))
        }
    }
}

fn pause_condition_start(ctx: &CanaryContext, reason: PauseReason) -> Option<Time> {
    ctx.new_status
        .pause_conditions
        .iter()
        .find(|c| c.reason == reason)
        .map(|c| c.start_time)
}

/// Time left on a timed pause step that is currently holding the rollout.
pub fn pause_remaining(ctx: &CanaryContext) -> Option<Duration> {
    let (Some(step), _) = ctx.current_step() else {
        return None;
    };
    let seconds = step.pause.as_ref()?.duration?;
    let start = pause_condition_start(ctx, PauseReason::CanaryPauseStep)?;
    let end = start.0 + time::Duration::seconds(i64::from(seconds));
    positive_duration(end - now())
}

// Whether the pods required by a step are updated and stable.
pub(crate) fn step_pods_ready(status: &GameDeploymentStatus, replicas: i32, partition: i32) -> bool {
    status.updated_ready_replicas >= replicas - partition
        && status.available_replicas == status.ready_replicas
}

/// Whether the current step is finished so the rollout can move to the next one.
pub fn complete_current_canary_step(ctx: &CanaryContext) -> bool {
    let (Some(step), Some(_)) = ctx.current_step() else {
        return false;
    };
    let paused = ctx.deploy.spec.update_strategy.paused;

    if let Some(pause) = &step.pause {
        let Some(start) = pause_condition_start(ctx, PauseReason::CanaryPauseStep) else {
            return false;
        };
        return match pause.duration {
            Some(seconds) => {
                start.0 + time::Duration::seconds(i64::from(seconds)) <= now()
            }
            // waiting on the user to unpause
            None => !paused,
        };
    }

    if let Some(partition) = step.partition {
        let replicas = ctx.deploy.spec.replicas.unwrap_or_default();
        if step.hook.is_none() {
            return step_pods_ready(&ctx.new_status, replicas, partition);
        }
        if !step_pods_ready(&ctx.new_status, replicas, partition) {
            return false;
        }
    }

    if step.hook.is_some() {
        let Some(run) = ctx.current_step_hook_run() else {
            return false;
        };
        if run.status.phase == HookPhase::Successful {
            return true;
        }
        return run.status.phase.is_unexpected()
            && ctx.has_pause_condition(PauseReason::StepBasedHookRunInconclusive)
            && !paused;
    }

    false
}
