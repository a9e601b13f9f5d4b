use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::cluster::ObjectClient;
use crate::controller::canary::{
    complete_current_canary_step, compute_step_hash, get_current_partition, pause_remaining,
    step_pods_ready, CanaryContext,
};
use crate::controller::core::WorkloadControl;
use crate::controller::util::is_pod_ready;
use crate::resources::{GameDeploymentStatus, PauseCondition, PauseReason, Pod, Time};
use crate::Result;

/// Insert `field` into `patch` when it differs between `old` and `new`.
fn diff_field<T: PartialEq + Serialize>(
    patch: &mut Map<String, Value>,
    name: &str,
    old: &T,
    new: &T,
) -> Result<()> {
    if old != new {
        patch.insert(name.to_owned(), serde_json::to_value(new)?);
    }
    Ok(())
}

/// The merge patch turning `old` into `new`, empty when nothing changed.
pub fn status_patch(old: &GameDeploymentStatus, new: &GameDeploymentStatus) -> Result<Map<String, Value>> {
    let mut p = Map::new();
    diff_field(&mut p, "observedGeneration", &old.observed_generation, &new.observed_generation)?;
    diff_field(&mut p, "replicas", &old.replicas, &new.replicas)?;
    diff_field(&mut p, "readyReplicas", &old.ready_replicas, &new.ready_replicas)?;
    diff_field(&mut p, "availableReplicas", &old.available_replicas, &new.available_replicas)?;
    diff_field(&mut p, "updatedReplicas", &old.updated_replicas, &new.updated_replicas)?;
    diff_field(
        &mut p,
        "updatedReadyReplicas",
        &old.updated_ready_replicas,
        &new.updated_ready_replicas,
    )?;
    diff_field(&mut p, "currentRevision", &old.current_revision, &new.current_revision)?;
    diff_field(&mut p, "updateRevision", &old.update_revision, &new.update_revision)?;
    diff_field(&mut p, "collisionCount", &old.collision_count, &new.collision_count)?;
    diff_field(&mut p, "labelSelector", &old.label_selector, &new.label_selector)?;
    diff_field(&mut p, "currentStepIndex", &old.current_step_index, &new.current_step_index)?;
    diff_field(&mut p, "currentStepHash", &old.current_step_hash, &new.current_step_hash)?;
    diff_field(&mut p, "canary", &old.canary, &new.canary)?;
    diff_field(&mut p, "pauseConditions", &old.pause_conditions, &new.pause_conditions)?;
    diff_field(
        &mut p,
        "preDeleteHookConditions",
        &old.pre_delete_hook_conditions,
        &new.pre_delete_hook_conditions,
    )?;
    diff_field(
        &mut p,
        "preInplaceHookConditions",
        &old.pre_inplace_hook_conditions,
        &new.pre_inplace_hook_conditions,
    )?;
    diff_field(
        &mut p,
        "postInplaceHookConditions",
        &old.post_inplace_hook_conditions,
        &new.post_inplace_hook_conditions,
    )?;
    diff_field(&mut p, "conditions", &old.conditions, &new.conditions)?;
    Ok(p)
}

/// Derives the status of a deployment after a pass and writes what changed.
pub struct StatusUpdater {
    client: Arc<dyn ObjectClient>,
    workload: Arc<dyn WorkloadControl>,
}

impl StatusUpdater {
    pub fn new(client: Arc<dyn ObjectClient>, workload: Arc<dyn WorkloadControl>) -> Self {
        Self { client, workload }
    }

    /// Replica counts and revisions from the observed pods.
    pub fn calculate_status(
        &self,
        ctx: &mut CanaryContext,
        pods: &[Pod],
        current_revision: &str,
        update_revision: &str,
        collision_count: i32,
    ) {
        let deploy = &ctx.deploy;
        let min_ready_seconds = deploy.spec.min_ready_seconds;
        let status = &mut ctx.new_status;
        status.observed_generation = deploy.metadata.generation;
        status.update_revision = update_revision.to_owned();
        status.collision_count = Some(collision_count);
        status.label_selector = Some(deploy.spec.selector.to_string());

        status.replicas = pods.len() as i32;
        status.ready_replicas = 0;
        status.available_replicas = 0;
        status.updated_replicas = 0;
        status.updated_ready_replicas = 0;
        for pod in pods {
            let available = self.workload.is_pod_update_ready(pod, min_ready_seconds);
            let updated = pod.revision() == Some(update_revision);
            if is_pod_ready(pod) {
                status.ready_replicas += 1;
            }
            if available {
                status.available_replicas += 1;
            }
            if updated {
                status.updated_replicas += 1;
                if available {
                    status.updated_ready_replicas += 1;
                }
            }
        }

        let replicas = deploy.spec.replicas.unwrap_or_default();
        status.current_revision = if status.updated_replicas == replicas {
            update_revision.to_owned()
        } else {
            current_revision.to_owned()
        };
    }

    // Start the steps over, or skip them when everything already runs the update revision.
    fn reset_steps(ctx: &mut CanaryContext, step_hash: String) {
        let step_count = ctx.deploy.canary_steps().map_or(0, <[_]>::len) as i32;
        let fully_rolled = ctx.new_status.current_revision == ctx.new_status.update_revision;
        if !ctx.new_status.pause_conditions.is_empty() {
            ctx.new_status.pause_conditions.clear();
            ctx.new_paused = false;
        }
        ctx.new_status.current_step_index = ctx
            .deploy
            .spec
            .update_strategy
            .canary
            .as_ref()
            .map(|_| if fully_rolled { step_count } else { 0 });
        ctx.new_status.canary.current_step_hook_run = String::new();
        if fully_rolled || step_count == 0 {
            ctx.new_status.canary.revision = ctx.new_status.update_revision.clone();
        }
        ctx.new_status.current_step_hash = step_hash;
    }

    // Move the canary state forward, the first matching rule wins.
    fn advance_canary(&self, ctx: &mut CanaryContext) -> Result<()> {
        let step_hash = compute_step_hash(&ctx.deploy)?;
        let old = &ctx.deploy.status;
        let update_revision = ctx.new_status.update_revision.clone();
        let steps = ctx.deploy.canary_steps();
        let step_count = steps.map_or(0, <[_]>::len) as i32;

        if old.current_step_hash != step_hash {
            info!("Canary steps changed, restarting steps");
            Self::reset_steps(ctx, step_hash);
            return Ok(());
        }
        if !old.update_revision.is_empty() && old.update_revision != update_revision {
            info!(revision = update_revision, "Update revision changed, restarting steps");
            Self::reset_steps(ctx, step_hash);
            return Ok(());
        }
        if ctx.new_status.canary.revision.is_empty() {
            if ctx.deploy.spec.update_strategy.canary.is_none() {
                ctx.new_status.canary.revision = update_revision;
            } else if step_count == 0 {
                ctx.new_status.current_step_index = Some(step_count);
            }
            return Ok(());
        }
        if step_count == 0 {
            ctx.new_status.canary.revision = update_revision;
            return Ok(());
        }
        if ctx.new_status.current_step_index == Some(step_count) {
            ctx.new_status.canary.revision = update_revision;
            return Ok(());
        }
        if complete_current_canary_step(ctx) {
            let next = ctx.new_status.current_step_index.unwrap_or(0) + 1;
            info!(step = next, "Canary step completed");
            ctx.new_status.current_step_index = Some(next);
            ctx.new_status.canary.current_step_hook_run = String::new();
            // lift the pause this controller put on the rollout
            if !ctx.new_status.pause_conditions.is_empty() {
                ctx.new_status.pause_conditions.clear();
                ctx.new_paused = false;
            }
            if next == step_count {
                ctx.new_status.canary.revision = update_revision;
            }
            return Ok(());
        }

        // the step is still running, pause when it asks for it
        let (step, _) = ctx.current_step();
        let wants_pause = step.map_or(false, |s| s.pause.is_some());
        if wants_pause && !ctx.has_pause_condition(PauseReason::CanaryPauseStep) {
            let replicas = ctx.deploy.spec.replicas.unwrap_or_default();
            let partition = get_current_partition(&ctx.deploy, &ctx.new_status);
            if step_pods_ready(&ctx.new_status, replicas, partition) {
                ctx.add_pause_reason(PauseReason::CanaryPauseStep);
            }
        }
        let mut added = false;
        for reason in std::mem::take(&mut ctx.pause_reasons) {
            if !ctx.has_pause_condition(reason) {
                debug!(?reason, "Adding pause condition");
                ctx.new_status.pause_conditions.push(PauseCondition {
                    reason,
                    start_time: Time::now(),
                });
                added = true;
            }
        }
        if added {
            ctx.new_paused = true;
        }
        Ok(())
    }

    /// Compute the new status of `ctx.deploy` and write it. Returns how long a timed pause still
    /// holds the rollout.
    #[tracing::instrument(skip_all, fields(deploy = ctx.deploy.metadata.name))]
    pub async fn update_status(
        &self,
        ctx: &mut CanaryContext,
        pods: &[Pod],
        current_revision: &str,
        update_revision: &str,
        collision_count: i32,
    ) -> Result<Option<Duration>> {
        self.calculate_status(ctx, pods, current_revision, update_revision, collision_count);
        self.advance_canary(ctx)?;
        self.write(ctx).await?;
        Ok(pause_remaining(ctx))
    }

    async fn write(&self, ctx: &CanaryContext) -> Result<()> {
        let deploy = &ctx.deploy;
        let (namespace, name) = (&deploy.metadata.namespace, &deploy.metadata.name);

        if ctx.new_paused != deploy.spec.update_strategy.paused {
            info!(paused = ctx.new_paused, "Updating paused");
            self.client
                .patch_game_deployment(
                    namespace,
                    name,
                    &json!({"spec": {"updateStrategy": {"paused": ctx.new_paused}}}),
                )
                .await?;
        }

        let patch = status_patch(&deploy.status, &ctx.new_status)?;
        if patch.is_empty() {
            debug!("Status unchanged");
            return Ok(());
        }
        debug!(fields = ?patch.keys().collect::<Vec<_>>(), "Patching status");
        self.client
            .patch_game_deployment_status(namespace, name, &json!({ "status": patch }))
            .await?;
        Ok(())
    }
}
