use std::sync::Arc;

use maplit::btreemap;
use serde_json::json;
use tracing::{debug, info};

use crate::cluster::{ObjectClient, ObjectStore};
use crate::controller::canary::{revision_hash, CanaryContext, CANARY_STEP_HOOK_TYPE};
use crate::hook::run::{deletion_time_arg, new_hook_run};
use crate::resources::{
    PauseReason, HOOK_REVISION_LABEL, HOOK_RUN_TYPE_LABEL, HOOK_STEP_INDEX_LABEL,
};
use crate::Result;

/// Keeps at most one live hook run for the current canary step.
pub struct StepHookControl {
    client: Arc<dyn ObjectClient>,
    store: Arc<dyn ObjectStore>,
}

impl StepHookControl {
    pub fn new(client: Arc<dyn ObjectClient>, store: Arc<dyn ObjectStore>) -> Self {
        Self { client, store }
    }

    #[tracing::instrument(skip_all, fields(deploy = ctx.deploy.metadata.name))]
    pub async fn reconcile(&self, ctx: &mut CanaryContext) -> Result<()> {
        let update_revision = ctx.new_status.update_revision.clone();
        let hash = revision_hash(&ctx.deploy, &update_revision).to_owned();

        let (hook, index) = match ctx.current_step() {
            (Some(step), Some(index)) => (step.hook.clone(), index),
            _ => (None, 0),
        };
        let blocked =
            ctx.deploy.spec.update_strategy.paused && !ctx.new_status.pause_conditions.is_empty();

        if let Some(hook) = hook {
            match ctx.current_step_hook_run().cloned() {
                Some(run) => {
                    ctx.new_status.canary.current_step_hook_run = run.metadata.name.clone();
                    if run.status.phase.is_unexpected()
                        && !ctx.has_pause_condition(PauseReason::StepBasedHookRunInconclusive)
                    {
                        info!(run = run.metadata.name, phase = ?run.status.phase, "Step hook run ended unexpectedly, pausing");
                        ctx.add_pause_reason(PauseReason::StepBasedHookRunInconclusive);
                    }
                }
                None if !blocked => {
                    let name = format!(
                        "{}-{}-{}-{}",
                        ctx.deploy.metadata.name, hash, index, hook.template_name
                    );
                    let labels = btreemap! {
                        HOOK_RUN_TYPE_LABEL.to_owned() => CANARY_STEP_HOOK_TYPE.to_owned(),
                        HOOK_REVISION_LABEL.to_owned() => hash.clone(),
                        HOOK_STEP_INDEX_LABEL.to_owned() => index.to_string(),
                    };
                    // a step run is not tied to one pod, so only the time is injected
                    let injected = [deletion_time_arg()];
                    let run = new_hook_run(
                        self.store.as_ref(),
                        &ctx.deploy,
                        &hook,
                        name,
                        labels,
                        &injected,
                    )?;
                    let created = match self.client.create_hook_run(&run).await {
                        Ok(created) => {
                            info!(run = created.metadata.name, step = index, "Created step hook run");
                            created
                        }
                        Err(e) if e.is_already_exists() => run,
                        Err(e) => return Err(e.into()),
                    };
                    ctx.new_status.canary.current_step_hook_run = created.metadata.name.clone();
                    ctx.current_hook_runs.push(created);
                }
                None => debug!(step = index, "Rollout paused, not starting step hook"),
            }
        }

        for run in &ctx.other_hook_runs {
            let same_revision = run.metadata.labels.get(HOOK_REVISION_LABEL) == Some(&hash);
            if same_revision {
                if run.spec.terminate || run.status.phase.is_completed() {
                    continue;
                }
                debug!(run = run.metadata.name, "Terminating step hook run");
                self.client
                    .patch_hook_run(
                        &run.metadata.namespace,
                        &run.metadata.name,
                        &json!({"spec": {"terminate": true}}),
                    )
                    .await?;
            } else {
                debug!(run = run.metadata.name, "Deleting step hook run of an old revision");
                match self
                    .client
                    .delete_hook_run(&run.metadata.namespace, &run.metadata.name)
                    .await
                {
                    Err(e) if !e.is_not_found() => return Err(e.into()),
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
