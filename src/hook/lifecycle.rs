use std::{collections::BTreeSet, sync::Arc};

use maplit::btreemap;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cluster::{ObjectClient, ObjectStore};
use crate::controller::canary::revision_hash;
use crate::controller::util::is_controlled_by;
use crate::hook::run::{
    arg, deletion_time_arg, new_hook_run, ARG_HOST_IP, ARG_POD_INSTANCE_ID, ARG_POD_IP,
    ARG_POD_NAME, ARG_POD_NAMESPACE,
};
use crate::resources::{
    GameDeployment, GameDeploymentStatus, HookArgument, HookPhase, HookRun, LifecycleHookStrategy, Pod,
    PodHookCondition, PodPhase, Time, HOOK_POD_INSTANCE_ID_LABEL, HOOK_REVISION_LABEL,
    HOOK_RUN_TYPE_LABEL, POD_DELETING_ANNOTATION,
};
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    PreDelete,
    PreInplace,
    PostInplace,
}

impl HookKind {
    pub const ALL: [HookKind; 3] = [HookKind::PreDelete, HookKind::PreInplace, HookKind::PostInplace];

    /// Value of the hook run type label.
    pub fn label(&self) -> &'static str {
        match self {
            HookKind::PreDelete => "pre-delete",
            HookKind::PreInplace => "pre-inplace",
            HookKind::PostInplace => "post-inplace",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.label() == label)
    }

    fn strategy<'a>(&self, deploy: &'a GameDeployment) -> &'a LifecycleHookStrategy {
        match self {
            HookKind::PreDelete => &deploy.spec.pre_delete_update_strategy,
            HookKind::PreInplace => &deploy.spec.pre_inplace_update_strategy,
            HookKind::PostInplace => &deploy.spec.post_inplace_update_strategy,
        }
    }

    fn conditions_mut<'a>(&self, status: &'a mut GameDeploymentStatus) -> &'a mut Vec<PodHookCondition> {
        match self {
            HookKind::PreDelete => &mut status.pre_delete_hook_conditions,
            HookKind::PreInplace => &mut status.pre_inplace_hook_conditions,
            HookKind::PostInplace => &mut status.post_inplace_hook_conditions,
        }
    }
}

/// Name of the run gating `kind` for `pod` at the given revision.
pub fn hook_run_name(kind: HookKind, pod: &Pod, revision_hash: &str) -> String {
    format!("{}-{}-{}", kind.label(), pod.metadata.name, revision_hash)
}

fn set_hook_condition(
    kind: HookKind,
    status: &mut GameDeploymentStatus,
    pod_name: &str,
    phase: HookPhase,
) {
    let conditions = kind.conditions_mut(status);
    match conditions.iter_mut().find(|c| c.pod_name == pod_name) {
        Some(c) => {
            if phase.is_unexpected() && c.pause_time.is_none() {
                c.pause_time = Some(Time::now());
            }
            c.hook_phase = phase;
        }
        None => conditions.push(PodHookCondition {
            pod_name: pod_name.to_owned(),
            start_time: Time::now(),
            hook_phase: phase,
            pause_time: None,
        }),
    }
}

fn remove_hook_condition(kind: HookKind, status: &mut GameDeploymentStatus, pod_name: &str) {
    kind.conditions_mut(status).retain(|c| c.pod_name != pod_name);
}

/// Runs the pre-delete, pre-inplace and post-inplace hooks of a deployment's pods.
pub struct LifecycleHookControl {
    client: Arc<dyn ObjectClient>,
    store: Arc<dyn ObjectStore>,
}

impl LifecycleHookControl {
    pub fn new(client: Arc<dyn ObjectClient>, store: Arc<dyn ObjectStore>) -> Self {
        Self { client, store }
    }

    fn find_run(&self, namespace: &str, name: &str) -> Option<HookRun> {
        self.store
            .hook_runs(namespace)
            .into_iter()
            .find(|r| r.metadata.name == name)
    }

    fn injected_args(kind: HookKind, pod: &Pod) -> Vec<HookArgument> {
        let mut args = vec![
            arg(ARG_POD_NAME, pod.metadata.name.clone()),
            arg(ARG_POD_NAMESPACE, pod.metadata.namespace.clone()),
            arg(ARG_POD_IP, pod.status.pod_ip.clone().unwrap_or_default()),
            arg(ARG_HOST_IP, pod.status.host_ip.clone().unwrap_or_default()),
            arg(ARG_POD_INSTANCE_ID, pod.instance_id().unwrap_or_default()),
        ];
        if kind == HookKind::PreDelete {
            args.push(deletion_time_arg());
        }
        args
    }

    // Create the run, an existing run of the same name counts as created.
    async fn create_run(
        &self,
        kind: HookKind,
        deploy: &GameDeployment,
        pod: &Pod,
        revision: &str,
    ) -> Result<bool> {
        let Some(hook) = &kind.strategy(deploy).hook else {
            return Ok(false);
        };
        let hash = revision_hash(deploy, revision);
        let labels = btreemap! {
            HOOK_RUN_TYPE_LABEL.to_owned() => kind.label().to_owned(),
            HOOK_POD_INSTANCE_ID_LABEL.to_owned() => pod.instance_id().unwrap_or_default().to_owned(),
            HOOK_REVISION_LABEL.to_owned() => hash.to_owned(),
        };
        let run = new_hook_run(
            self.store.as_ref(),
            deploy,
            hook,
            hook_run_name(kind, pod, hash),
            labels,
            &Self::injected_args(kind, pod),
        )?;
        match self.client.create_hook_run(&run).await {
            Ok(created) => {
                info!(hook = kind.label(), pod = pod.metadata.name, run = created.metadata.name, "Created hook run");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn check(
        &self,
        kind: HookKind,
        deploy: &GameDeployment,
        pod: &Pod,
        revision: &str,
        status: &mut GameDeploymentStatus,
    ) -> Result<bool> {
        let strategy = kind.strategy(deploy);
        if strategy.hook.is_none() || pod.status.phase != PodPhase::Running {
            return Ok(true);
        }
        let name = hook_run_name(kind, pod, revision_hash(deploy, revision));
        let Some(run) = self.find_run(&pod.metadata.namespace, &name) else {
            self.create_run(kind, deploy, pod, revision).await?;
            if kind == HookKind::PreDelete {
                let patch = json!({"metadata": {"annotations": {POD_DELETING_ANNOTATION: "true"}}});
                self.client
                    .patch_pod(&pod.metadata.namespace, &pod.metadata.name, &patch)
                    .await?;
            }
            set_hook_condition(kind, status, &pod.metadata.name, HookPhase::Pending);
            return Ok(false);
        };

        let phase = run.status.phase;
        if phase == HookPhase::Successful {
            set_hook_condition(kind, status, &pod.metadata.name, phase);
            return Ok(true);
        }
        if phase.is_unexpected() && strategy.retry_unexpected_hooks {
            info!(hook = kind.label(), run = name, ?phase, "Retrying unexpected hook run");
            match self.client.delete_hook_run(&run.metadata.namespace, &name).await {
                Err(e) if !e.is_not_found() => return Err(e.into()),
                _ => {}
            }
            remove_hook_condition(kind, status, &pod.metadata.name);
            return Ok(false);
        }
        debug!(hook = kind.label(), run = name, ?phase, "Hook run not completed");
        set_hook_condition(kind, status, &pod.metadata.name, phase);
        Ok(false)
    }

    /// Whether `pod` may be deleted now. Starts the pre-delete hook on the first call.
    pub async fn check_delete(
        &self,
        deploy: &GameDeployment,
        pod: &Pod,
        status: &mut GameDeploymentStatus,
    ) -> Result<bool> {
        let revision = pod.revision().unwrap_or_default().to_owned();
        self.check(HookKind::PreDelete, deploy, pod, &revision, status)
            .await
    }

    /// Whether `pod` may be updated in place to `update_revision`.
    pub async fn check_inplace(
        &self,
        deploy: &GameDeployment,
        pod: &Pod,
        update_revision: &str,
        status: &mut GameDeploymentStatus,
    ) -> Result<bool> {
        self.check(HookKind::PreInplace, deploy, pod, update_revision, status)
            .await
    }

    /// Start the post-inplace hook for a pod that was just updated. Returns whether a run was
    /// created.
    pub async fn create_post_inplace_hook(
        &self,
        deploy: &GameDeployment,
        pod: &Pod,
        status: &mut GameDeploymentStatus,
    ) -> Result<bool> {
        let revision = pod.revision().unwrap_or_default().to_owned();
        let created = self
            .create_run(HookKind::PostInplace, deploy, pod, &revision)
            .await?;
        if created {
            set_hook_condition(HookKind::PostInplace, status, &pod.metadata.name, HookPhase::Pending);
        }
        Ok(created)
    }

    /// Refresh the post-inplace condition of `pod` from its run.
    pub async fn update_post_inplace_hook(
        &self,
        deploy: &GameDeployment,
        pod: &Pod,
        status: &mut GameDeploymentStatus,
    ) -> Result<()> {
        let kind = HookKind::PostInplace;
        if !status
            .post_inplace_hook_conditions
            .iter()
            .any(|c| c.pod_name == pod.metadata.name)
        {
            return Ok(());
        }
        let name = hook_run_name(kind, pod, revision_hash(deploy, pod.revision().unwrap_or_default()));
        match self.find_run(&pod.metadata.namespace, &name) {
            Some(run) => set_hook_condition(kind, status, &pod.metadata.name, run.status.phase),
            None => remove_hook_condition(kind, status, &pod.metadata.name),
        }
        Ok(())
    }

    /// Delete lifecycle runs and conditions of pods that are gone, and pre-inplace runs of pods
    /// that already reached the revision they gated.
    #[tracing::instrument(skip_all, fields(deploy = deploy.metadata.name))]
    pub async fn cleanup(
        &self,
        deploy: &GameDeployment,
        pods: &[Pod],
        status: &mut GameDeploymentStatus,
    ) -> Result<()> {
        let names = pods
            .iter()
            .map(|p| p.metadata.name.as_str())
            .collect::<BTreeSet<_>>();
        let runs = self
            .store
            .hook_runs(&deploy.metadata.namespace)
            .into_iter()
            .filter(|r| is_controlled_by(&r.metadata, &deploy.metadata));
        for run in runs {
            let Some(kind) = run
                .metadata
                .labels
                .get(HOOK_RUN_TYPE_LABEL)
                .and_then(|l| HookKind::from_label(l))
            else {
                continue;
            };
            let instance = run.metadata.labels.get(HOOK_POD_INSTANCE_ID_LABEL);
            let pod = pods.iter().find(|p| p.instance_id() == instance.map(String::as_str));
            let stale = match pod {
                None => true,
                Some(pod) => {
                    kind == HookKind::PreInplace
                        && run.status.phase.is_completed()
                        && pod.revision().map(|r| revision_hash(deploy, r))
                            == run.metadata.labels.get(HOOK_REVISION_LABEL).map(String::as_str)
                }
            };
            if !stale {
                continue;
            }
            debug!(run = run.metadata.name, "Deleting stale hook run");
            match self
                .client
                .delete_hook_run(&run.metadata.namespace, &run.metadata.name)
                .await
            {
                Err(e) if !e.is_not_found() => {
                    warn!(run = run.metadata.name, error = %e, "Failed to delete stale hook run");
                    return Err(e.into());
                }
                _ => {}
            }
        }
        for kind in HookKind::ALL {
            kind.conditions_mut(status)
                .retain(|c| names.contains(c.pod_name.as_str()));
        }
        Ok(())
    }
}
