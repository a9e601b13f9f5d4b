use std::{sync::Arc, time::Duration};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterEvent, ObjectClient, ObjectStore};
use crate::controller::canary::{get_current_partition, CanaryContext};
use crate::controller::core::{CommonControl, WorkloadControl};
use crate::controller::scale::{ScaleControl, ScaleRequest};
use crate::controller::status::StatusUpdater;
use crate::controller::update::UpdateControl;
use crate::controller::util::{
    is_controlled_by, is_pod_active, new_condition, new_controller_ref, remove_condition,
    set_condition,
};
use crate::expectations::{ScaleAction, ScaleExpectations, UpdateExpectations};
use crate::hook::{LifecycleHookControl, StepHookControl};
use crate::resources::{ConditionStatus, GameDeployment, GameDeploymentConditionType, Pod};
use crate::revision::{apply_revision, sort_revisions, RevisionControl};
use crate::utils::{min_delay, split_key};
use crate::Result;

pub const DEFAULT_EXPECTATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Reconciles GameDeployments one key at a time.
pub struct GameDeploymentController {
    store: Arc<dyn ObjectStore>,
    client: Arc<dyn ObjectClient>,
    scale_expectations: Arc<ScaleExpectations>,
    update_expectations: Arc<UpdateExpectations>,
    workload: Arc<dyn WorkloadControl>,
    revisions: RevisionControl,
    step_hooks: StepHookControl,
    lifecycle_hooks: Arc<LifecycleHookControl>,
    scale: ScaleControl,
    update: UpdateControl,
    status: StatusUpdater,
    expectation_timeout: Duration,
}

impl GameDeploymentController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        client: Arc<dyn ObjectClient>,
        expectation_timeout: Duration,
    ) -> Self {
        let workload: Arc<dyn WorkloadControl> = Arc::new(CommonControl);
        let scale_expectations = Arc::new(ScaleExpectations::new());
        let update_expectations = Arc::new(UpdateExpectations::new());
        let lifecycle_hooks = Arc::new(LifecycleHookControl::new(
            Arc::clone(&client),
            Arc::clone(&store),
        ));
        Self {
            revisions: RevisionControl::new(Arc::clone(&client)),
            step_hooks: StepHookControl::new(Arc::clone(&client), Arc::clone(&store)),
            scale: ScaleControl::new(
                Arc::clone(&client),
                Arc::clone(&store),
                Arc::clone(&workload),
                Arc::clone(&lifecycle_hooks),
                Arc::clone(&scale_expectations),
            ),
            update: UpdateControl::new(
                Arc::clone(&client),
                Arc::clone(&workload),
                Arc::clone(&lifecycle_hooks),
                Arc::clone(&scale_expectations),
                Arc::clone(&update_expectations),
            ),
            status: StatusUpdater::new(Arc::clone(&client), Arc::clone(&workload)),
            lifecycle_hooks,
            workload,
            scale_expectations,
            update_expectations,
            store,
            client,
            expectation_timeout,
        }
    }

    pub fn scale_expectations(&self) -> &ScaleExpectations {
        &self.scale_expectations
    }

    pub fn update_expectations(&self) -> &UpdateExpectations {
        &self.update_expectations
    }

    /// Adopt matching orphans and release owned pods that stopped matching. Returns every pod the
    /// deployment owns afterwards.
    async fn claim_pods(&self, deploy: &GameDeployment) -> Result<Vec<Pod>> {
        let selector = &deploy.spec.selector;
        let deleting = deploy.metadata.deletion_timestamp.is_some();
        let mut owned = Vec::new();
        for pod in self.store.pods(&deploy.metadata.namespace) {
            let matches = !selector.is_empty() && selector.matches(&pod.metadata.labels);
            match pod.metadata.controller_ref() {
                Some(_) if is_controlled_by(&pod.metadata, &deploy.metadata) => {
                    if matches || deleting {
                        owned.push(pod);
                        continue;
                    }
                    info!(pod = pod.metadata.name, "Releasing pod that no longer matches");
                    let refs = pod
                        .metadata
                        .owner_references
                        .iter()
                        .filter(|r| r.uid != deploy.metadata.uid)
                        .collect::<Vec<_>>();
                    match self
                        .client
                        .patch_pod(
                            &pod.metadata.namespace,
                            &pod.metadata.name,
                            &json!({"metadata": {"ownerReferences": refs}}),
                        )
                        .await
                    {
                        Err(e) if !e.is_not_found() => return Err(e.into()),
                        _ => {}
                    }
                }
                Some(_) => {}
                None => {
                    if !matches || deleting || !is_pod_active(&pod) {
                        continue;
                    }
                    info!(pod = pod.metadata.name, "Adopting orphan pod");
                    let mut refs = pod.metadata.owner_references.clone();
                    refs.push(new_controller_ref(&deploy.metadata, &GameDeployment::GVK));
                    match self
                        .client
                        .patch_pod(
                            &pod.metadata.namespace,
                            &pod.metadata.name,
                            &json!({"metadata": {"ownerReferences": refs}}),
                        )
                        .await
                    {
                        Ok(adopted) => owned.push(adopted),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(owned)
    }

    /// Run one reconcile pass for `key`. Returns when the key should be looked at again.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self, key: &str) -> Result<Option<Duration>> {
        let (namespace, name) = split_key(key)?;
        let Some(deploy) = self.store.game_deployment(namespace, name) else {
            debug!("GameDeployment gone, dropping expectations");
            self.scale_expectations.delete_expectations(key);
            self.update_expectations.delete_expectations(key);
            return Ok(None);
        };

        let all_pods = self.claim_pods(&deploy).await?;
        let pods = all_pods
            .iter()
            .filter(|p| is_pod_active(p))
            .cloned()
            .collect::<Vec<_>>();

        let mut revisions = self
            .store
            .controller_revisions(namespace)
            .into_iter()
            .filter(|r| is_controlled_by(&r.metadata, &deploy.metadata))
            .collect::<Vec<_>>();
        sort_revisions(&mut revisions);
        let active = self
            .revisions
            .get_active_revisions(&deploy, &revisions, &pods)
            .await?;
        match revisions
            .iter_mut()
            .find(|r| r.metadata.name == active.update.metadata.name)
        {
            Some(r) => *r = active.update.clone(),
            None => revisions.push(active.update.clone()),
        }
        sort_revisions(&mut revisions);
        let (current, update) = (&active.current, &active.update);

        let (satisfied, unsatisfied_for, outstanding) =
            self.scale_expectations.satisfied_expectations(key);
        if !satisfied {
            if unsatisfied_for > self.expectation_timeout {
                warn!(?outstanding, elapsed = ?unsatisfied_for, "Scale expectations unsatisfied for too long");
                return Ok(Some(self.expectation_timeout));
            }
            debug!(?outstanding, "Waiting on scale expectations");
            return Ok(Some(self.expectation_timeout.saturating_sub(unsatisfied_for)));
        }
        for pod in &pods {
            self.update_expectations
                .observe_updated(key, &update.metadata.name, pod);
        }
        let (satisfied, unsatisfied_for, outstanding) = self
            .update_expectations
            .satisfied_expectations(key, &update.metadata.name);
        if !satisfied {
            if unsatisfied_for > self.expectation_timeout {
                warn!(?outstanding, elapsed = ?unsatisfied_for, "Update expectations unsatisfied for too long");
                return Ok(Some(self.expectation_timeout));
            }
            debug!(?outstanding, "Waiting on update expectations");
            return Ok(Some(self.expectation_timeout.saturating_sub(unsatisfied_for)));
        }

        self.workload.validate_update(&deploy)?;
        let current_deploy = apply_revision(&deploy, current)?;
        let update_deploy = apply_revision(&deploy, update)?;

        let hook_runs = self
            .store
            .hook_runs(namespace)
            .into_iter()
            .filter(|r| is_controlled_by(&r.metadata, &deploy.metadata))
            .collect();
        let mut ctx = CanaryContext::new(deploy.clone(), hook_runs, &update.metadata.name);
        self.step_hooks.reconcile(&mut ctx).await?;
        self.lifecycle_hooks
            .cleanup(&deploy, &all_pods, &mut ctx.new_status)
            .await?;

        let partition = get_current_partition(&deploy, &ctx.new_status);
        let mut delay = None;
        let scaled = self
            .scale
            .manage(
                ScaleRequest {
                    deploy: &deploy,
                    current_deploy: &current_deploy,
                    update_deploy: &update_deploy,
                    current_revision: &current.metadata.name,
                    update_revision: &update.metadata.name,
                    pods: &pods,
                    all_pods: &all_pods,
                    partition,
                },
                &mut ctx.new_status,
            )
            .await;
        let sync_result = match scaled {
            Err(e) => {
                set_condition(
                    &mut ctx.new_status,
                    new_condition(
                        GameDeploymentConditionType::FailedScale,
                        ConditionStatus::True,
                        "ScaleFailed".to_owned(),
                        e.to_string(),
                    ),
                );
                Err(e)
            }
            Ok(true) => {
                remove_condition(&mut ctx.new_status, GameDeploymentConditionType::FailedScale);
                Ok(())
            }
            Ok(false) => {
                remove_condition(&mut ctx.new_status, GameDeploymentConditionType::FailedScale);
                match self
                    .update
                    .manage(&deploy, update, &revisions, &pods, partition, &mut ctx.new_status)
                    .await
                {
                    Ok(d) => {
                        remove_condition(&mut ctx.new_status, GameDeploymentConditionType::FailedUpdate);
                        delay = d;
                        Ok(())
                    }
                    Err(e) => {
                        set_condition(
                            &mut ctx.new_status,
                            new_condition(
                                GameDeploymentConditionType::FailedUpdate,
                                ConditionStatus::True,
                                "UpdateFailed".to_owned(),
                                e.to_string(),
                            ),
                        );
                        Err(e)
                    }
                }
            }
        };

        let pause_delay = self
            .status
            .update_status(
                &mut ctx,
                &pods,
                &current.metadata.name,
                &update.metadata.name,
                active.collision_count,
            )
            .await?;
        delay = min_delay(delay, pause_delay);
        sync_result?;

        self.prune_pods_to_delete(&deploy, &all_pods).await?;
        self.revisions
            .truncate_history(&deploy, &revisions, &all_pods, current, update)
            .await?;

        let min_ready_seconds = deploy.spec.min_ready_seconds;
        if min_ready_seconds > 0
            && ctx.new_status.available_replicas != ctx.new_status.ready_replicas
        {
            delay = min_delay(delay, Some(Duration::from_secs(min_ready_seconds as u64)));
        }
        Ok(delay)
    }

    // Drop names from podsToDelete that no longer exist.
    async fn prune_pods_to_delete(&self, deploy: &GameDeployment, pods: &[Pod]) -> Result<()> {
        let names = &deploy.spec.scale_strategy.pods_to_delete;
        if names.is_empty() {
            return Ok(());
        }
        let remaining = names
            .iter()
            .filter(|n| pods.iter().any(|p| &p.metadata.name == *n))
            .cloned()
            .collect::<Vec<_>>();
        if remaining.len() == names.len() {
            return Ok(());
        }
        debug!(?remaining, "Pruning podsToDelete");
        self.client
            .patch_game_deployment(
                &deploy.metadata.namespace,
                &deploy.metadata.name,
                &json!({"spec": {"scaleStrategy": {"podsToDelete": remaining}}}),
            )
            .await?;
        Ok(())
    }

    fn pod_owner_key(pod: &Pod) -> Option<String> {
        pod.metadata
            .controller_ref()
            .filter(|r| r.kind == GameDeployment::GVK.kind)
            .map(|r| format!("{}/{}", pod.metadata.namespace, r.name))
    }

    /// Observe the expectations an event satisfies and return the keys to requeue.
    pub fn handle_event(&self, event: &ClusterEvent) -> Vec<String> {
        match event {
            ClusterEvent::PodApplied(pod) => match Self::pod_owner_key(pod) {
                Some(key) => {
                    self.scale_expectations
                        .observe_scale(&key, ScaleAction::Create, &pod.metadata.name);
                    if pod.metadata.deletion_timestamp.is_some() {
                        self.scale_expectations
                            .observe_scale(&key, ScaleAction::Delete, &pod.metadata.name);
                    }
                    self.update_expectations.observe_pod(&key, pod);
                    vec![key]
                }
                // an orphan may be adopted by any deployment selecting it
                None => self
                    .store
                    .game_deployments(&pod.metadata.namespace)
                    .into_iter()
                    .filter(|d| {
                        !d.spec.selector.is_empty() && d.spec.selector.matches(&pod.metadata.labels)
                    })
                    .map(|d| d.key())
                    .collect(),
            },
            ClusterEvent::PodDeleted(pod) => match Self::pod_owner_key(pod) {
                Some(key) => {
                    self.scale_expectations
                        .observe_scale(&key, ScaleAction::Delete, &pod.metadata.name);
                    vec![key]
                }
                None => Vec::new(),
            },
            ClusterEvent::GameDeploymentApplied(deploy)
            | ClusterEvent::GameDeploymentDeleted(deploy) => vec![deploy.key()],
            ClusterEvent::HookRunApplied(run) | ClusterEvent::HookRunDeleted(run) => run
                .metadata
                .controller_ref()
                .filter(|r| r.kind == GameDeployment::GVK.kind)
                .map(|r| vec![format!("{}/{}", run.metadata.namespace, r.name)])
                .unwrap_or_default(),
        }
    }
}
