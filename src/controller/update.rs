use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::cluster::ObjectClient;
use crate::controller::core::WorkloadControl;
use crate::expectations::{ScaleAction, ScaleExpectations, UpdateExpectations};
use crate::hook::LifecycleHookControl;
use crate::inplace::{HotPatchControl, InPlaceControl, UpdateOptions};
use crate::metrics::{record_pod_operation, PodOperation};
use crate::resources::{
    ControllerRevision, GameDeployment, GameDeploymentStatus, IntOrString, Pod,
    UpdateStrategyType,
};
use crate::utils::min_delay;
use crate::{Error, Result};

pub const DEFAULT_MAX_UNAVAILABLE: &str = "20%";

/// How many of the pods waiting for an update may be updated now.
///
/// The last `partition` pods of the wait list stay on their revision. Picking a ready pod makes it
/// unavailable, picking stops once the unavailable budget of `maxUnavailable` plus the surge in use
/// is spent.
pub fn calculate_update_count(
    deploy: &GameDeployment,
    workload: &dyn WorkloadControl,
    wait_update_indexes: &[usize],
    pods: &[Pod],
    partition: i32,
) -> Result<usize> {
    let strategy = &deploy.spec.update_strategy;
    let total_replicas = deploy.spec.replicas.unwrap_or_default();
    let partition = partition.max(0) as usize;
    if wait_update_indexes.len() <= partition {
        return Ok(0);
    }
    let waiting = &wait_update_indexes[..wait_update_indexes.len() - partition];

    let mut round_up = true;
    if let Some(max_surge) = &strategy.max_surge {
        round_up = max_surge.scaled_value(total_replicas, true)? == 0;
    }
    let max_unavailable = strategy
        .max_unavailable
        .clone()
        .unwrap_or_else(|| IntOrString::from(DEFAULT_MAX_UNAVAILABLE))
        .scaled_value(total_replicas, round_up)?;
    let used_surge = pods.len() as i32 - total_replicas;

    let min_ready_seconds = deploy.spec.min_ready_seconds;
    let mut not_ready_count = pods
        .iter()
        .filter(|p| !workload.is_pod_update_ready(p, min_ready_seconds))
        .count() as i32;
    let mut update_count = 0;
    for &i in waiting {
        if workload.is_pod_update_ready(&pods[i], min_ready_seconds) {
            if not_ready_count >= max_unavailable + used_surge {
                break;
            }
            not_ready_count += 1;
        }
        update_count += 1;
    }
    Ok(update_count)
}

pub struct UpdateControl {
    client: Arc<dyn ObjectClient>,
    workload: Arc<dyn WorkloadControl>,
    hooks: Arc<LifecycleHookControl>,
    inplace: InPlaceControl,
    hot_patch: HotPatchControl,
    scale_expectations: Arc<ScaleExpectations>,
    update_expectations: Arc<UpdateExpectations>,
}

impl UpdateControl {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        workload: Arc<dyn WorkloadControl>,
        hooks: Arc<LifecycleHookControl>,
        scale_expectations: Arc<ScaleExpectations>,
        update_expectations: Arc<UpdateExpectations>,
    ) -> Self {
        Self {
            inplace: InPlaceControl::new(Arc::clone(&client)),
            hot_patch: HotPatchControl::new(Arc::clone(&client)),
            client,
            workload,
            hooks,
            scale_expectations,
            update_expectations,
        }
    }

    /// Move pods to `update_revision` as fast as the strategy allows. Returns when to look again.
    #[tracing::instrument(skip_all, fields(deploy = deploy.metadata.name, revision = update_revision.metadata.name))]
    pub async fn manage(
        &self,
        deploy: &GameDeployment,
        update_revision: &ControllerRevision,
        revisions: &[ControllerRevision],
        pods: &[Pod],
        partition: i32,
        status: &mut GameDeploymentStatus,
    ) -> Result<Option<Duration>> {
        if deploy.spec.update_strategy.paused {
            debug!("Updates paused");
            return Ok(None);
        }

        let opts = self.workload.update_options(deploy);
        let mut delay = None;
        let mut wait_update_indexes = Vec::new();
        for (i, pod) in pods.iter().enumerate() {
            if self.workload.is_pod_update_paused(pod) {
                continue;
            }
            let refreshed = self.inplace.refresh(pod, &opts).await;
            if let Some(e) = refreshed.refresh_err {
                return Err(e);
            }
            delay = min_delay(delay, refreshed.delay);

            if pod.revision() != Some(update_revision.metadata.name.as_str()) {
                wait_update_indexes.push(i);
            }

            if let Err(error) = self.hooks.update_post_inplace_hook(deploy, pod, status).await {
                warn!(pod = pod.metadata.name, %error, "Failed to refresh post-inplace hook");
            }
        }

        self.workload
            .sort_pods_to_update(pods, &mut wait_update_indexes);
        let count = calculate_update_count(
            deploy,
            self.workload.as_ref(),
            &wait_update_indexes,
            pods,
            partition,
        )?;
        wait_update_indexes.truncate(count);

        for i in wait_update_indexes {
            let pod = &pods[i];
            let start = Instant::now();
            let res = self
                .update_pod(deploy, pod, update_revision, revisions, &opts, status)
                .await;
            record_pod_operation(
                PodOperation::Update,
                &pod.metadata.namespace,
                &pod.metadata.name,
                res.is_ok(),
                start.elapsed(),
            );
            delay = min_delay(delay, res?);
        }
        Ok(delay)
    }

    async fn update_pod(
        &self,
        deploy: &GameDeployment,
        pod: &Pod,
        update_revision: &ControllerRevision,
        revisions: &[ControllerRevision],
        opts: &UpdateOptions,
        status: &mut GameDeploymentStatus,
    ) -> Result<Option<Duration>> {
        let key = deploy.key();
        let revision_name = update_revision.metadata.name.as_str();
        let old_revision = || {
            revisions
                .iter()
                .find(|r| Some(r.metadata.name.as_str()) == pod.revision())
                .ok_or_else(|| Error::NotInPlaceUpdatable(pod.metadata.name.clone()))
        };

        match deploy.spec.update_strategy.r#type {
            UpdateStrategyType::InPlaceUpdate => {
                let allowed = if deploy.spec.pre_inplace_update_strategy.hook.is_some() {
                    self.hooks
                        .check_inplace(deploy, pod, revision_name, status)
                        .await?
                } else {
                    self.hooks.check_delete(deploy, pod, status).await?
                };
                if !allowed {
                    debug!(pod = pod.metadata.name, "Waiting on hook before in-place update");
                    return Ok(None);
                }
                let old = old_revision()?;
                let res = self.inplace.update(pod, old, update_revision, opts).await;
                if let Some(e) = res.update_err {
                    return Err(e);
                }
                if !res.in_place_update {
                    return Err(Error::NotInPlaceUpdatable(pod.metadata.name.clone()));
                }
                self.update_expectations
                    .expect_updated(&key, revision_name, pod);
                let live = self
                    .client
                    .get_pod(&pod.metadata.namespace, &pod.metadata.name)
                    .await?;
                self.hooks
                    .create_post_inplace_hook(deploy, &live, status)
                    .await?;
                Ok(res.delay)
            }
            UpdateStrategyType::RollingUpdate => {
                if !self.hooks.check_delete(deploy, pod, status).await? {
                    debug!(pod = pod.metadata.name, "Waiting on pre-delete hook before recreating");
                    return Ok(None);
                }
                self.scale_expectations
                    .expect_scale(&key, ScaleAction::Delete, &pod.metadata.name);
                match self
                    .client
                    .delete_pod(&pod.metadata.namespace, &pod.metadata.name)
                    .await
                {
                    Ok(()) => {
                        info!(pod = pod.metadata.name, "Deleted pod for rolling update");
                        Ok(None)
                    }
                    Err(e) => {
                        self.scale_expectations
                            .observe_scale(&key, ScaleAction::Delete, &pod.metadata.name);
                        if e.is_not_found() {
                            Ok(None)
                        } else {
                            Err(e.into())
                        }
                    }
                }
            }
            UpdateStrategyType::HotPatchUpdate => {
                let old = old_revision()?;
                self.hot_patch.update(pod, old, update_revision).await?;
                self.update_expectations
                    .expect_updated(&key, revision_name, pod);
                Ok(None)
            }
            UpdateStrategyType::Unsupported => Err(Error::InvalidUpdateStrategy(
                deploy.spec.update_strategy.r#type.to_string(),
            )),
        }
    }
}
