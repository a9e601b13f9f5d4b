use std::{collections::BTreeSet, sync::Arc, time::Instant};

use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cluster::{ObjectClient, ObjectStore};
use crate::controller::core::{NewPods, WorkloadControl};
use crate::controller::util::{active_pods_cmp, sort_by_deletion_cost, DeletionCostSortMethod};
use crate::expectations::{ScaleAction, ScaleExpectations};
use crate::hook::LifecycleHookControl;
use crate::metrics::{record_pod_operation, PodOperation};
use crate::resources::{GameDeployment, GameDeploymentStatus, Pod, POD_INDEX_RANGE_ANNOTATION};
use crate::utils::random_instance_id;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodIndexRange {
    pub pod_start_index: i32,
    pub pod_end_index: i32,
}

/// The validated pod index range of `deploy`, `None` when index injection is off.
pub fn pod_index_range(deploy: &GameDeployment, replicas: i32) -> Result<Option<PodIndexRange>> {
    if !deploy.pod_index_injected() {
        return Ok(None);
    }
    let raw = deploy
        .metadata
        .annotations
        .get(POD_INDEX_RANGE_ANNOTATION)
        .ok_or_else(|| Error::InvalidPodIndexRange("pod index range annotation missing".to_owned()))?;
    let range: PodIndexRange = serde_json::from_str(raw)
        .map_err(|e| Error::InvalidPodIndexRange(format!("{}: {}", raw, e)))?;
    if range.pod_start_index < 0 || range.pod_end_index < 0 {
        return Err(Error::InvalidPodIndexRange(format!(
            "{}: indexes must not be negative",
            raw
        )));
    }
    if range.pod_start_index >= range.pod_end_index {
        return Err(Error::InvalidPodIndexRange(format!(
            "{}: start must be below end",
            raw
        )));
    }
    if range.pod_end_index - range.pod_start_index < replicas {
        return Err(Error::InvalidPodIndexRange(format!(
            "{}: range holds fewer than {} replicas",
            raw, replicas
        )));
    }
    Ok(Some(range))
}

/// How many pods to remove overall (negative to add) and how many of them should come off the
/// current revision.
pub fn calculate_diffs(
    deploy: &GameDeployment,
    rev_consistent: bool,
    total_pods: i32,
    not_updated_pods: i32,
    partition: i32,
) -> Result<(i32, i32)> {
    let replicas = deploy
        .spec
        .replicas
        .ok_or_else(|| Error::NilReplicas(deploy.key()))?;

    let mut max_surge = 0;
    let mut current_rev_diff = 0;
    if !rev_consistent {
        if partition > 0 {
            current_rev_diff = not_updated_pods - partition.min(replicas);
        }
        if let Some(surge) = &deploy.spec.update_strategy.max_surge {
            let surge = surge.scaled_value(replicas, true)?;
            if partition > 0 {
                if current_rev_diff > 0 {
                    max_surge = surge.min(current_rev_diff);
                }
            } else if not_updated_pods > 0 {
                max_surge = surge.min(not_updated_pods);
            }
        }
    }

    let total_diff = total_pods - replicas - max_surge;
    if total_diff > 0 && partition == 0 {
        current_rev_diff = not_updated_pods.min(total_diff);
    }
    Ok((total_diff, current_rev_diff))
}

fn sorted_for_deletion<'a>(
    mut pods: Vec<&'a Pod>,
    store: &dyn ObjectStore,
    method: DeletionCostSortMethod,
) -> Vec<&'a Pod> {
    pods.sort_by(|a, b| active_pods_cmp(a, b));
    sort_by_deletion_cost(&mut pods, store, method);
    pods
}

/// Pick `total_diff` pods to delete, `current_rev_diff` of them from the pods not yet updated.
pub fn choose_pods_to_delete<'a>(
    total_diff: i32,
    current_rev_diff: i32,
    not_updated: Vec<&'a Pod>,
    updated: Vec<&'a Pod>,
    store: &dyn ObjectStore,
    method: DeletionCostSortMethod,
) -> Vec<&'a Pod> {
    let choose = |pods: Vec<&'a Pod>, count: i32| -> Vec<&'a Pod> {
        if count <= 0 {
            return Vec::new();
        }
        let mut sorted = sorted_for_deletion(pods, store, method);
        sorted.truncate(count as usize);
        sorted
    };

    if current_rev_diff >= total_diff {
        choose(not_updated, total_diff)
    } else if current_rev_diff > 0 {
        let mut victims = choose(not_updated, current_rev_diff);
        victims.extend(choose(updated, total_diff - current_rev_diff));
        victims
    } else {
        let all = not_updated.into_iter().chain(updated).collect();
        choose(all, total_diff)
    }
}

/// `count` instance ids not used by any of `pods`.
pub fn new_instance_ids(pods: &[Pod], count: usize) -> Vec<String> {
    let mut used = pods
        .iter()
        .filter_map(|p| p.instance_id().map(str::to_owned))
        .collect::<BTreeSet<_>>();
    let mut ids = Vec::with_capacity(count);
    while ids.len() < count {
        let id = random_instance_id();
        if used.insert(id.clone()) {
            ids.push(id);
        }
    }
    ids
}

/// The lowest `count` indexes of `range` not held by any of `pods`.
pub fn free_pod_indexes(pods: &[Pod], range: PodIndexRange, count: usize) -> Result<Vec<i32>> {
    let used = pods.iter().filter_map(Pod::pod_index).collect::<BTreeSet<_>>();
    let free = (range.pod_start_index..range.pod_end_index)
        .filter(|i| !used.contains(i))
        .take(count)
        .collect::<Vec<_>>();
    if free.len() < count {
        return Err(Error::InvalidPodIndexRange(format!(
            "{} free indexes in [{}, {}) for {} pods",
            free.len(),
            range.pod_start_index,
            range.pod_end_index,
            count
        )));
    }
    Ok(free)
}

/// Inputs of a scale pass.
pub struct ScaleRequest<'a> {
    pub deploy: &'a GameDeployment,
    pub current_deploy: &'a GameDeployment,
    pub update_deploy: &'a GameDeployment,
    pub current_revision: &'a str,
    pub update_revision: &'a str,
    /// Active pods owned by the deployment.
    pub pods: &'a [Pod],
    /// Every pod owned by the deployment, including terminating ones.
    pub all_pods: &'a [Pod],
    pub partition: i32,
}

pub struct ScaleControl {
    client: Arc<dyn ObjectClient>,
    store: Arc<dyn ObjectStore>,
    workload: Arc<dyn WorkloadControl>,
    hooks: Arc<LifecycleHookControl>,
    expectations: Arc<ScaleExpectations>,
}

impl ScaleControl {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        store: Arc<dyn ObjectStore>,
        workload: Arc<dyn WorkloadControl>,
        hooks: Arc<LifecycleHookControl>,
        expectations: Arc<ScaleExpectations>,
    ) -> Self {
        Self {
            client,
            store,
            workload,
            hooks,
            expectations,
        }
    }

    /// Create or delete pods so the deployment has the desired number of replicas. Returns whether
    /// any scaling was started.
    #[tracing::instrument(skip_all, fields(deploy = req.deploy.metadata.name))]
    pub async fn manage(
        &self,
        req: ScaleRequest<'_>,
        status: &mut GameDeploymentStatus,
    ) -> Result<bool> {
        let deploy = req.deploy;
        let replicas = deploy
            .spec
            .replicas
            .ok_or_else(|| Error::NilReplicas(deploy.key()))?;
        let index_range = pod_index_range(deploy, replicas)?;

        if self.workload.is_initializing(deploy) {
            debug!("Deployment is initializing, not scaling");
            return Ok(false);
        }

        let named = &deploy.spec.scale_strategy.pods_to_delete;
        if !named.is_empty() {
            let victims = req
                .pods
                .iter()
                .filter(|p| named.contains(&p.metadata.name))
                .collect::<Vec<_>>();
            if !victims.is_empty() {
                info!(count = victims.len(), "Deleting pods named in podsToDelete");
                self.delete_pods(deploy, victims, status).await?;
                return Ok(true);
            }
        }

        let (updated, not_updated): (Vec<&Pod>, Vec<&Pod>) = req
            .pods
            .iter()
            .partition(|p| p.revision() == Some(req.update_revision));
        let (total_diff, current_rev_diff) = calculate_diffs(
            deploy,
            req.current_revision == req.update_revision,
            req.pods.len() as i32,
            not_updated.len() as i32,
            req.partition,
        )?;

        if total_diff < 0 {
            let expected_creations = (-total_diff) as usize;
            let expected_current_creations = if current_rev_diff < 0 {
                ((-current_rev_diff) as usize).min(expected_creations)
            } else {
                0
            };
            let instance_ids = new_instance_ids(req.all_pods, expected_creations);
            let indexes = match index_range {
                Some(range) => free_pod_indexes(req.all_pods, range, expected_creations)?,
                None => Vec::new(),
            };
            let new_pods = self.workload.new_versioned_pods(NewPods {
                current: req.current_deploy,
                updated: req.update_deploy,
                current_revision: req.current_revision,
                update_revision: req.update_revision,
                expected_creations,
                expected_current_creations,
                instance_ids: &instance_ids,
                indexes: &indexes,
            })?;
            info!(
                count = expected_creations,
                current = expected_current_creations,
                "Scaling out"
            );
            self.create_pods(deploy, new_pods).await?;
            return Ok(true);
        }

        if total_diff > 0 {
            let victims = choose_pods_to_delete(
                total_diff,
                current_rev_diff,
                not_updated,
                updated,
                self.store.as_ref(),
                DeletionCostSortMethod::for_deployment(deploy),
            );
            info!(count = victims.len(), current_rev_diff, "Scaling in");
            return self.delete_pods(deploy, victims, status).await;
        }

        Ok(false)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let start = Instant::now();
        let res = self.client.create_pod(pod).await;
        record_pod_operation(
            PodOperation::Create,
            &pod.metadata.namespace,
            &pod.metadata.name,
            res.is_ok(),
            start.elapsed(),
        );
        Ok(res?)
    }

    /// Create `pods` in batches of 1, 2, 4 and so on, stopping at the first failed batch. Returns
    /// how many pods were created.
    pub async fn create_pods(&self, deploy: &GameDeployment, pods: Vec<Pod>) -> Result<usize> {
        let key = deploy.key();
        for pod in &pods {
            self.expectations
                .expect_scale(&key, ScaleAction::Create, &pod.metadata.name);
        }

        let mut created = 0;
        let mut pos = 0;
        let mut batch = pods.len().min(1);
        let mut first_err = None;
        while batch > 0 {
            let chunk = &pods[pos..pos + batch];
            let results = join_all(chunk.iter().map(|p| self.create_pod(p))).await;
            for (pod, res) in chunk.iter().zip(results) {
                match res {
                    Ok(_) => created += 1,
                    Err(e) => {
                        warn!(pod = pod.metadata.name, error = %e, "Failed to create pod");
                        self.expectations
                            .observe_scale(&key, ScaleAction::Create, &pod.metadata.name);
                        first_err.get_or_insert(e);
                    }
                }
            }
            pos += batch;
            if first_err.is_some() {
                break;
            }
            batch = (batch * 2).min(pods.len() - pos);
        }

        // pods never attempted will not show up either
        for pod in &pods[pos..] {
            self.expectations
                .observe_scale(&key, ScaleAction::Create, &pod.metadata.name);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    /// Delete `pods` once their pre-delete hooks allow it. Returns whether any pod was deleted.
    pub async fn delete_pods(
        &self,
        deploy: &GameDeployment,
        pods: Vec<&Pod>,
        status: &mut GameDeploymentStatus,
    ) -> Result<bool> {
        let key = deploy.key();
        let mut deleted = false;
        for pod in pods {
            if !self.hooks.check_delete(deploy, pod, status).await? {
                debug!(pod = pod.metadata.name, "Pre-delete hook not completed, skipping");
                continue;
            }
            self.expectations
                .expect_scale(&key, ScaleAction::Delete, &pod.metadata.name);
            let start = Instant::now();
            let res = self
                .client
                .delete_pod(&pod.metadata.namespace, &pod.metadata.name)
                .await;
            record_pod_operation(
                PodOperation::Delete,
                &pod.metadata.namespace,
                &pod.metadata.name,
                res.is_ok(),
                start.elapsed(),
            );
            match res {
                Ok(()) => {
                    info!(pod = pod.metadata.name, "Deleted pod");
                    deleted = true;
                }
                Err(e) => {
                    self.expectations
                        .observe_scale(&key, ScaleAction::Delete, &pod.metadata.name);
                    if !e.is_not_found() {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(deleted)
    }
}
