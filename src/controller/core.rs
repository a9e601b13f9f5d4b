use std::cmp::Ordering;

use crate::controller::util::{active_pods_cmp, is_pod_available, new_controller_ref};
use crate::inplace::UpdateOptions;
use crate::resources::{
    EnvVar, GameDeployment, Metadata, Pod, PodReadinessGate, PodStatus, Time,
    UpdateStrategyType, CONTROLLER_REVISION_HASH_LABEL, INSTANCE_ID_LABEL, IN_PLACE_UPDATE_READY,
    POD_INDEX_ANNOTATION, POD_INDEX_ENV, POD_UPDATE_PAUSED_ANNOTATION,
};
use crate::{Error, Result};

/// A request for pods to be created by the scale control.
pub struct NewPods<'a> {
    pub current: &'a GameDeployment,
    pub updated: &'a GameDeployment,
    pub current_revision: &'a str,
    pub update_revision: &'a str,
    pub expected_creations: usize,
    // The first pods in the batch are created from the current revision.
    pub expected_current_creations: usize,
    pub instance_ids: &'a [String],
    pub indexes: &'a [i32],
}

/// Behavior that differs between kinds of workload.
pub trait WorkloadControl: Send + Sync {
    /// Whether the workload is not ready to be scaled yet.
    fn is_initializing(&self, deploy: &GameDeployment) -> bool;

    fn new_versioned_pods(&self, request: NewPods<'_>) -> Result<Vec<Pod>>;

    fn is_pod_update_ready(&self, pod: &Pod, min_ready_seconds: i32) -> bool;

    /// Stable sort of the indexes into `pods` waiting for an update, the first ones get updated
    /// first.
    fn sort_pods_to_update(&self, pods: &[Pod], wait_update_indexes: &mut [usize]);

    fn validate_update(&self, deploy: &GameDeployment) -> Result<()>;

    fn is_pod_update_paused(&self, pod: &Pod) -> bool;

    fn update_options(&self, deploy: &GameDeployment) -> UpdateOptions;
}

#[derive(Clone, Debug, Default)]
pub struct CommonControl;

impl CommonControl {
    fn new_pod(
        &self,
        deploy: &GameDeployment,
        revision: &str,
        instance_id: &str,
        index: Option<i32>,
    ) -> Pod {
        let template = &deploy.spec.template;
        let mut labels = template.metadata.labels.clone();
        labels.insert(CONTROLLER_REVISION_HASH_LABEL.to_owned(), revision.to_owned());
        labels.insert(INSTANCE_ID_LABEL.to_owned(), instance_id.to_owned());
        let mut annotations = template.metadata.annotations.clone();
        let mut spec = template.spec.clone();

        if let Some(index) = index {
            annotations.insert(POD_INDEX_ANNOTATION.to_owned(), index.to_string());
            for container in spec.containers.iter_mut() {
                container.env.retain(|e| e.name != POD_INDEX_ENV);
                container.env.push(EnvVar {
                    name: POD_INDEX_ENV.to_owned(),
                    value: Some(index.to_string()),
                    value_from: None,
                });
            }
        }

        if deploy.spec.update_strategy.r#type == UpdateStrategyType::InPlaceUpdate
            && !spec
                .readiness_gates
                .iter()
                .any(|g| g.condition_type == IN_PLACE_UPDATE_READY)
        {
            spec.readiness_gates.push(PodReadinessGate {
                condition_type: IN_PLACE_UPDATE_READY.to_owned(),
            });
        }

        Pod {
            metadata: Metadata {
                name: format!("{}-{}", deploy.metadata.name, instance_id),
                namespace: deploy.metadata.namespace.clone(),
                labels,
                annotations,
                finalizers: template.metadata.finalizers.clone(),
                owner_references: vec![new_controller_ref(
                    &deploy.metadata,
                    &GameDeployment::GVK,
                )],
                ..Default::default()
            },
            spec,
            status: PodStatus::default(),
        }
    }
}

impl WorkloadControl for CommonControl {
    fn is_initializing(&self, deploy: &GameDeployment) -> bool {
        deploy.metadata.deletion_timestamp.is_some()
    }

    fn new_versioned_pods(&self, request: NewPods<'_>) -> Result<Vec<Pod>> {
        if request.instance_ids.len() < request.expected_creations {
            return Err(Error::InvalidSpec(format!(
                "need {} instance ids, got {}",
                request.expected_creations,
                request.instance_ids.len()
            )));
        }
        let inject = request.updated.pod_index_injected();
        if inject && request.indexes.len() < request.expected_creations {
            return Err(Error::InvalidPodIndexRange(format!(
                "not enough free pod indexes for {} new pods",
                request.expected_creations
            )));
        }
        let pods = (0..request.expected_creations)
            .map(|i| {
                let (deploy, revision) = if i < request.expected_current_creations {
                    (request.current, request.current_revision)
                } else {
                    (request.updated, request.update_revision)
                };
                let index = if inject {
                    request.indexes.get(i).copied()
                } else {
                    None
                };
                self.new_pod(deploy, revision, &request.instance_ids[i], index)
            })
            .collect();
        Ok(pods)
    }

    fn is_pod_update_ready(&self, pod: &Pod, min_ready_seconds: i32) -> bool {
        is_pod_available(pod, min_ready_seconds, Time::now())
    }

    fn sort_pods_to_update(&self, pods: &[Pod], wait_update_indexes: &mut [usize]) {
        wait_update_indexes.sort_by(|a, b| match active_pods_cmp(&pods[*a], &pods[*b]) {
            Ordering::Equal => a.cmp(b),
            o => o,
        });
    }

    fn validate_update(&self, deploy: &GameDeployment) -> Result<()> {
        let strategy = &deploy.spec.update_strategy;
        let replicas = deploy.spec.replicas.unwrap_or_default();
        if let Some(partition) = strategy.partition {
            if partition < 0 {
                return Err(Error::InvalidSpec(format!(
                    "partition {} must not be negative",
                    partition
                )));
            }
        }
        if let Some(max_unavailable) = &strategy.max_unavailable {
            max_unavailable.scaled_value(replicas, true)?;
        }
        if let Some(max_surge) = &strategy.max_surge {
            max_surge.scaled_value(replicas, true)?;
        }
        for step in deploy.canary_steps().unwrap_or_default() {
            if step.partition.map_or(false, |p| p < 0) {
                return Err(Error::InvalidSpec(
                    "canary step partition must not be negative".to_owned(),
                ));
            }
        }
        Ok(())
    }

    fn is_pod_update_paused(&self, pod: &Pod) -> bool {
        pod.metadata
            .annotations
            .get(POD_UPDATE_PAUSED_ANNOTATION)
            .map_or(false, |v| v == "true")
    }

    fn update_options(&self, deploy: &GameDeployment) -> UpdateOptions {
        UpdateOptions {
            grace_period_seconds: deploy
                .spec
                .update_strategy
                .in_place_update_strategy
                .as_ref()
                .map_or(0, |s| s.grace_period_seconds),
        }
    }
}
