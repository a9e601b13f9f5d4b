use std::{cmp::Ordering, time::Duration};

use crate::cluster::ObjectStore;
use crate::resources::{
    ConditionStatus, GameDeployment, GameDeploymentCondition, GameDeploymentConditionType,
    GameDeploymentStatus, GroupVersionKind, Metadata, OwnerReference, Pod, PodPhase, Time,
    DELETION_COST_SORT_METHOD_ANNOTATION, NODE_DELETION_COST_ANNOTATION,
    POD_DELETION_COST_ANNOTATION, POD_READY,
};

pub fn new_controller_ref(owner: &Metadata, gvk: &GroupVersionKind) -> OwnerReference {
    OwnerReference {
        api_version: gvk.api_version(),
        kind: gvk.kind.to_owned(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        block_owner_deletion: true,
        controller: true,
    }
}

pub fn is_controlled_by(meta: &Metadata, owner: &Metadata) -> bool {
    meta.controller_ref().map_or(false, |or| or.uid == owner.uid)
}

pub fn is_pod_active(pod: &Pod) -> bool {
    pod.status.phase != PodPhase::Succeeded
        && pod.status.phase != PodPhase::Failed
        && pod.metadata.deletion_timestamp.is_none()
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.condition(POD_READY)
        .map_or(false, |c| c.status == ConditionStatus::True)
}

pub fn is_running_and_ready(pod: &Pod) -> bool {
    pod.status.phase == PodPhase::Running && is_pod_ready(pod)
}

pub fn is_pod_available(pod: &Pod, min_ready_seconds: i32, now: Time) -> bool {
    if !is_pod_ready(pod) {
        return false;
    }
    if min_ready_seconds <= 0 {
        return true;
    }
    pod.condition(POD_READY)
        .and_then(|c| c.last_transition_time)
        .map_or(false, |ltt| {
            ltt.0 + Duration::from_secs(min_ready_seconds as u64) < now.0
        })
}

fn ready_time(pod: &Pod) -> Option<Time> {
    if is_pod_ready(pod) {
        pod.condition(POD_READY).and_then(|c| c.last_transition_time)
    } else {
        None
    }
}

fn max_container_restarts(pod: &Pod) -> i32 {
    pod.status
        .container_statuses
        .iter()
        .map(|c| c.restart_count)
        .max()
        .unwrap_or_default()
}

fn phase_rank(phase: PodPhase) -> u8 {
    match phase {
        PodPhase::Pending => 0,
        PodPhase::Unknown => 1,
        PodPhase::Running => 2,
        _ => 3,
    }
}

// ActivePods orders pods so that the ones cheapest to lose come first.
pub fn active_pods_cmp(a: &Pod, b: &Pod) -> Ordering {
    // 1. Unassigned < assigned
    let a_assigned = a.spec.node_name.as_deref().map_or(false, |n| !n.is_empty());
    let b_assigned = b.spec.node_name.as_deref().map_or(false, |n| !n.is_empty());
    if a_assigned != b_assigned {
        return a_assigned.cmp(&b_assigned);
    }
    // 2. PodPending < PodUnknown < PodRunning
    let (ra, rb) = (phase_rank(a.status.phase), phase_rank(b.status.phase));
    if ra != rb {
        return ra.cmp(&rb);
    }
    // 3. Not ready < ready
    let (a_ready, b_ready) = (is_pod_ready(a), is_pod_ready(b));
    if a_ready != b_ready {
        return a_ready.cmp(&b_ready);
    }
    // 4. Been ready for less time < more time
    if a_ready && b_ready {
        let (ta, tb) = (ready_time(a), ready_time(b));
        if ta != tb {
            return match (ta, tb) {
                (None, _) => Ordering::Less,
                (_, None) => Ordering::Greater,
                (Some(ta), Some(tb)) => tb.cmp(&ta),
            };
        }
    }
    // 5. More restarts < fewer restarts
    let (ca, cb) = (max_container_restarts(a), max_container_restarts(b));
    if ca != cb {
        return cb.cmp(&ca);
    }
    // 6. Newer < older
    match (a.metadata.creation_timestamp, b.metadata.creation_timestamp) {
        (Some(ta), Some(tb)) => tb.cmp(&ta),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletionCostSortMethod {
    #[default]
    Ascend,
    Descend,
}

impl DeletionCostSortMethod {
    pub fn for_deployment(deploy: &GameDeployment) -> Self {
        match deploy
            .metadata
            .annotations
            .get(DELETION_COST_SORT_METHOD_ANNOTATION)
            .map(String::as_str)
        {
            Some("Descend") => DeletionCostSortMethod::Descend,
            _ => DeletionCostSortMethod::Ascend,
        }
    }
}

// Unparseable or missing costs count as the lowest possible cost.
fn cost(annotations: &std::collections::BTreeMap<String, String>, key: &str) -> i64 {
    annotations
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(i64::MIN)
}

/// Stable sort of deletion candidates by (node deletion cost, pod deletion cost).
pub fn sort_by_deletion_cost(
    pods: &mut [&Pod],
    store: &dyn ObjectStore,
    method: DeletionCostSortMethod,
) {
    let mut keyed = pods
        .iter()
        .map(|pod| {
            let node_cost = pod
                .spec
                .node_name
                .as_deref()
                .and_then(|n| store.node(n))
                .map_or(i64::MIN, |n| {
                    cost(&n.metadata.annotations, NODE_DELETION_COST_ANNOTATION)
                });
            let pod_cost = cost(&pod.metadata.annotations, POD_DELETION_COST_ANNOTATION);
            ((node_cost, pod_cost), *pod)
        })
        .collect::<Vec<_>>();
    match method {
        DeletionCostSortMethod::Ascend => keyed.sort_by(|a, b| a.0.cmp(&b.0)),
        DeletionCostSortMethod::Descend => keyed.sort_by(|a, b| b.0.cmp(&a.0)),
    }
    for (slot, (_, pod)) in pods.iter_mut().zip(keyed) {
        *slot = pod;
    }
}

pub fn get_condition(
    status: &GameDeploymentStatus,
    cond_type: GameDeploymentConditionType,
) -> Option<&GameDeploymentCondition> {
    status.conditions.iter().find(|c| c.r#type == cond_type)
}

pub fn set_condition(status: &mut GameDeploymentStatus, condition: GameDeploymentCondition) {
    if let Some(cc) = get_condition(status, condition.r#type) {
        if cc.status == condition.status
            && cc.reason == condition.reason
            && cc.message == condition.message
        {
            return;
        }
    }
    remove_condition(status, condition.r#type);
    status.conditions.push(condition);
}

pub fn remove_condition(status: &mut GameDeploymentStatus, cond_type: GameDeploymentConditionType) {
    status.conditions.retain(|c| c.r#type != cond_type)
}

pub fn new_condition(
    cond_type: GameDeploymentConditionType,
    status: ConditionStatus,
    reason: String,
    message: String,
) -> GameDeploymentCondition {
    GameDeploymentCondition {
        r#type: cond_type,
        status,
        last_transition_time: Some(Time::now()),
        reason,
        message,
    }
}
