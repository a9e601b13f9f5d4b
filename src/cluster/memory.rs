use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use imbl::OrdMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cluster::{ClientError, ClusterEvent, ObjectClient, ObjectStore};
use crate::resources::{
    ConditionStatus, ControllerRevision, GameDeployment, HookPhase, HookRun, HookTemplate, Meta,
    Node, Pod, PodCondition, PodPhase, Time, POD_READY,
};
use crate::utils::{merge_patch, new_uid, random_instance_id};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    CreatePod,
    PatchPod,
    PatchPodStatus,
    DeletePod,
    CreateRevision,
    UpdateRevision,
    DeleteRevision,
    CreateHookRun,
    PatchHookRun,
    DeleteHookRun,
    PatchGameDeployment,
    PatchGameDeploymentStatus,
}

/// A mutation that was applied to the cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub namespace: String,
    pub name: String,
    pub body: Value,
}

#[derive(Clone, Debug)]
struct Failure {
    kind: ActionKind,
    skip: usize,
    remaining: usize,
}

#[derive(Clone, Debug, Default)]
struct ClusterState {
    game_deployments: OrdMap<String, GameDeployment>,
    pods: OrdMap<String, Pod>,
    nodes: OrdMap<String, Node>,
    revisions: OrdMap<String, ControllerRevision>,
    hook_runs: OrdMap<String, HookRun>,
    hook_templates: OrdMap<String, HookTemplate>,
    resource_version: u64,
    actions: Vec<Action>,
    failures: Vec<Failure>,
}

impl ClusterState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    // Consume an injected failure for this kind of action, if one is due.
    fn check_failure(&mut self, kind: ActionKind, name: &str) -> Result<(), ClientError> {
        for failure in self.failures.iter_mut().filter(|f| f.kind == kind) {
            if failure.skip > 0 {
                failure.skip -= 1;
                return Ok(());
            }
            if failure.remaining > 0 {
                failure.remaining -= 1;
                return Err(ClientError::Failed {
                    kind: kind_name(kind),
                    name: name.to_owned(),
                    message: "injected failure".to_owned(),
                });
            }
        }
        Ok(())
    }

    fn record(&mut self, kind: ActionKind, namespace: &str, name: &str, body: Value) {
        self.actions.push(Action {
            kind,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            body,
        })
    }
}

fn kind_name(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::CreatePod
        | ActionKind::PatchPod
        | ActionKind::PatchPodStatus
        | ActionKind::DeletePod => "Pod",
        ActionKind::CreateRevision | ActionKind::UpdateRevision | ActionKind::DeleteRevision => {
            "ControllerRevision"
        }
        ActionKind::CreateHookRun | ActionKind::PatchHookRun | ActionKind::DeleteHookRun => {
            "HookRun"
        }
        ActionKind::PatchGameDeployment | ActionKind::PatchGameDeploymentStatus => {
            "GameDeployment"
        }
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn in_namespace<'a, T: Meta + Clone + 'a>(
    objects: impl Iterator<Item = &'a T>,
    namespace: &str,
) -> Vec<T> {
    objects
        .filter(|o| namespace.is_empty() || o.metadata().namespace == namespace)
        .cloned()
        .collect()
}

fn patched<T: Serialize + DeserializeOwned>(object: &T, patch: &Value) -> Result<T, ClientError> {
    let mut value = serde_json::to_value(object)?;
    merge_patch(&mut value, patch);
    Ok(serde_json::from_value(value)?)
}

/// An in-memory cluster acting as both the informer cache and the API server.
///
/// Every successful mutation is recorded as an [`Action`] and published as a [`ClusterEvent`] to
/// the subscriber, if there is one.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
    events: Mutex<Option<mpsc::UnboundedSender<ClusterEvent>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ClusterEvent) {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = events.as_ref() {
            // a dropped receiver just means nobody is watching anymore
            let _ = tx.send(event);
        }
    }

    /// Watch all changes made from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    /// Fail `count` actions of the given kind after letting `skip` of them succeed.
    pub fn fail(&self, kind: ActionKind, skip: usize, count: usize) {
        self.lock().failures.push(Failure {
            kind,
            skip,
            remaining: count,
        });
    }

    pub fn actions(&self) -> Vec<Action> {
        self.lock().actions.clone()
    }

    pub fn actions_of(&self, kind: ActionKind) -> Vec<Action> {
        self.lock()
            .actions
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear_actions(&self) {
        self.lock().actions.clear();
    }

    /// Create or update a game deployment, bumping its generation when the spec changes.
    pub fn apply_game_deployment(&self, mut deploy: GameDeployment) -> GameDeployment {
        let mut state = self.lock();
        let k = key(&deploy.metadata.namespace, &deploy.metadata.name);
        match state.game_deployments.get(&k) {
            Some(existing) => {
                deploy.metadata.uid = existing.metadata.uid.clone();
                deploy.metadata.creation_timestamp = existing.metadata.creation_timestamp;
                deploy.metadata.generation = if existing.spec != deploy.spec {
                    existing.metadata.generation + 1
                } else {
                    existing.metadata.generation
                };
            }
            None => {
                if deploy.metadata.uid.is_empty() {
                    deploy.metadata.uid = new_uid();
                }
                deploy.metadata.creation_timestamp.get_or_insert_with(Time::now);
                deploy.metadata.generation = deploy.metadata.generation.max(1);
            }
        }
        deploy.metadata.resource_version = state.next_resource_version();
        state.game_deployments.insert(k, deploy.clone());
        drop(state);
        self.emit(ClusterEvent::GameDeploymentApplied(deploy.clone()));
        deploy
    }

    pub fn remove_game_deployment(&self, namespace: &str, name: &str) {
        let removed = self.lock().game_deployments.remove(&key(namespace, name));
        if let Some(deploy) = removed {
            self.emit(ClusterEvent::GameDeploymentDeleted(deploy));
        }
    }

    /// Insert a pod directly, as if another actor had created it.
    pub fn insert_pod(&self, mut pod: Pod) -> Pod {
        let mut state = self.lock();
        if pod.metadata.uid.is_empty() {
            pod.metadata.uid = new_uid();
        }
        pod.metadata.creation_timestamp.get_or_insert_with(Time::now);
        pod.metadata.resource_version = state.next_resource_version();
        state.pods.insert(
            key(&pod.metadata.namespace, &pod.metadata.name),
            pod.clone(),
        );
        drop(state);
        self.emit(ClusterEvent::PodApplied(pod.clone()));
        pod
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock().pods.get(&key(namespace, name)).cloned()
    }

    /// Mark a pod as running and ready (or not), like the kubelet would.
    pub fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) {
        let mut state = self.lock();
        let rv = state.next_resource_version();
        let Some(pod) = state.pods.get_mut(&key(namespace, name)) else {
            return;
        };
        pod.status.phase = PodPhase::Running;
        let status = if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        pod.status.conditions.retain(|c| c.r#type != POD_READY);
        pod.status.conditions.push(PodCondition {
            r#type: POD_READY.to_owned(),
            status,
            last_probe_time: None,
            last_transition_time: Some(Time::now()),
            reason: None,
            message: None,
        });
        pod.metadata.resource_version = rv;
        let pod = pod.clone();
        drop(state);
        self.emit(ClusterEvent::PodApplied(pod));
    }

    pub fn insert_node(&self, node: Node) {
        self.lock().nodes.insert(node.metadata.name.clone(), node);
    }

    pub fn insert_revision(&self, revision: ControllerRevision) {
        self.lock().revisions.insert(
            key(&revision.metadata.namespace, &revision.metadata.name),
            revision,
        );
    }

    pub fn insert_hook_template(&self, template: HookTemplate) {
        self.lock().hook_templates.insert(
            key(&template.metadata.namespace, &template.metadata.name),
            template,
        );
    }

    pub fn insert_hook_run(&self, hook_run: HookRun) {
        self.lock().hook_runs.insert(
            key(&hook_run.metadata.namespace, &hook_run.metadata.name),
            hook_run,
        );
    }

    pub fn hook_run(&self, namespace: &str, name: &str) -> Option<HookRun> {
        self.lock().hook_runs.get(&key(namespace, name)).cloned()
    }

    /// Report a hook run phase, like the hook run controller would.
    pub fn set_hook_run_phase(&self, namespace: &str, name: &str, phase: HookPhase) {
        let mut state = self.lock();
        let Some(run) = state.hook_runs.get_mut(&key(namespace, name)) else {
            return;
        };
        run.status.phase = phase;
        let run = run.clone();
        drop(state);
        self.emit(ClusterEvent::HookRunApplied(run));
    }
}

impl ObjectStore for MemoryCluster {
    fn game_deployment(&self, namespace: &str, name: &str) -> Option<GameDeployment> {
        self.lock()
            .game_deployments
            .get(&key(namespace, name))
            .cloned()
    }

    fn game_deployments(&self, namespace: &str) -> Vec<GameDeployment> {
        in_namespace(self.lock().game_deployments.values(), namespace)
    }

    fn pods(&self, namespace: &str) -> Vec<Pod> {
        in_namespace(self.lock().pods.values(), namespace)
    }

    fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    fn controller_revisions(&self, namespace: &str) -> Vec<ControllerRevision> {
        in_namespace(self.lock().revisions.values(), namespace)
    }

    fn hook_runs(&self, namespace: &str) -> Vec<HookRun> {
        in_namespace(self.lock().hook_runs.values(), namespace)
    }

    fn hook_template(&self, namespace: &str, name: &str) -> Option<HookTemplate> {
        self.lock().hook_templates.get(&key(namespace, name)).cloned()
    }
}

#[async_trait]
impl ObjectClient for MemoryCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClientError> {
        self.pod(namespace, name).ok_or_else(|| ClientError::NotFound {
            kind: "Pod",
            name: name.to_owned(),
        })
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClientError> {
        let mut pod = pod.clone();
        if pod.metadata.name.is_empty() {
            pod.metadata.name = format!("{}{}", pod.metadata.generate_name, random_instance_id());
        }
        let mut state = self.lock();
        state.check_failure(ActionKind::CreatePod, &pod.metadata.name)?;
        let k = key(&pod.metadata.namespace, &pod.metadata.name);
        if state.pods.contains_key(&k) {
            return Err(ClientError::AlreadyExists {
                kind: "Pod",
                name: pod.metadata.name,
            });
        }
        pod.metadata.uid = new_uid();
        pod.metadata.creation_timestamp = Some(Time::now());
        pod.metadata.resource_version = state.next_resource_version();
        debug!(name = pod.metadata.name, "Creating pod");
        state.pods.insert(k, pod.clone());
        state.record(
            ActionKind::CreatePod,
            &pod.metadata.namespace,
            &pod.metadata.name,
            serde_json::to_value(&pod)?,
        );
        drop(state);
        self.emit(ClusterEvent::PodApplied(pod.clone()));
        Ok(pod)
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Pod, ClientError> {
        self.patch_pod_inner(ActionKind::PatchPod, namespace, name, patch)
    }

    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Pod, ClientError> {
        self.patch_pod_inner(ActionKind::PatchPodStatus, namespace, name, patch)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.check_failure(ActionKind::DeletePod, name)?;
        let pod = state
            .pods
            .remove(&key(namespace, name))
            .ok_or_else(|| ClientError::NotFound {
                kind: "Pod",
                name: name.to_owned(),
            })?;
        state.record(ActionKind::DeletePod, namespace, name, Value::Null);
        drop(state);
        self.emit(ClusterEvent::PodDeleted(pod));
        Ok(())
    }

    async fn get_controller_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ControllerRevision, ClientError> {
        self.lock()
            .revisions
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ClientError::NotFound {
                kind: "ControllerRevision",
                name: name.to_owned(),
            })
    }

    async fn create_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, ClientError> {
        let mut revision = revision.clone();
        let mut state = self.lock();
        state.check_failure(ActionKind::CreateRevision, &revision.metadata.name)?;
        let k = key(&revision.metadata.namespace, &revision.metadata.name);
        if state.revisions.contains_key(&k) {
            return Err(ClientError::AlreadyExists {
                kind: "ControllerRevision",
                name: revision.metadata.name,
            });
        }
        revision.metadata.uid = new_uid();
        revision.metadata.creation_timestamp = Some(Time::now());
        revision.metadata.resource_version = state.next_resource_version();
        state.revisions.insert(k, revision.clone());
        state.record(
            ActionKind::CreateRevision,
            &revision.metadata.namespace,
            &revision.metadata.name,
            serde_json::to_value(&revision)?,
        );
        Ok(revision)
    }

    async fn update_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, ClientError> {
        let mut revision = revision.clone();
        let mut state = self.lock();
        state.check_failure(ActionKind::UpdateRevision, &revision.metadata.name)?;
        let k = key(&revision.metadata.namespace, &revision.metadata.name);
        if !state.revisions.contains_key(&k) {
            return Err(ClientError::NotFound {
                kind: "ControllerRevision",
                name: revision.metadata.name,
            });
        }
        revision.metadata.resource_version = state.next_resource_version();
        state.revisions.insert(k, revision.clone());
        state.record(
            ActionKind::UpdateRevision,
            &revision.metadata.namespace,
            &revision.metadata.name,
            serde_json::to_value(&revision)?,
        );
        Ok(revision)
    }

    async fn delete_controller_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.check_failure(ActionKind::DeleteRevision, name)?;
        state
            .revisions
            .remove(&key(namespace, name))
            .ok_or_else(|| ClientError::NotFound {
                kind: "ControllerRevision",
                name: name.to_owned(),
            })?;
        state.record(ActionKind::DeleteRevision, namespace, name, Value::Null);
        Ok(())
    }

    async fn create_hook_run(&self, hook_run: &HookRun) -> Result<HookRun, ClientError> {
        let mut hook_run = hook_run.clone();
        let mut state = self.lock();
        state.check_failure(ActionKind::CreateHookRun, &hook_run.metadata.name)?;
        let k = key(&hook_run.metadata.namespace, &hook_run.metadata.name);
        if state.hook_runs.contains_key(&k) {
            return Err(ClientError::AlreadyExists {
                kind: "HookRun",
                name: hook_run.metadata.name,
            });
        }
        hook_run.metadata.uid = new_uid();
        hook_run.metadata.creation_timestamp = Some(Time::now());
        hook_run.metadata.resource_version = state.next_resource_version();
        state.hook_runs.insert(k, hook_run.clone());
        state.record(
            ActionKind::CreateHookRun,
            &hook_run.metadata.namespace,
            &hook_run.metadata.name,
            serde_json::to_value(&hook_run)?,
        );
        drop(state);
        self.emit(ClusterEvent::HookRunApplied(hook_run.clone()));
        Ok(hook_run)
    }

    async fn patch_hook_run(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<HookRun, ClientError> {
        let mut state = self.lock();
        state.check_failure(ActionKind::PatchHookRun, name)?;
        let k = key(namespace, name);
        let existing = state.hook_runs.get(&k).ok_or_else(|| ClientError::NotFound {
            kind: "HookRun",
            name: name.to_owned(),
        })?;
        let mut hook_run = patched(existing, patch)?;
        hook_run.metadata.resource_version = state.next_resource_version();
        state.hook_runs.insert(k, hook_run.clone());
        state.record(ActionKind::PatchHookRun, namespace, name, patch.clone());
        drop(state);
        self.emit(ClusterEvent::HookRunApplied(hook_run.clone()));
        Ok(hook_run)
    }

    async fn delete_hook_run(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.check_failure(ActionKind::DeleteHookRun, name)?;
        let hook_run = state
            .hook_runs
            .remove(&key(namespace, name))
            .ok_or_else(|| ClientError::NotFound {
                kind: "HookRun",
                name: name.to_owned(),
            })?;
        state.record(ActionKind::DeleteHookRun, namespace, name, Value::Null);
        drop(state);
        self.emit(ClusterEvent::HookRunDeleted(hook_run));
        Ok(())
    }

    async fn patch_game_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<GameDeployment, ClientError> {
        self.patch_game_deployment_inner(ActionKind::PatchGameDeployment, namespace, name, patch)
    }

    async fn patch_game_deployment_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<GameDeployment, ClientError> {
        self.patch_game_deployment_inner(
            ActionKind::PatchGameDeploymentStatus,
            namespace,
            name,
            patch,
        )
    }
}

impl MemoryCluster {
    fn patch_pod_inner(
        &self,
        kind: ActionKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Pod, ClientError> {
        let mut state = self.lock();
        state.check_failure(kind, name)?;
        let k = key(namespace, name);
        let existing = state.pods.get(&k).ok_or_else(|| ClientError::NotFound {
            kind: "Pod",
            name: name.to_owned(),
        })?;
        let mut pod = patched(existing, patch)?;
        pod.metadata.resource_version = state.next_resource_version();
        state.pods.insert(k, pod.clone());
        state.record(kind, namespace, name, patch.clone());
        drop(state);
        self.emit(ClusterEvent::PodApplied(pod.clone()));
        Ok(pod)
    }

    fn patch_game_deployment_inner(
        &self,
        kind: ActionKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<GameDeployment, ClientError> {
        let mut state = self.lock();
        state.check_failure(kind, name)?;
        let k = key(namespace, name);
        let existing = state
            .game_deployments
            .get(&k)
            .ok_or_else(|| ClientError::NotFound {
                kind: "GameDeployment",
                name: name.to_owned(),
            })?
            .clone();
        let mut deploy = patched(&existing, patch)?;
        if kind == ActionKind::PatchGameDeployment && deploy.spec != existing.spec {
            deploy.metadata.generation = existing.metadata.generation + 1;
        }
        deploy.metadata.resource_version = state.next_resource_version();
        state.game_deployments.insert(k, deploy.clone());
        state.record(kind, namespace, name, patch.clone());
        drop(state);
        self.emit(ClusterEvent::GameDeploymentApplied(deploy.clone()));
        Ok(deploy)
    }
}
