use async_trait::async_trait;
use serde_json::Value;

use crate::resources::{ControllerRevision, GameDeployment, HookRun, HookTemplate, Node, Pod};

pub mod memory;
pub mod remote;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("operation on {kind} {name} failed: {message}")]
    Failed {
        kind: &'static str,
        name: String,
        message: String,
    },

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound { .. } => true,
            ClientError::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            ClientError::AlreadyExists { .. } => true,
            ClientError::Kube(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "AlreadyExists"
            }
            _ => false,
        }
    }
}

/// Read access to the informer caches.
///
/// Reads are snapshots and never block on the network, they may be stale.
pub trait ObjectStore: Send + Sync {
    fn game_deployment(&self, namespace: &str, name: &str) -> Option<GameDeployment>;

    fn game_deployments(&self, namespace: &str) -> Vec<GameDeployment>;

    fn pods(&self, namespace: &str) -> Vec<Pod>;

    fn node(&self, name: &str) -> Option<Node>;

    fn controller_revisions(&self, namespace: &str) -> Vec<ControllerRevision>;

    fn hook_runs(&self, namespace: &str) -> Vec<HookRun>;

    fn hook_template(&self, namespace: &str, name: &str) -> Option<HookTemplate>;
}

/// Mutations against the cluster. Patches are JSON merge patches.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClientError>;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClientError>;

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value)
        -> Result<Pod, ClientError>;

    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Pod, ClientError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn get_controller_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ControllerRevision, ClientError>;

    async fn create_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, ClientError>;

    async fn update_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, ClientError>;

    async fn delete_controller_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;

    async fn create_hook_run(&self, hook_run: &HookRun) -> Result<HookRun, ClientError>;

    async fn patch_hook_run(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<HookRun, ClientError>;

    async fn delete_hook_run(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn patch_game_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<GameDeployment, ClientError>;

    async fn patch_game_deployment_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<GameDeployment, ClientError>;
}

/// A change observed by a watch.
#[derive(Clone, Debug)]
pub enum ClusterEvent {
    PodApplied(Pod),
    PodDeleted(Pod),
    GameDeploymentApplied(GameDeployment),
    GameDeploymentDeleted(GameDeployment),
    HookRunApplied(HookRun),
    HookRunDeleted(HookRun),
}
