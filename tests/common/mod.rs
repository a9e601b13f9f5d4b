#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use gamedeployment::cluster::memory::MemoryCluster;
use gamedeployment::cluster::{ClusterEvent, ObjectClient, ObjectStore};
use gamedeployment::controller::util::new_controller_ref;
use gamedeployment::controller::GameDeploymentController;
use gamedeployment::resources::{
    Container, GameDeployment, GameDeploymentSpec, HookStep, HookTemplate, LabelSelector,
    Metadata, Pod, PodSpec, PodTemplateSpec, CONTROLLER_REVISION_HASH_LABEL, INSTANCE_ID_LABEL,
};
use maplit::btreemap;
use tokio::sync::mpsc;

pub const NAMESPACE: &str = "default";

pub fn new_game_deployment(name: &str, replicas: i32) -> GameDeployment {
    let labels = btreemap! {"app".to_owned() => name.to_owned()};
    GameDeployment {
        metadata: Metadata {
            name: name.to_owned(),
            namespace: NAMESPACE.to_owned(),
            ..Default::default()
        },
        spec: GameDeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: labels.clone(),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Metadata {
                    labels,
                    ..Default::default()
                },
                spec: PodSpec {
                    containers: vec![Container {
                        name: "main".to_owned(),
                        image: "game:1.0".to_owned(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            },
            ..Default::default()
        },
        status: Default::default(),
    }
}

pub fn set_image(deploy: &mut GameDeployment, image: &str) {
    deploy.spec.template.spec.containers[0].image = image.to_owned();
}

pub fn hook_template(name: &str) -> HookTemplate {
    HookTemplate {
        metadata: Metadata {
            name: name.to_owned(),
            namespace: NAMESPACE.to_owned(),
            ..Default::default()
        },
        spec: Default::default(),
    }
}

pub fn hook_step(template: &str) -> HookStep {
    HookStep {
        template_name: template.to_owned(),
        args: Vec::new(),
    }
}

/// A pod not owned by anything, carrying `labels`.
pub fn orphan_pod(name: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: Metadata {
            name: name.to_owned(),
            namespace: NAMESPACE.to_owned(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A pod of `deploy` with instance id `id`, created from `revision`.
pub fn owned_pod(deploy: &GameDeployment, id: &str, revision: &str) -> Pod {
    let mut pod = orphan_pod(&format!("{}-{}", deploy.metadata.name, id), &[]);
    pod.metadata.labels = deploy.spec.template.metadata.labels.clone();
    pod.metadata
        .labels
        .insert(CONTROLLER_REVISION_HASH_LABEL.to_owned(), revision.to_owned());
    pod.metadata
        .labels
        .insert(INSTANCE_ID_LABEL.to_owned(), id.to_owned());
    pod.metadata.owner_references =
        vec![new_controller_ref(&deploy.metadata, &GameDeployment::GVK)];
    pod.spec = deploy.spec.template.spec.clone();
    pod
}

/// Drives a controller against an in-memory cluster one pass at a time, feeding every event the
/// pass caused back into the controller.
pub struct Harness {
    pub cluster: Arc<MemoryCluster>,
    pub controller: GameDeploymentController,
    events: mpsc::UnboundedReceiver<ClusterEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(300))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let cluster = Arc::new(MemoryCluster::new());
        let events = cluster.subscribe();
        let store: Arc<dyn ObjectStore> = Arc::clone(&cluster) as Arc<dyn ObjectStore>;
        let client: Arc<dyn ObjectClient> = Arc::clone(&cluster) as Arc<dyn ObjectClient>;
        let controller = GameDeploymentController::new(store, client, timeout);
        Self {
            cluster,
            controller,
            events,
        }
    }

    pub fn apply(&mut self, deploy: GameDeployment) -> GameDeployment {
        let deploy = self.cluster.apply_game_deployment(deploy);
        self.drain();
        deploy
    }

    /// Feed pending events to the controller, returning the keys they map to.
    pub fn drain(&mut self) -> Vec<String> {
        let mut keys = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            keys.extend(self.controller.handle_event(&event));
        }
        keys
    }

    pub async fn sync(&mut self, name: &str) -> gamedeployment::Result<Option<Duration>> {
        let result = self.controller.sync(&format!("{}/{}", NAMESPACE, name)).await;
        self.drain();
        result
    }

    pub fn deploy(&self, name: &str) -> GameDeployment {
        self.cluster
            .game_deployment(NAMESPACE, name)
            .expect("game deployment exists")
    }

    /// Pods owned by the deployment, by name.
    pub fn pods(&self, name: &str) -> Vec<Pod> {
        let deploy = self.deploy(name);
        let mut pods = self
            .cluster
            .pods(NAMESPACE)
            .into_iter()
            .filter(|p| {
                p.metadata
                    .controller_ref()
                    .map_or(false, |r| r.uid == deploy.metadata.uid)
            })
            .collect::<Vec<_>>();
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        pods
    }

    pub fn set_ready(&mut self, name: &str) {
        for pod in self.pods(name) {
            self.cluster.set_pod_ready(NAMESPACE, &pod.metadata.name, true);
        }
        self.drain();
    }

    /// Sync `passes` times, marking every pod ready after each pass.
    pub async fn settle(&mut self, name: &str, passes: usize) {
        for _ in 0..passes {
            self.sync(name).await.expect("sync succeeds");
            self.set_ready(name);
        }
    }
}
