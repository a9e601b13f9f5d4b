use std::{fmt::Debug, hash::Hash, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::ControllerRevision as KubeControllerRevision,
    core::v1::{Node as KubeNode, Pod as KubePod},
};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind as KubeGroupVersionKind},
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Api, Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use crate::cluster::{ClientError, ClusterEvent, ObjectClient, ObjectStore};
use crate::resources::{
    ControllerRevision, GameDeployment, GroupVersionKind, HookRun, HookTemplate, Meta, Node, Pod,
};

fn convert<T: Serialize, U: DeserializeOwned>(from: &T) -> Result<U, ClientError> {
    Ok(serde_json::from_value(serde_json::to_value(from)?)?)
}

// Cache reads can't fail, objects that don't fit our model are skipped with a warning.
fn convert_cached<T: Serialize, U: DeserializeOwned>(from: &T) -> Option<U> {
    match convert(from) {
        Ok(u) => Some(u),
        Err(error) => {
            warn!(%error, "Skipping cached object that failed to convert");
            None
        }
    }
}

fn api_resource(gvk: &GroupVersionKind) -> ApiResource {
    ApiResource::from_gvk(&KubeGroupVersionKind::gvk(gvk.group, gvk.version, gvk.kind))
}

fn to_dynamic<T: Serialize>(
    object: &T,
    gvk: &GroupVersionKind,
) -> Result<DynamicObject, ClientError> {
    let mut value = serde_json::to_value(object)?;
    value["apiVersion"] = Value::String(gvk.api_version());
    value["kind"] = Value::String(gvk.kind.to_owned());
    Ok(serde_json::from_value(value)?)
}

/// A cluster backed by a kubernetes API server, reads are served from reflector stores.
pub struct KubeCluster {
    client: Client,
    game_deployment_resource: ApiResource,
    hook_run_resource: ApiResource,
    hook_template_resource: ApiResource,
    game_deployments: Store<DynamicObject>,
    pods: Store<KubePod>,
    nodes: Store<KubeNode>,
    revisions: Store<KubeControllerRevision>,
    hook_runs: Store<DynamicObject>,
    hook_templates: Store<DynamicObject>,
}

impl KubeCluster {
    /// Start watching the resources the controller needs, publishing changes to `events`.
    pub fn start(
        client: Client,
        namespace: Option<&str>,
        events: mpsc::UnboundedSender<ClusterEvent>,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let game_deployment_resource = api_resource(&GameDeployment::GVK);
        let hook_run_resource = api_resource(&HookRun::GVK);
        let hook_template_resource = api_resource(&HookTemplate::GVK);

        let dynamic_api = |ar: &ApiResource| match namespace {
            Some(ns) => Api::<DynamicObject>::namespaced_with(client.clone(), ns, ar),
            None => Api::<DynamicObject>::all_with(client.clone(), ar),
        };
        let pod_api = match namespace {
            Some(ns) => Api::<KubePod>::namespaced(client.clone(), ns),
            None => Api::<KubePod>::all(client.clone()),
        };
        let revision_api = match namespace {
            Some(ns) => Api::<KubeControllerRevision>::namespaced(client.clone(), ns),
            None => Api::<KubeControllerRevision>::all(client.clone()),
        };

        let mut handles = Vec::new();

        let writer = Writer::new(game_deployment_resource.clone());
        let game_deployments = writer.as_reader();
        handles.push(spawn_watch(
            dynamic_api(&game_deployment_resource),
            writer,
            events.clone(),
            |o, deleted| {
                convert_cached(o).map(|d| {
                    if deleted {
                        ClusterEvent::GameDeploymentDeleted(d)
                    } else {
                        ClusterEvent::GameDeploymentApplied(d)
                    }
                })
            },
        ));

        let writer = Writer::new(hook_run_resource.clone());
        let hook_runs = writer.as_reader();
        handles.push(spawn_watch(
            dynamic_api(&hook_run_resource),
            writer,
            events.clone(),
            |o, deleted| {
                convert_cached(o).map(|h| {
                    if deleted {
                        ClusterEvent::HookRunDeleted(h)
                    } else {
                        ClusterEvent::HookRunApplied(h)
                    }
                })
            },
        ));

        let writer = Writer::new(hook_template_resource.clone());
        let hook_templates = writer.as_reader();
        handles.push(spawn_watch(
            dynamic_api(&hook_template_resource),
            writer,
            events.clone(),
            |_, _| None,
        ));

        let (pods, writer) = reflector::store::<KubePod>();
        handles.push(spawn_watch(pod_api, writer, events.clone(), |o, deleted| {
            convert_cached(o).map(|p| {
                if deleted {
                    ClusterEvent::PodDeleted(p)
                } else {
                    ClusterEvent::PodApplied(p)
                }
            })
        }));

        let (nodes, writer) = reflector::store::<KubeNode>();
        handles.push(spawn_watch(
            Api::<KubeNode>::all(client.clone()),
            writer,
            events.clone(),
            |_, _| None,
        ));

        let (revisions, writer) = reflector::store::<KubeControllerRevision>();
        handles.push(spawn_watch(revision_api, writer, events, |_, _| None));

        let cluster = KubeCluster {
            client,
            game_deployment_resource,
            hook_run_resource,
            hook_template_resource,
            game_deployments,
            pods,
            nodes,
            revisions,
            hook_runs,
            hook_templates,
        };
        (Arc::new(cluster), handles)
    }

    /// Wait for every cache to complete its initial list.
    pub async fn wait_until_synced(&self) {
        let results = [
            self.game_deployments.wait_until_ready().await,
            self.pods.wait_until_ready().await,
            self.nodes.wait_until_ready().await,
            self.revisions.wait_until_ready().await,
            self.hook_runs.wait_until_ready().await,
            self.hook_templates.wait_until_ready().await,
        ];
        for result in results {
            if let Err(error) = result {
                warn!(%error, "Cache stopped before it synced");
            }
        }
        info!("Caches synced");
    }

    fn pod_api(&self, namespace: &str) -> Api<KubePod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn revision_api(&self, namespace: &str) -> Api<KubeControllerRevision> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn dynamic_api(&self, namespace: &str, ar: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }
}

fn spawn_watch<K>(
    api: Api<K>,
    writer: Writer<K>,
    events: mpsc::UnboundedSender<ClusterEvent>,
    to_event: fn(&K, bool) -> Option<ClusterEvent>,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    tokio::spawn(async move {
        let stream = reflector::reflector(
            writer,
            watcher(api, watcher::Config::default()).default_backoff(),
        );
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(error) => {
                    warn!(%error, "Watch failed, retrying");
                    continue;
                }
            };
            let changes = match event {
                watcher::Event::Applied(o) => vec![to_event(&o, false)],
                watcher::Event::Deleted(o) => vec![to_event(&o, true)],
                watcher::Event::Restarted(os) => os.iter().map(|o| to_event(o, false)).collect(),
            };
            for change in changes.into_iter().flatten() {
                if events.send(change).is_err() {
                    info!("Event receiver dropped, stopping watch");
                    return;
                }
            }
        }
    })
}

fn in_namespace<T: Meta>(objects: Vec<T>, namespace: &str) -> Vec<T> {
    objects
        .into_iter()
        .filter(|o| namespace.is_empty() || o.metadata().namespace == namespace)
        .collect()
}

impl ObjectStore for KubeCluster {
    fn game_deployment(&self, namespace: &str, name: &str) -> Option<GameDeployment> {
        let key = ObjectRef::new_with(name, self.game_deployment_resource.clone()).within(namespace);
        self.game_deployments
            .get(&key)
            .and_then(|o| convert_cached(o.as_ref()))
    }

    fn game_deployments(&self, namespace: &str) -> Vec<GameDeployment> {
        let all = self
            .game_deployments
            .state()
            .iter()
            .filter_map(|o| convert_cached(o.as_ref()))
            .collect();
        in_namespace(all, namespace)
    }

    fn pods(&self, namespace: &str) -> Vec<Pod> {
        let all = self
            .pods
            .state()
            .iter()
            .filter_map(|o| convert_cached(o.as_ref()))
            .collect();
        in_namespace(all, namespace)
    }

    fn node(&self, name: &str) -> Option<Node> {
        self.nodes
            .get(&ObjectRef::new(name))
            .and_then(|o| convert_cached(o.as_ref()))
    }

    fn controller_revisions(&self, namespace: &str) -> Vec<ControllerRevision> {
        let all = self
            .revisions
            .state()
            .iter()
            .filter_map(|o| convert_cached(o.as_ref()))
            .collect();
        in_namespace(all, namespace)
    }

    fn hook_runs(&self, namespace: &str) -> Vec<HookRun> {
        let all = self
            .hook_runs
            .state()
            .iter()
            .filter_map(|o| convert_cached(o.as_ref()))
            .collect();
        in_namespace(all, namespace)
    }

    fn hook_template(&self, namespace: &str, name: &str) -> Option<HookTemplate> {
        let key = ObjectRef::new_with(name, self.hook_template_resource.clone()).within(namespace);
        self.hook_templates
            .get(&key)
            .and_then(|o| convert_cached(o.as_ref()))
    }
}

#[async_trait]
impl ObjectClient for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClientError> {
        let pod = self.pod_api(namespace).get(name).await?;
        convert(&pod)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClientError> {
        let remote: KubePod = convert(pod)?;
        let created = self
            .pod_api(&pod.metadata.namespace)
            .create(&PostParams::default(), &remote)
            .await?;
        convert(&created)
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Pod, ClientError> {
        let patched = self
            .pod_api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        convert(&patched)
    }

    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Pod, ClientError> {
        let patched = self
            .pod_api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        convert(&patched)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.pod_api(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_controller_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ControllerRevision, ClientError> {
        let revision = self.revision_api(namespace).get(name).await?;
        convert(&revision)
    }

    async fn create_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, ClientError> {
        let remote: KubeControllerRevision = convert(revision)?;
        let created = self
            .revision_api(&revision.metadata.namespace)
            .create(&PostParams::default(), &remote)
            .await?;
        convert(&created)
    }

    async fn update_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, ClientError> {
        let remote: KubeControllerRevision = convert(revision)?;
        let replaced = self
            .revision_api(&revision.metadata.namespace)
            .replace(&revision.metadata.name, &PostParams::default(), &remote)
            .await?;
        convert(&replaced)
    }

    async fn delete_controller_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.revision_api(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn create_hook_run(&self, hook_run: &HookRun) -> Result<HookRun, ClientError> {
        let remote = to_dynamic(hook_run, &HookRun::GVK)?;
        let created = self
            .dynamic_api(&hook_run.metadata.namespace, &self.hook_run_resource)
            .create(&PostParams::default(), &remote)
            .await?;
        convert(&created)
    }

    async fn patch_hook_run(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<HookRun, ClientError> {
        let patched = self
            .dynamic_api(namespace, &self.hook_run_resource)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        convert(&patched)
    }

    async fn delete_hook_run(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.dynamic_api(namespace, &self.hook_run_resource)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch_game_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<GameDeployment, ClientError> {
        let patched = self
            .dynamic_api(namespace, &self.game_deployment_resource)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        convert(&patched)
    }

    async fn patch_game_deployment_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<GameDeployment, ClientError> {
        let patched = self
            .dynamic_api(namespace, &self.game_deployment_resource)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        convert(&patched)
    }
}
