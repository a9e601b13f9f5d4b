//! Updating pods to a new revision without recreating them.
//!
//! Only container images and pod labels and annotations can change in place. The in-place updater
//! guards the update with the `InPlaceUpdateReady` readiness gate so the pod leaves its services
//! while the kubelet restarts the containers. The hot-patch updater patches the same fields without
//! touching readiness.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::cluster::ObjectClient;
use crate::resources::{
    ConditionStatus, Container, ControllerRevision, Metadata, Pod, PodCondition, PodTemplateSpec, Time,
    CONTROLLER_REVISION_HASH_LABEL, IN_PLACE_UPDATE_READY,
};
use crate::utils::{now, positive_duration};
use crate::{Error, Result};

pub const IN_PLACE_UPDATE_STATE_ANNOTATION: &str = "tkex.tencent.com/inplace-update-state";
pub const IN_PLACE_UPDATE_GRACE_ANNOTATION: &str = "tkex.tencent.com/inplace-update-grace";
pub const HOT_PATCH_STATE_ANNOTATION: &str = "tkex.tencent.com/hot-patch-state";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub grace_period_seconds: i32,
}

#[derive(Debug, Default)]
pub struct RefreshResult {
    pub refresh_err: Option<Error>,
    pub delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct UpdateResult {
    pub in_place_update: bool,
    pub update_err: Option<Error>,
    pub delay: Option<Duration>,
}

/// Recorded on the pod when an in-place update starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InPlaceUpdateState {
    pub revision: String,
    pub update_timestamp: Time,
    // Image ids of the updated containers before the update.
    pub last_container_statuses: BTreeMap<String, String>,
}

/// Images waiting for the grace period to pass before being applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InPlaceUpdateGrace {
    pub revision: String,
    pub container_images: BTreeMap<String, String>,
    pub grace_seconds: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotPatchState {
    pub revision: String,
    pub update_timestamp: Time,
}

/// The changes needed to move a pod between two revisions in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InPlaceSpec {
    pub revision: String,
    pub container_images: BTreeMap<String, String>,
    // null values remove the key
    pub labels: Map<String, Value>,
    pub annotations: Map<String, Value>,
}

/// The pod template recorded in a revision.
pub fn revision_template(revision: &ControllerRevision) -> Result<PodTemplateSpec> {
    let mut template = revision
        .data
        .pointer("/spec/template")
        .cloned()
        .unwrap_or(Value::Null);
    if let Value::Object(t) = &mut template {
        t.remove("$patch");
    }
    serde_json::from_value(template)
        .map_err(|e| Error::Revision(revision.metadata.name.clone(), e.to_string()))
}

fn map_diff(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Map<String, Value> {
    let mut diff = Map::new();
    for (k, v) in new {
        if old.get(k) != Some(v) {
            diff.insert(k.clone(), Value::String(v.clone()));
        }
    }
    for k in old.keys() {
        if !new.contains_key(k) {
            diff.insert(k.clone(), Value::Null);
        }
    }
    diff
}

fn without_image(c: &Container) -> Container {
    Container {
        image: String::new(),
        ..c.clone()
    }
}

/// Compute the in-place changes between two revisions, `None` when something other than images and
/// metadata labels or annotations changed.
pub fn calculate_inplace_spec(
    old: &ControllerRevision,
    new: &ControllerRevision,
) -> Result<Option<InPlaceSpec>> {
    let old_template = revision_template(old)?;
    let new_template = revision_template(new)?;

    let (os, ns) = (&old_template.spec, &new_template.spec);
    if os.containers.len() != ns.containers.len()
        || os.init_containers != ns.init_containers
        || os.readiness_gates != ns.readiness_gates
        || os.node_name != ns.node_name
        || os.extra != ns.extra
    {
        return Ok(None);
    }
    let mut container_images = BTreeMap::new();
    for (oc, nc) in os.containers.iter().zip(&ns.containers) {
        if without_image(oc) != without_image(nc) {
            return Ok(None);
        }
        if oc.image != nc.image {
            container_images.insert(nc.name.clone(), nc.image.clone());
        }
    }

    let (om, nm) = (&old_template.metadata, &new_template.metadata);
    let comparable = |m: &Metadata| Metadata {
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        ..m.clone()
    };
    if comparable(om) != comparable(nm) {
        return Ok(None);
    }

    Ok(Some(InPlaceSpec {
        revision: new.metadata.name.clone(),
        container_images,
        labels: map_diff(&om.labels, &nm.labels),
        annotations: map_diff(&om.annotations, &nm.annotations),
    }))
}

// The full container list of `pod` with `images` applied, merge patches replace lists whole.
fn patched_containers(pod: &Pod, images: &BTreeMap<String, String>) -> Result<Value> {
    let containers = pod
        .spec
        .containers
        .iter()
        .map(|c| match images.get(&c.name) {
            Some(image) => Container {
                image: image.clone(),
                ..c.clone()
            },
            None => c.clone(),
        })
        .collect::<Vec<_>>();
    Ok(serde_json::to_value(containers)?)
}

// Condition list of `pod` with InPlaceUpdateReady set to `status`.
fn with_ready_condition(pod: &Pod, status: ConditionStatus, reason: Option<&str>) -> Vec<PodCondition> {
    let mut conditions = pod.status.conditions.clone();
    let now = Time::now();
    match conditions.iter_mut().find(|c| c.r#type == IN_PLACE_UPDATE_READY) {
        Some(c) => {
            if c.status != status {
                c.last_transition_time = Some(now);
            }
            c.status = status;
            c.reason = reason.map(str::to_owned);
        }
        None => conditions.push(PodCondition {
            r#type: IN_PLACE_UPDATE_READY.to_owned(),
            status,
            last_probe_time: None,
            last_transition_time: Some(now),
            reason: reason.map(str::to_owned),
            message: None,
        }),
    }
    conditions
}

fn has_readiness_gate(pod: &Pod) -> bool {
    pod.spec
        .readiness_gates
        .iter()
        .any(|g| g.condition_type == IN_PLACE_UPDATE_READY)
}

fn annotation<T: for<'de> Deserialize<'de>>(pod: &Pod, key: &str) -> Option<T> {
    pod.metadata
        .annotations
        .get(key)
        .and_then(|v| serde_json::from_str(v).ok())
}

pub struct InPlaceControl {
    client: Arc<dyn ObjectClient>,
}

impl InPlaceControl {
    pub fn new(client: Arc<dyn ObjectClient>) -> Self {
        Self { client }
    }

    async fn set_ready_condition(
        &self,
        pod: &Pod,
        status: ConditionStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let patch = json!({"status": {"conditions": with_ready_condition(pod, status, reason)}});
        self.client
            .patch_pod_status(&pod.metadata.namespace, &pod.metadata.name, &patch)
            .await?;
        Ok(())
    }

    /// Apply images whose grace period expired and mark finished in-place updates ready.
    pub async fn refresh(&self, pod: &Pod, opts: &UpdateOptions) -> RefreshResult {
        match self.try_refresh(pod, opts).await {
            Ok(delay) => RefreshResult {
                refresh_err: None,
                delay,
            },
            Err(e) => RefreshResult {
                refresh_err: Some(e),
                delay: None,
            },
        }
    }

    async fn try_refresh(&self, pod: &Pod, _opts: &UpdateOptions) -> Result<Option<Duration>> {
        if let Some(grace) = annotation::<InPlaceUpdateGrace>(pod, IN_PLACE_UPDATE_GRACE_ANNOTATION) {
            let started = annotation::<InPlaceUpdateState>(pod, IN_PLACE_UPDATE_STATE_ANNOTATION)
                .map(|s| s.update_timestamp)
                .unwrap_or_else(Time::now);
            let end = started.0 + time::Duration::seconds(i64::from(grace.grace_seconds));
            if let Some(remaining) = positive_duration(end - now()) {
                debug!(pod = pod.metadata.name, ?remaining, "In-place update grace period pending");
                return Ok(Some(remaining));
            }
            info!(pod = pod.metadata.name, revision = grace.revision, "Applying in-place update after grace period");
            let patch = json!({
                "metadata": {"annotations": {IN_PLACE_UPDATE_GRACE_ANNOTATION: null}},
                "spec": {"containers": patched_containers(pod, &grace.container_images)?},
            });
            self.client
                .patch_pod(&pod.metadata.namespace, &pod.metadata.name, &patch)
                .await?;
            return Ok(None);
        }

        if !has_readiness_gate(pod) {
            return Ok(None);
        }
        let condition = pod.condition(IN_PLACE_UPDATE_READY);
        match condition.map(|c| c.status) {
            Some(ConditionStatus::True) => Ok(None),
            None => {
                self.set_ready_condition(pod, ConditionStatus::True, None).await?;
                Ok(None)
            }
            Some(_) => {
                let Some(state) =
                    annotation::<InPlaceUpdateState>(pod, IN_PLACE_UPDATE_STATE_ANNOTATION)
                else {
                    self.set_ready_condition(pod, ConditionStatus::True, None).await?;
                    return Ok(None);
                };
                // every updated container must be running a new image
                let done = state.last_container_statuses.iter().all(|(name, old_id)| {
                    pod.status
                        .container_statuses
                        .iter()
                        .find(|s| &s.name == name)
                        .map_or(false, |s| &s.image_id != old_id)
                });
                if done {
                    debug!(pod = pod.metadata.name, "In-place update finished");
                    self.set_ready_condition(pod, ConditionStatus::True, None).await?;
                }
                Ok(None)
            }
        }
    }

    /// Move `pod` from `old` to `new` in place.
    pub async fn update(
        &self,
        pod: &Pod,
        old: &ControllerRevision,
        new: &ControllerRevision,
        opts: &UpdateOptions,
    ) -> UpdateResult {
        let spec = match calculate_inplace_spec(old, new) {
            Ok(Some(spec)) => spec,
            Ok(None) => return UpdateResult::default(),
            Err(e) => {
                return UpdateResult {
                    in_place_update: true,
                    update_err: Some(e),
                    delay: None,
                }
            }
        };
        match self.apply(pod, spec, opts).await {
            Ok(delay) => UpdateResult {
                in_place_update: true,
                update_err: None,
                delay,
            },
            Err(e) => UpdateResult {
                in_place_update: true,
                update_err: Some(e),
                delay: None,
            },
        }
    }

    async fn apply(&self, pod: &Pod, spec: InPlaceSpec, opts: &UpdateOptions) -> Result<Option<Duration>> {
        if has_readiness_gate(pod) {
            self.set_ready_condition(pod, ConditionStatus::False, Some("StartInPlaceUpdate"))
                .await?;
        }

        let state = InPlaceUpdateState {
            revision: spec.revision.clone(),
            update_timestamp: Time::now(),
            last_container_statuses: pod
                .status
                .container_statuses
                .iter()
                .filter(|s| spec.container_images.contains_key(&s.name))
                .map(|s| (s.name.clone(), s.image_id.clone()))
                .collect(),
        };

        let mut labels = spec.labels;
        labels.insert(
            CONTROLLER_REVISION_HASH_LABEL.to_owned(),
            Value::String(spec.revision.clone()),
        );
        let mut annotations = spec.annotations;
        annotations.insert(
            IN_PLACE_UPDATE_STATE_ANNOTATION.to_owned(),
            Value::String(serde_json::to_string(&state)?),
        );

        let defer = opts.grace_period_seconds > 0 && !spec.container_images.is_empty();
        let mut patch = json!({"metadata": {"labels": labels, "annotations": annotations}});
        if defer {
            let grace = InPlaceUpdateGrace {
                revision: spec.revision.clone(),
                container_images: spec.container_images,
                grace_seconds: opts.grace_period_seconds,
            };
            patch["metadata"]["annotations"][IN_PLACE_UPDATE_GRACE_ANNOTATION] =
                Value::String(serde_json::to_string(&grace)?);
        } else if !spec.container_images.is_empty() {
            patch["spec"] = json!({"containers": patched_containers(pod, &spec.container_images)?});
        }

        info!(pod = pod.metadata.name, revision = spec.revision, deferred = defer, "Updating pod in place");
        self.client
            .patch_pod(&pod.metadata.namespace, &pod.metadata.name, &patch)
            .await?;

        Ok(defer.then(|| Duration::from_secs(opts.grace_period_seconds as u64)))
    }
}

pub struct HotPatchControl {
    client: Arc<dyn ObjectClient>,
}

impl HotPatchControl {
    pub fn new(client: Arc<dyn ObjectClient>) -> Self {
        Self { client }
    }

    pub async fn update(&self, pod: &Pod, old: &ControllerRevision, new: &ControllerRevision) -> Result<()> {
        let spec = calculate_inplace_spec(old, new)?
            .ok_or_else(|| Error::NotInPlaceUpdatable(pod.metadata.name.clone()))?;
        let state = HotPatchState {
            revision: spec.revision.clone(),
            update_timestamp: Time::now(),
        };
        let mut labels = spec.labels;
        labels.insert(
            CONTROLLER_REVISION_HASH_LABEL.to_owned(),
            Value::String(spec.revision.clone()),
        );
        let mut annotations = spec.annotations;
        annotations.insert(
            HOT_PATCH_STATE_ANNOTATION.to_owned(),
            Value::String(serde_json::to_string(&state)?),
        );
        let mut patch = json!({"metadata": {"labels": labels, "annotations": annotations}});
        if !spec.container_images.is_empty() {
            patch["spec"] = json!({"containers": patched_containers(pod, &spec.container_images)?});
        }
        info!(pod = pod.metadata.name, revision = spec.revision, "Hot patching pod");
        self.client
            .patch_pod(&pod.metadata.namespace, &pod.metadata.name, &patch)
            .await?;
        Ok(())
    }
}
