use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt::Display};

use crate::{Error, Result};

pub trait Meta {
    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
}

macro_rules! impl_meta {
    ($r:ident) => {
        impl Meta for $r {
            fn metadata(&self) -> &Metadata {
                &self.metadata
            }
            fn metadata_mut(&mut self) -> &mut Metadata {
                &mut self.metadata
            }
        }
    };
}

impl_meta!(GameDeployment);
impl_meta!(Pod);
impl_meta!(Node);
impl_meta!(ControllerRevision);
impl_meta!(HookRun);
impl_meta!(HookTemplate);

// Label on pods holding the name of the revision they were created from, and on revisions holding
// their hash.
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";
pub const INSTANCE_ID_LABEL: &str = "tkex.tencent.com/instance-id";

pub const POD_INDEX_ANNOTATION: &str = "tkex.tencent.com/pod-index";
pub const POD_INDEX_INJECT_ANNOTATION: &str = "tkex.tencent.com/pod-index-inject";
pub const POD_INDEX_RANGE_ANNOTATION: &str = "tkex.tencent.com/pod-index-range";
pub const POD_INDEX_ENV: &str = "POD_INDEX";
pub const POD_DELETING_ANNOTATION: &str = "tkex.tencent.com/deleting";
pub const POD_UPDATE_PAUSED_ANNOTATION: &str = "tkex.tencent.com/update-paused";

pub const POD_DELETION_COST_ANNOTATION: &str = "tkex.tencent.com/pod-deletion-cost";
pub const NODE_DELETION_COST_ANNOTATION: &str = "tkex.tencent.com/node-deletion-cost";
pub const DELETION_COST_SORT_METHOD_ANNOTATION: &str =
    "tkex.tencent.com/deletion-cost-sort-method";

pub const HOOK_RUN_TYPE_LABEL: &str = "tkex.tencent.com/hookrun-type";
pub const HOOK_POD_INSTANCE_ID_LABEL: &str = "tkex.tencent.com/pod-instance-id";
pub const HOOK_REVISION_LABEL: &str = "tkex.tencent.com/workload-revision";
pub const HOOK_STEP_INDEX_LABEL: &str = "tkex.tencent.com/step-index";

pub const POD_READY: &str = "Ready";
pub const IN_PLACE_UPDATE_READY: &str = "InPlaceUpdateReady";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<Time>,

    // Set by the server when a graceful deletion is requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<Time>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    // A sequence number representing a specific generation of the desired state (spec).
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub generation: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl Metadata {
    /// The controller owner reference, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|or| or.controller)
    }
}

fn i64_is_zero(val: &i64) -> bool {
    *val == 0
}

fn is_false(val: &bool) -> bool {
    !*val
}

fn is_default<D: Default + PartialEq>(val: &D) -> bool {
    val == &D::default()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,

    pub kind: String,

    pub name: String,

    pub uid: String,

    #[serde(default)]
    pub block_owner_deletion: bool,

    #[serde(default)]
    pub controller: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GameDeployment {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: GameDeploymentSpec,
    #[serde(default)]
    pub status: GameDeploymentStatus,
}

impl GameDeployment {
    pub const GVK: GroupVersionKind = GroupVersionKind {
        group: "tkex.tencent.com",
        version: "v1alpha1",
        kind: "GameDeployment",
    };

    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn canary_steps(&self) -> Option<&[CanaryStep]> {
        self.spec
            .update_strategy
            .canary
            .as_ref()
            .map(|c| c.steps.as_slice())
    }

    pub fn pod_index_injected(&self) -> bool {
        self.metadata
            .annotations
            .get(POD_INDEX_INJECT_ANNOTATION)
            .map_or(false, |v| v == "true")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDeploymentSpec {
    // Desired number of pods. A nil value is a configuration error at scale time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub selector: LabelSelector,

    #[serde(default)]
    pub template: PodTemplateSpec,

    #[serde(default)]
    pub update_strategy: GameDeploymentUpdateStrategy,

    #[serde(default, skip_serializing_if = "is_default")]
    pub scale_strategy: GameDeploymentScaleStrategy,

    #[serde(default, skip_serializing_if = "is_default")]
    pub pre_delete_update_strategy: LifecycleHookStrategy,

    #[serde(default, skip_serializing_if = "is_default")]
    pub pre_inplace_update_strategy: LifecycleHookStrategy,

    #[serde(default, skip_serializing_if = "is_default")]
    pub post_inplace_update_strategy: LifecycleHookStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,

    // Minimum number of seconds for which a newly created pod should be ready without any of its
    // container crashing, for it to be considered available.
    #[serde(default)]
    pub min_ready_seconds: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDeploymentUpdateStrategy {
    #[serde(default)]
    pub r#type: UpdateStrategyType,

    // Number of pods kept on the current revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub paused: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_place_update_strategy: Option<InPlaceUpdateStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryStrategy>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStrategyType {
    #[default]
    RollingUpdate,
    #[serde(rename = "InplaceUpdate", alias = "InPlaceUpdate")]
    InPlaceUpdate,
    HotPatchUpdate,
    #[serde(other)]
    Unsupported,
}

impl Display for UpdateStrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateStrategyType::RollingUpdate => "RollingUpdate",
            UpdateStrategyType::InPlaceUpdate => "InplaceUpdate",
            UpdateStrategyType::HotPatchUpdate => "HotPatchUpdate",
            UpdateStrategyType::Unsupported => "Unsupported",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InPlaceUpdateStrategy {
    #[serde(default)]
    pub grace_period_seconds: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStrategy {
    #[serde(default)]
    pub steps: Vec<CanaryStep>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<CanaryPause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookStep>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryPause {
    // Seconds to pause for, unset pauses until the user unpauses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookStep {
    pub template_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<HookArgument>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDeploymentScaleStrategy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods_to_delete: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleHookStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookStep>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub retry_unexpected_hooks: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDeploymentStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    // Pods ready for at least minReadySeconds.
    #[serde(default)]
    pub available_replicas: i32,

    #[serde(default)]
    pub updated_replicas: i32,

    #[serde(default)]
    pub updated_ready_replicas: i32,

    #[serde(default)]
    pub current_revision: String,

    #[serde(default)]
    pub update_revision: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<i32>,

    #[serde(default)]
    pub current_step_hash: String,

    #[serde(default)]
    pub canary: CanaryStatus,

    #[serde(default)]
    pub pause_conditions: Vec<PauseCondition>,

    #[serde(default)]
    pub pre_delete_hook_conditions: Vec<PodHookCondition>,

    #[serde(default)]
    pub pre_inplace_hook_conditions: Vec<PodHookCondition>,

    #[serde(default)]
    pub post_inplace_hook_conditions: Vec<PodHookCondition>,

    #[serde(default)]
    pub conditions: Vec<GameDeploymentCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStatus {
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub current_step_hook_run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_time: Option<Time>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseCondition {
    pub reason: PauseReason,
    pub start_time: Time,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseReason {
    CanaryPauseStep,
    StepBasedHookRunInconclusive,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodHookCondition {
    pub pod_name: String,
    pub start_time: Time,
    #[serde(default)]
    pub hook_phase: HookPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_time: Option<Time>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDeploymentCondition {
    pub r#type: GameDeploymentConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameDeploymentConditionType {
    FailedScale,
    FailedUpdate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    pub const GVK: GroupVersionKind = GroupVersionKind {
        group: "",
        version: "v1",
        kind: "Pod",
    };

    /// The name of the revision this pod was created from or last updated to.
    pub fn revision(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(CONTROLLER_REVISION_HASH_LABEL)
            .map(String::as_str)
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(INSTANCE_ID_LABEL)
            .map(String::as_str)
    }

    pub fn pod_index(&self) -> Option<i32> {
        self.metadata
            .annotations
            .get(POD_INDEX_ANNOTATION)
            .and_then(|v| v.parse().ok())
    }

    pub fn condition(&self, cond_type: &str) -> Option<&PodCondition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.r#type == cond_type)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default)]
    pub containers: Vec<Container>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_gates: Vec<PodReadinessGate>,

    // Everything the controller does not interpret, kept so pods round-trip losslessly.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodReadinessGate {
    pub condition_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PodCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_statuses: Vec<ContainerStatus>,

    #[serde(default, rename = "hostIP", skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    #[serde(default, rename = "podIP", skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    // Ready, InPlaceUpdateReady and the other kubelet condition types.
    pub r#type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Unknown,
    Running,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub restart_count: i32,
    #[serde(default)]
    pub image: String,
    #[serde(default, rename = "imageID")]
    pub image_id: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: Metadata,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRevision {
    pub metadata: Metadata,
    pub revision: i64,
    // The patch reconstructing the workload spec of this revision.
    #[serde(default)]
    pub data: Value,
}

impl ControllerRevision {
    pub const GVK: GroupVersionKind = GroupVersionKind {
        group: "apps",
        version: "v1",
        kind: "ControllerRevision",
    };
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HookRun {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: HookRunSpec,
    #[serde(default)]
    pub status: HookRunStatus,
}

impl HookRun {
    pub const GVK: GroupVersionKind = GroupVersionKind {
        group: "tkex.tencent.com",
        version: "v1alpha1",
        kind: "HookRun",
    };
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRunSpec {
    #[serde(default)]
    pub metrics: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<HookArgument>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub terminate: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRunStatus {
    #[serde(default)]
    pub phase: HookPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookPhase {
    #[default]
    Pending,
    Running,
    Successful,
    Failed,
    Error,
    Inconclusive,
}

impl HookPhase {
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            HookPhase::Successful | HookPhase::Failed | HookPhase::Error | HookPhase::Inconclusive
        )
    }

    // A run that ended without success.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            HookPhase::Failed | HookPhase::Error | HookPhase::Inconclusive
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HookTemplate {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: HookTemplateSpec,
}

impl HookTemplate {
    pub const GVK: GroupVersionKind = GroupVersionKind {
        group: "tkex.tencent.com",
        version: "v1alpha1",
        kind: "HookTemplate",
    };
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookTemplateSpec {
    #[serde(default)]
    pub args: Vec<HookArgument>,
    #[serde(default)]
    pub metrics: Vec<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_match = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k).map_or(false, |lv| v == lv));
        labels_match
            && self.match_expressions.iter().all(|r| {
                let value = labels.get(&r.key);
                match r.operator {
                    LabelSelectorOperator::In => value.map_or(false, |v| r.values.contains(v)),
                    LabelSelectorOperator::NotIn => value.map_or(true, |v| !r.values.contains(v)),
                    LabelSelectorOperator::Exists => value.is_some(),
                    LabelSelectorOperator::DoesNotExist => value.is_none(),
                }
            })
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}

impl Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        for r in &self.match_expressions {
            parts.push(match r.operator {
                LabelSelectorOperator::In => format!("{} in ({})", r.key, r.values.join(",")),
                LabelSelectorOperator::NotIn => {
                    format!("{} notin ({})", r.key, r.values.join(","))
                }
                LabelSelectorOperator::Exists => r.key.clone(),
                LabelSelectorOperator::DoesNotExist => format!("!{}", r.key),
            });
        }
        write!(f, "{}", parts.join(","))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i32),
    Str(String),
}

impl IntOrString {
    // GetValueFromIntOrPercent, a percentage is scaled against total and rounded as requested.
    pub fn scaled_value(&self, total: i32, round_up: bool) -> Result<i32> {
        match self {
            IntOrString::Int(i) => Ok(*i),
            IntOrString::Str(s) => {
                let v = s
                    .strip_suffix('%')
                    .and_then(|p| p.parse::<i64>().ok())
                    .ok_or_else(|| Error::InvalidIntOrPercent(s.clone()))?;
                let scaled = v * i64::from(total);
                let value = if round_up {
                    (scaled + 99).div_euclid(100)
                } else {
                    scaled.div_euclid(100)
                };
                Ok(value as i32)
            }
        }
    }
}

impl From<i32> for IntOrString {
    fn from(value: i32) -> Self {
        IntOrString::Int(value)
    }
}

impl From<&str> for IntOrString {
    fn from(value: &str) -> Self {
        IntOrString::Str(value.to_owned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Time(#[serde(with = "time::serde::rfc3339")] pub time::OffsetDateTime);

impl Time {
    pub fn now() -> Self {
        Time(crate::utils::now())
    }
}

pub struct GroupVersionKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
}

impl GroupVersionKind {
    pub fn api_version(&self) -> String {
        match (self.group, self.version) {
            ("", version) => version.to_owned(),
            (group, version) => {
                format!("{}/{}", group, version)
            }
        }
    }
}

impl Display for GroupVersionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}
