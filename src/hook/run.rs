use std::collections::BTreeMap;

use crate::cluster::{ClientError, ObjectStore};
use crate::controller::util::new_controller_ref;
use crate::resources::{
    GameDeployment, HookArgument, HookRun, HookRunSpec, HookStep, Metadata, Time,
};
use crate::{Error, Result};

// Arguments injected for lifecycle hooks.
pub const ARG_POD_NAME: &str = "PodName";
pub const ARG_POD_NAMESPACE: &str = "PodNamespace";
pub const ARG_POD_IP: &str = "PodIP";
pub const ARG_HOST_IP: &str = "HostIP";
pub const ARG_POD_INSTANCE_ID: &str = "PodInstanceID";
pub const ARG_DELETION_TIME: &str = "DeletionTime";

pub fn arg(name: &str, value: impl Into<String>) -> HookArgument {
    HookArgument {
        name: name.to_owned(),
        value: Some(value.into()),
    }
}

/// `DeletionTime` set to now, in rfc3339.
pub fn deletion_time_arg() -> HookArgument {
    let now = Time::now()
        .0
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    arg(ARG_DELETION_TIME, now)
}

// Later arguments override earlier ones of the same name, order of first appearance is kept.
fn merge_args(layers: &[&[HookArgument]]) -> Result<Vec<HookArgument>> {
    let mut merged: Vec<HookArgument> = Vec::new();
    for layer in layers {
        for a in layer.iter() {
            match merged.iter_mut().find(|m| m.name == a.name) {
                Some(m) => {
                    if a.value.is_some() {
                        m.value = a.value.clone();
                    }
                }
                None => merged.push(a.clone()),
            }
        }
    }
    if let Some(missing) = merged.iter().find(|a| a.value.is_none()) {
        return Err(Error::UnresolvedHookArgument(missing.name.clone()));
    }
    Ok(merged)
}

/// Build a HookRun for `hook` from its template, owned by `deploy`.
pub fn new_hook_run(
    store: &dyn ObjectStore,
    deploy: &GameDeployment,
    hook: &HookStep,
    name: String,
    labels: BTreeMap<String, String>,
    injected: &[HookArgument],
) -> Result<HookRun> {
    let namespace = &deploy.metadata.namespace;
    let template = store
        .hook_template(namespace, &hook.template_name)
        .ok_or_else(|| ClientError::NotFound {
            kind: "HookTemplate",
            name: format!("{}/{}", namespace, hook.template_name),
        })?;
    let args = merge_args(&[&template.spec.args, &hook.args, injected])?;
    Ok(HookRun {
        metadata: Metadata {
            name,
            namespace: namespace.clone(),
            labels,
            owner_references: vec![new_controller_ref(&deploy.metadata, &GameDeployment::GVK)],
            ..Default::default()
        },
        spec: HookRunSpec {
            metrics: template.spec.metrics,
            args,
            terminate: false,
        },
        status: Default::default(),
    })
}
