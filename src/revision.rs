use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cluster::ObjectClient;
use crate::controller::util::new_controller_ref;
use crate::hasher::hash_with_collision_count;
use crate::resources::{
    ControllerRevision, GameDeployment, Metadata, Pod, CONTROLLER_REVISION_HASH_LABEL,
};
use crate::utils::merge_patch;
use crate::{Error, Result};

pub const DEFAULT_REVISION_HISTORY_LIMIT: i32 = 10;

// Kubernetes names are limited to 253 characters, leave room for the hash suffix.
const MAX_PREFIX_LEN: usize = 223;

// getPatch returns a patch that reconstructs the pod template of the deployment. Only the template
// is recorded so unrelated changes to the deployment do not produce new revisions.
pub fn get_patch(deploy: &GameDeployment) -> Result<Value> {
    let mut template = serde_json::to_value(&deploy.spec.template)?;
    if let Value::Object(t) = &mut template {
        t.insert("$patch".to_owned(), Value::String("replace".to_owned()));
    }
    Ok(json!({ "spec": { "template": template } }))
}

pub fn controller_revision_name(prefix: &str, hash: &str) -> String {
    let prefix = if prefix.len() > MAX_PREFIX_LEN {
        &prefix[..MAX_PREFIX_LEN]
    } else {
        prefix
    };
    format!("{}-{}", prefix, hash)
}

pub fn hash_revision(data: &Value, collision_count: i32) -> Result<String> {
    let raw = serde_json::to_vec(data)?;
    Ok(hash_with_collision_count(&raw, Some(collision_count)))
}

/// Build the revision snapshotting the current template of `deploy`.
pub fn new_revision(
    deploy: &GameDeployment,
    revision: i64,
    collision_count: i32,
) -> Result<ControllerRevision> {
    let data = get_patch(deploy)?;
    let hash = hash_revision(&data, collision_count)?;
    let mut labels = deploy.spec.template.metadata.labels.clone();
    labels.insert(CONTROLLER_REVISION_HASH_LABEL.to_owned(), hash.clone());
    Ok(ControllerRevision {
        metadata: Metadata {
            name: controller_revision_name(&deploy.metadata.name, &hash),
            namespace: deploy.metadata.namespace.clone(),
            labels,
            annotations: deploy.metadata.annotations.clone(),
            owner_references: vec![new_controller_ref(&deploy.metadata, &GameDeployment::GVK)],
            ..Default::default()
        },
        revision,
        data,
    })
}

/// Reconstruct the deployment as it was at `revision`.
pub fn apply_revision(
    deploy: &GameDeployment,
    revision: &ControllerRevision,
) -> Result<GameDeployment> {
    let mut value = serde_json::to_value(deploy)?;
    merge_patch(&mut value, &revision.data);
    serde_json::from_value(value)
        .map_err(|e| Error::Revision(revision.metadata.name.clone(), e.to_string()))
}

// Two revisions are equal when they patch the same content, regardless of their sequence number.
pub fn equal_revision(lhs: &ControllerRevision, rhs: &ControllerRevision) -> bool {
    lhs.data == rhs.data
}

pub fn find_equal_revisions<'a>(
    revisions: &'a [ControllerRevision],
    needle: &ControllerRevision,
) -> Vec<&'a ControllerRevision> {
    revisions
        .iter()
        .filter(|r| equal_revision(r, needle))
        .collect()
}

pub fn next_revision(revisions: &[ControllerRevision]) -> i64 {
    revisions.iter().map(|r| r.revision).max().unwrap_or(0) + 1
}

// Oldest first, by sequence number then creation time then name.
pub fn sort_revisions(revisions: &mut [ControllerRevision]) {
    revisions.sort_by(|a, b| {
        a.revision
            .cmp(&b.revision)
            .then_with(|| {
                a.metadata
                    .creation_timestamp
                    .cmp(&b.metadata.creation_timestamp)
            })
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

/// The revisions the deployment is rolling from and to.
#[derive(Clone, Debug)]
pub struct ActiveRevisions {
    pub current: ControllerRevision,
    pub update: ControllerRevision,
    pub collision_count: i32,
}

pub struct RevisionControl {
    client: Arc<dyn ObjectClient>,
}

impl RevisionControl {
    pub fn new(client: Arc<dyn ObjectClient>) -> Self {
        Self { client }
    }

    /// Compute the current and update revisions, persisting the update revision if it is new.
    ///
    /// `revisions` must be sorted oldest first.
    #[tracing::instrument(skip_all, fields(deploy = deploy.metadata.name))]
    pub async fn get_active_revisions(
        &self,
        deploy: &GameDeployment,
        revisions: &[ControllerRevision],
        pods: &[Pod],
    ) -> Result<ActiveRevisions> {
        let mut collision_count = deploy.status.collision_count.unwrap_or_default();

        let candidate = new_revision(deploy, next_revision(revisions), collision_count)?;

        let equal = find_equal_revisions(revisions, &candidate);
        let update = match (equal.last(), revisions.last()) {
            // the latest revision is already the one we want, nothing changed
            (Some(eq), Some(latest)) if equal_revision(eq, latest) => latest.clone(),
            // rolling back to an older revision, bump its sequence number to become the newest
            (Some(eq), _) => {
                info!(
                    revision = eq.metadata.name,
                    sequence = candidate.revision,
                    "Reusing equivalent revision"
                );
                let mut bumped = (*eq).clone();
                bumped.revision = candidate.revision;
                self.client.update_controller_revision(&bumped).await?
            }
            (None, _) => {
                self.create_revision(deploy, candidate, &mut collision_count)
                    .await?
            }
        };

        let current = current_revision(deploy, revisions, pods).unwrap_or_else(|| update.clone());

        Ok(ActiveRevisions {
            current,
            update,
            collision_count,
        })
    }

    // createControllerRevision creates the revision, retrying with a higher collision count while
    // a different revision already holds the name.
    async fn create_revision(
        &self,
        deploy: &GameDeployment,
        mut revision: ControllerRevision,
        collision_count: &mut i32,
    ) -> Result<ControllerRevision> {
        loop {
            let hash = hash_revision(&revision.data, *collision_count)?;
            revision.metadata.name = controller_revision_name(&deploy.metadata.name, &hash);
            revision
                .metadata
                .labels
                .insert(CONTROLLER_REVISION_HASH_LABEL.to_owned(), hash);
            match self.client.create_controller_revision(&revision).await {
                Ok(created) => {
                    debug!(revision = created.metadata.name, "Created revision");
                    return Ok(created);
                }
                Err(e) if e.is_already_exists() => {
                    let existing = self
                        .client
                        .get_controller_revision(
                            &revision.metadata.namespace,
                            &revision.metadata.name,
                        )
                        .await?;
                    if equal_revision(&existing, &revision) {
                        return Ok(existing);
                    }
                    *collision_count += 1;
                    info!(
                        name = revision.metadata.name,
                        collision_count, "Revision hash collision"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Delete old revisions beyond the history limit.
    ///
    /// The current and update revisions and those referenced by live pods are always kept. Of the
    /// rest, the newest `max(0, limit - live)` survive.
    #[tracing::instrument(skip_all, fields(deploy = deploy.metadata.name))]
    pub async fn truncate_history(
        &self,
        deploy: &GameDeployment,
        revisions: &[ControllerRevision],
        pods: &[Pod],
        current: &ControllerRevision,
        update: &ControllerRevision,
    ) -> Result<()> {
        let live = live_revision_names(revisions, pods, current, update);
        let limit = deploy
            .spec
            .revision_history_limit
            .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT);
        let keep = (limit - live.len() as i32).max(0) as usize;

        let history = revisions
            .iter()
            .filter(|r| !live.contains(r.metadata.name.as_str()))
            .collect::<Vec<_>>();
        if history.len() <= keep {
            return Ok(());
        }
        for revision in &history[..history.len() - keep] {
            debug!(revision = revision.metadata.name, "Deleting old revision");
            match self
                .client
                .delete_controller_revision(&revision.metadata.namespace, &revision.metadata.name)
                .await
            {
                Err(e) if !e.is_not_found() => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}

// Names of the revisions that must survive truncation and that exist in `revisions`.
fn live_revision_names<'a>(
    revisions: &'a [ControllerRevision],
    pods: &[Pod],
    current: &ControllerRevision,
    update: &ControllerRevision,
) -> BTreeSet<&'a str> {
    let mut referenced = BTreeSet::new();
    referenced.insert(current.metadata.name.as_str());
    referenced.insert(update.metadata.name.as_str());
    for pod in pods {
        if let Some(rev) = pod.revision() {
            referenced.insert(rev);
        }
    }
    revisions
        .iter()
        .map(|r| r.metadata.name.as_str())
        .filter(|name| referenced.contains(name))
        .collect()
}

/// The revision the deployment is rolling from: the recorded current revision if it still exists,
/// else the revision most pods run.
pub fn current_revision(
    deploy: &GameDeployment,
    revisions: &[ControllerRevision],
    pods: &[Pod],
) -> Option<ControllerRevision> {
    if let Some(r) = revisions
        .iter()
        .find(|r| r.metadata.name == deploy.status.current_revision)
    {
        return Some(r.clone());
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for pod in pods {
        if let Some(rev) = pod.revision() {
            *counts.entry(rev).or_default() += 1;
        }
    }
    // ties go to the newest revision
    revisions
        .iter()
        .enumerate()
        .filter_map(|(i, r)| {
            counts
                .get(r.metadata.name.as_str())
                .map(|count| ((*count, i), r))
        })
        .max_by_key(|(k, _)| *k)
        .map(|(_, r)| r.clone())
}
