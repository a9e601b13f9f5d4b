use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::resources::Pod;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScaleAction {
    Create,
    Delete,
}

#[derive(Debug, Default)]
struct ScaleEntry {
    objects: BTreeMap<ScaleAction, BTreeSet<String>>,
    first_unsatisfied: Option<Instant>,
}

impl ScaleEntry {
    fn is_empty(&self) -> bool {
        self.objects.values().all(BTreeSet::is_empty)
    }
}

/// Tracks pod creations and deletions that were issued but not yet observed in the cache.
#[derive(Debug, Default)]
pub struct ScaleExpectations {
    controllers: Mutex<BTreeMap<String, ScaleEntry>>,
}

impl ScaleExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ScaleEntry>> {
        self.controllers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn expect_scale(&self, key: &str, action: ScaleAction, name: &str) {
        debug!(key, ?action, name, "Expecting scale");
        let mut controllers = self.lock();
        let entry = controllers.entry(key.to_owned()).or_default();
        if entry.is_empty() {
            entry.first_unsatisfied = Some(Instant::now());
        }
        entry
            .objects
            .entry(action)
            .or_default()
            .insert(name.to_owned());
    }

    pub fn observe_scale(&self, key: &str, action: ScaleAction, name: &str) {
        let mut controllers = self.lock();
        let Some(entry) = controllers.get_mut(key) else {
            return;
        };
        if let Some(names) = entry.objects.get_mut(&action) {
            if names.remove(name) {
                debug!(key, ?action, name, "Observed scale");
            }
        }
        if entry.is_empty() {
            controllers.remove(key);
        }
    }

    /// Whether every expected scale action for the key has been observed. When not, also returns how
    /// long ago the first outstanding action was expected and the names still outstanding.
    pub fn satisfied_expectations(
        &self,
        key: &str,
    ) -> (bool, Duration, BTreeMap<ScaleAction, Vec<String>>) {
        let mut controllers = self.lock();
        let Some(entry) = controllers.get_mut(key) else {
            return (true, Duration::ZERO, BTreeMap::new());
        };
        if entry.is_empty() {
            controllers.remove(key);
            return (true, Duration::ZERO, BTreeMap::new());
        }
        let since = *entry.first_unsatisfied.get_or_insert_with(Instant::now);
        let dirty = entry
            .objects
            .iter()
            .filter(|(_, names)| !names.is_empty())
            .map(|(action, names)| (*action, names.iter().cloned().collect()))
            .collect();
        (false, since.elapsed(), dirty)
    }

    pub fn get_expectations(&self, key: &str) -> BTreeMap<ScaleAction, BTreeSet<String>> {
        self.lock()
            .get(key)
            .map(|e| e.objects.clone())
            .unwrap_or_default()
    }

    pub fn delete_expectations(&self, key: &str) {
        self.lock().remove(key);
    }
}

#[derive(Debug)]
struct UpdateEntry {
    revision: String,
    pods: BTreeSet<String>,
    first_unsatisfied: Option<Instant>,
}

/// Tracks pods that were updated to a revision but whose new revision is not yet visible in the
/// cache.
#[derive(Debug, Default)]
pub struct UpdateExpectations {
    controllers: Mutex<BTreeMap<String, UpdateEntry>>,
}

impl UpdateExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, UpdateEntry>> {
        self.controllers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn expect_updated(&self, key: &str, revision: &str, pod: &Pod) {
        let mut controllers = self.lock();
        let entry = controllers
            .entry(key.to_owned())
            .or_insert_with(|| UpdateEntry {
                revision: revision.to_owned(),
                pods: BTreeSet::new(),
                first_unsatisfied: None,
            });
        // expectations for an older revision are superseded
        if entry.revision != revision {
            entry.revision = revision.to_owned();
            entry.pods.clear();
            entry.first_unsatisfied = None;
        }
        if entry.pods.is_empty() {
            entry.first_unsatisfied = Some(Instant::now());
        }
        debug!(key, revision, pod = pod.metadata.name, "Expecting update");
        entry.pods.insert(pod.metadata.name.clone());
    }

    pub fn observe_updated(&self, key: &str, revision: &str, pod: &Pod) {
        let mut controllers = self.lock();
        let Some(entry) = controllers.get_mut(key) else {
            return;
        };
        if entry.revision == revision && pod.revision() == Some(revision) {
            entry.pods.remove(&pod.metadata.name);
        }
        if entry.pods.is_empty() {
            controllers.remove(key);
        }
    }

    /// Observe a pod against whatever revision is expected for the key.
    pub fn observe_pod(&self, key: &str, pod: &Pod) {
        let revision = self.lock().get(key).map(|e| e.revision.clone());
        if let Some(revision) = revision {
            self.observe_updated(key, &revision, pod);
        }
    }

    pub fn satisfied_expectations(&self, key: &str, revision: &str) -> (bool, Duration, Vec<String>) {
        let mut controllers = self.lock();
        let Some(entry) = controllers.get_mut(key) else {
            return (true, Duration::ZERO, Vec::new());
        };
        if entry.revision != revision || entry.pods.is_empty() {
            controllers.remove(key);
            return (true, Duration::ZERO, Vec::new());
        }
        let since = *entry.first_unsatisfied.get_or_insert_with(Instant::now);
        (false, since.elapsed(), entry.pods.iter().cloned().collect())
    }

    pub fn delete_expectations(&self, key: &str) {
        self.lock().remove(key);
    }
}
