//! Resolve a scope into the set of live pod containers, and keep it current

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tracing::{debug, warn};

use kubestream_k8s::{PodDirectory, PodSelector, PodWatchEvent};
use kubestream_types::{PodIdentity, PodKey, PodRecord, Scope, SetType};

/// Change to the live set of a scope
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodSetChange {
    Added(PodIdentity),
    Removed(PodKey),
    /// An already-live container was reported live again
    Seen(PodIdentity),
}

/// Tracks which containers of a scope are live, turning watch events into changes
#[derive(Debug)]
pub struct PodSetTracker {
    scope: Scope,
    live: BTreeMap<PodKey, PodIdentity>,
}

impl PodSetTracker {
    /// Start from an already-known set of containers
    pub fn new(scope: Scope, known: Vec<PodIdentity>) -> Self {
        let live = known.into_iter().map(|id| (id.key(), id)).collect();
        Self { scope, live }
    }

    /// Whether a pod belongs to the scope (regardless of phase)
    pub fn in_scope(&self, pod: &PodRecord) -> bool {
        match &self.scope {
            Scope::Container { namespace, pod: name, .. } | Scope::Pod { namespace, pod: name } => {
                pod.namespace == *namespace && pod.name == *name
            }
            Scope::Workload {
                namespace,
                set,
                set_type,
            } => pod.namespace == *namespace && pod.owned_by(set, *set_type),
            Scope::Namespace { namespace } => pod.namespace == *namespace,
            Scope::Cluster => true,
        }
    }

    /// Containers of a pod that should be tailed right now
    fn wanted(&self, pod: &PodRecord) -> Vec<PodIdentity> {
        if !self.in_scope(pod) || !pod.is_live() {
            return Vec::new();
        }
        let identities = pod.identities();
        match &self.scope {
            Scope::Container { container, .. } => identities
                .into_iter()
                .filter(|id| id.container_name == *container)
                .collect(),
            _ => identities,
        }
    }

    /// Apply one watch event and report what changed
    ///
    /// An applied pod also reports its already-live containers as `Seen`,
    /// so a consumer can restart a tail that stopped on its own.
    pub fn apply(&mut self, event: PodWatchEvent) -> Vec<PodSetChange> {
        match event {
            PodWatchEvent::Applied(pod) => {
                let wanted = self.wanted(&pod);
                let current: Vec<PodKey> = self.keys_of(&pod.namespace, &pod.name);
                let mut changes = Vec::new();

                for key in current {
                    if !wanted.iter().any(|id| id.key() == key) {
                        self.live.remove(&key);
                        changes.push(PodSetChange::Removed(key));
                    }
                }
                for id in wanted {
                    match self.insert(id.clone()) {
                        Some(added) => changes.push(added),
                        None => changes.push(PodSetChange::Seen(id)),
                    }
                }
                changes
            }
            PodWatchEvent::Deleted(pod) => self
                .keys_of(&pod.namespace, &pod.name)
                .into_iter()
                .map(|key| {
                    self.live.remove(&key);
                    PodSetChange::Removed(key)
                })
                .collect(),
            PodWatchEvent::Restarted(pods) => {
                let wanted: BTreeMap<PodKey, PodIdentity> = pods
                    .iter()
                    .flat_map(|pod| self.wanted(pod))
                    .map(|id| (id.key(), id))
                    .collect();

                let gone: Vec<PodKey> = self
                    .live
                    .keys()
                    .filter(|key| !wanted.contains_key(*key))
                    .cloned()
                    .collect();

                let mut changes = Vec::new();
                for key in gone {
                    self.live.remove(&key);
                    changes.push(PodSetChange::Removed(key));
                }
                for id in wanted.into_values() {
                    changes.extend(self.insert(id));
                }
                changes
            }
        }
    }

    pub fn live(&self) -> impl Iterator<Item = &PodIdentity> {
        self.live.values()
    }

    fn insert(&mut self, id: PodIdentity) -> Option<PodSetChange> {
        let key = id.key();
        if self.live.contains_key(&key) {
            return None;
        }
        self.live.insert(key, id.clone());
        Some(PodSetChange::Added(id))
    }

    fn keys_of(&self, namespace: &str, pod: &str) -> Vec<PodKey> {
        self.live
            .keys()
            .filter(|k| k.namespace == namespace && k.pod == pod)
            .cloned()
            .collect()
    }
}

/// Maps a scope to pod containers through the pod directory
pub struct PodSetResolver {
    directory: Arc<dyn PodDirectory>,
    scope: Scope,
    /// The scope with a workload's set type filled in once it is known
    tracked: Scope,
    selector: Option<PodSelector>,
}

impl PodSetResolver {
    pub fn new(directory: Arc<dyn PodDirectory>, scope: Scope) -> Self {
        Self {
            directory,
            tracked: scope.clone(),
            scope,
            selector: None,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Selector narrowing list/watch calls to the scope
    ///
    /// Workloads use the set's label selector when it can be read; otherwise
    /// the whole namespace is watched and owner references do the filtering.
    /// A workload of unknown type takes the type of the first set found.
    async fn selector(&mut self) -> PodSelector {
        if let Some(selector) = &self.selector {
            return selector.clone();
        }

        let selector = match &self.scope {
            Scope::Container { namespace, pod, .. } | Scope::Pod { namespace, pod } => {
                PodSelector::pod(namespace, pod)
            }
            Scope::Workload {
                namespace,
                set,
                set_type,
            } => {
                let candidates = match set_type {
                    Some(t) => vec![*t],
                    None => vec![
                        SetType::Replica,
                        SetType::Stateful,
                        SetType::Daemon,
                        SetType::Deployment,
                    ],
                };
                let mut labels = None;
                for candidate in candidates {
                    match self.directory.set_selector(namespace, set, candidate).await {
                        Ok(Some(found)) => {
                            labels = Some(found);
                            self.tracked = Scope::Workload {
                                namespace: namespace.clone(),
                                set: set.clone(),
                                set_type: Some(candidate),
                            };
                            break;
                        }
                        Ok(None) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            warn!(set = %set, error = %e, "Failed to read set selector");
                        }
                    }
                }
                debug!(set = %set, labels = ?labels, "Resolved set selector");
                PodSelector::namespace(namespace).with_labels(labels)
            }
            Scope::Namespace { namespace } => PodSelector::namespace(namespace),
            Scope::Cluster => PodSelector::all(),
        };

        self.selector = Some(selector.clone());
        selector
    }

    /// Current live containers of the scope; empty if the directory fails
    pub async fn snapshot(&mut self) -> Vec<PodIdentity> {
        let selector = self.selector().await;
        match self.directory.list_pods(&selector).await {
            Ok(pods) => {
                let mut tracker = PodSetTracker::new(self.tracked.clone(), Vec::new());
                tracker.apply(PodWatchEvent::Restarted(pods));
                tracker.live().cloned().collect()
            }
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "Failed to list pods");
                Vec::new()
            }
        }
    }

    /// Changes to the live set relative to `known`
    ///
    /// The stream ends only if the directory's watch ends; dropping it
    /// releases the watch.
    pub async fn subscribe(&mut self, known: Vec<PodIdentity>) -> BoxStream<'static, PodSetChange> {
        let selector = self.selector().await;
        let mut tracker = PodSetTracker::new(self.tracked.clone(), known);

        self.directory
            .watch_pods(&selector)
            .map(move |event| {
                let changes = match event {
                    Ok(event) => tracker.apply(event),
                    Err(e) => {
                        warn!(error = %e, "Pod watch error");
                        Vec::new()
                    }
                };
                stream::iter(changes)
            })
            .flatten()
            .boxed()
    }
}
