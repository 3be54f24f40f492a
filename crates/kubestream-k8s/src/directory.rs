use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event, watcher};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use kubestream_types::{OwnerRef, PodRecord, PodStatus, SetType};

use crate::K8sError;
use crate::selector::workload_selector;

/// Which pods to list or watch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodSelector {
    /// Namespace to search (None = all namespaces)
    pub namespace: Option<String>,
    /// Label selector string, e.g. "app=web,tier=api"
    pub labels: Option<String>,
    /// Field selector string, e.g. "metadata.name=web-0"
    pub fields: Option<String>,
}

impl PodSelector {
    /// Every pod in the cluster
    pub fn all() -> Self {
        Self::default()
    }

    /// Every pod in one namespace
    pub fn namespace(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..Self::default()
        }
    }

    /// Exactly one named pod
    pub fn pod(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            labels: None,
            fields: Some(format!("metadata.name={}", name)),
        }
    }

    pub fn with_labels(mut self, labels: Option<String>) -> Self {
        self.labels = labels;
        self
    }

    fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = &self.labels {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.fields {
            params = params.fields(fields);
        }
        params
    }

    fn watcher_config(&self) -> watcher::Config {
        let mut config = watcher::Config::default();
        if let Some(labels) = &self.labels {
            config = config.labels(labels);
        }
        if let Some(fields) = &self.fields {
            config = config.fields(fields);
        }
        config
    }
}

/// Change reported by a pod watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodWatchEvent {
    /// A pod was created or modified
    Applied(PodRecord),
    /// A pod was deleted
    Deleted(PodRecord),
    /// The watch (re)listed; this is the complete current set
    Restarted(Vec<PodRecord>),
}

/// Pod directory service: list/watch pods and read workload selectors
pub trait PodDirectory: Send + Sync {
    fn list_pods(
        &self,
        selector: &PodSelector,
    ) -> BoxFuture<'static, Result<Vec<PodRecord>, K8sError>>;

    /// Long-lived watch; ends only when dropped or when the directory gives up
    fn watch_pods(
        &self,
        selector: &PodSelector,
    ) -> BoxStream<'static, Result<PodWatchEvent, K8sError>>;

    /// Label selector of a set, if it has a plain match_labels selector
    fn set_selector(
        &self,
        namespace: &str,
        set: &str,
        set_type: SetType,
    ) -> BoxFuture<'static, Result<Option<String>, K8sError>>;
}

/// Pod directory backed by the Kubernetes API
#[derive(Clone)]
pub struct KubePodDirectory {
    client: Client,
}

impl KubePodDirectory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

impl PodDirectory for KubePodDirectory {
    fn list_pods(
        &self,
        selector: &PodSelector,
    ) -> BoxFuture<'static, Result<Vec<PodRecord>, K8sError>> {
        let api = self.api(selector.namespace.as_deref());
        let params = selector.list_params();

        let selector = selector.clone();

        async move {
            let list = api.list(&params).await?;
            debug!(?selector, pods = list.items.len(), "Listed pods");
            Ok(list.items.into_iter().map(pod_to_record).collect())
        }
        .boxed()
    }

    fn watch_pods(
        &self,
        selector: &PodSelector,
    ) -> BoxStream<'static, Result<PodWatchEvent, K8sError>> {
        let api = self.api(selector.namespace.as_deref());
        let mut initial: Vec<PodRecord> = Vec::new();

        watcher(api, selector.watcher_config())
            .default_backoff()
            .filter_map(move |event| {
                let out = match event {
                    Ok(Event::Init) => {
                        initial.clear();
                        None
                    }
                    Ok(Event::InitApply(pod)) => {
                        initial.push(pod_to_record(pod));
                        None
                    }
                    Ok(Event::InitDone) => {
                        debug!(pods = initial.len(), "Pod watch (re)started");
                        Some(Ok(PodWatchEvent::Restarted(std::mem::take(&mut initial))))
                    }
                    Ok(Event::Apply(pod)) => Some(Ok(PodWatchEvent::Applied(pod_to_record(pod)))),
                    Ok(Event::Delete(pod)) => Some(Ok(PodWatchEvent::Deleted(pod_to_record(pod)))),
                    Err(e) => {
                        debug!(error = %e, "Pod watch error; the watcher backs off and retries");
                        Some(Err(K8sError::from(e)))
                    }
                };
                future::ready(out)
            })
            .boxed()
    }

    fn set_selector(
        &self,
        namespace: &str,
        set: &str,
        set_type: SetType,
    ) -> BoxFuture<'static, Result<Option<String>, K8sError>> {
        let client = self.client.clone();
        let namespace = namespace.to_string();
        let set = set.to_string();

        async move { workload_selector(&client, &namespace, &set, set_type).await }.boxed()
    }
}

/// Convert a k8s Pod to a PodRecord
fn pod_to_record(pod: Pod) -> PodRecord {
    let mut record = PodRecord::new(&pod.namespace().unwrap_or_default(), &pod.name_any());

    record.deleting = pod.metadata.deletion_timestamp.is_some();

    if let Some(owners) = pod.metadata.owner_references {
        record.owners = owners
            .into_iter()
            .map(|o| OwnerRef {
                kind: o.kind,
                name: o.name,
            })
            .collect();
    }

    if let Some(spec) = pod.spec {
        record.containers = spec.containers.into_iter().map(|c| c.name).collect();
    }

    record.status = pod
        .status
        .and_then(|s| s.phase)
        .as_deref()
        .map(PodStatus::from)
        .unwrap_or(PodStatus::Unknown);

    record
}
