//! Label selector helpers and workload selector lookup

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Api, Client};

use kubestream_types::SetType;

use crate::K8sError;

trait HasSelector {
    fn get_selector(&self) -> Option<&LabelSelector>;
}

impl HasSelector for ReplicaSet {
    fn get_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }
}

impl HasSelector for StatefulSet {
    fn get_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }
}

impl HasSelector for DaemonSet {
    fn get_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }
}

impl HasSelector for Deployment {
    fn get_selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }
}

/// Convert a LabelSelector's match_labels to a list selector string
pub(crate) fn selector_to_labels_string(selector: &LabelSelector) -> Option<String> {
    let labels = selector.match_labels.as_ref()?;
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","),
    )
}

async fn selector_for<T>(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<String>, K8sError>
where
    T: k8s_openapi::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + k8s_openapi::Metadata<Ty = ObjectMeta>
        + HasSelector
        + serde::de::DeserializeOwned
        + Clone
        + Debug,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    match api.get_opt(name).await? {
        Some(set) => Ok(set.get_selector().and_then(selector_to_labels_string)),
        None => Err(K8sError::NotFound(format!("{} {}/{}", T::KIND, namespace, name))),
    }
}

/// Read the label selector of a set or deployment
pub(crate) async fn workload_selector(
    client: &Client,
    namespace: &str,
    name: &str,
    set_type: SetType,
) -> Result<Option<String>, K8sError> {
    match set_type {
        SetType::Replica => selector_for::<ReplicaSet>(client, namespace, name).await,
        SetType::Stateful => selector_for::<StatefulSet>(client, namespace, name).await,
        SetType::Daemon => selector_for::<DaemonSet>(client, namespace, name).await,
        SetType::Deployment => selector_for::<Deployment>(client, namespace, name).await,
    }
}
