use thiserror::Error;

/// Errors raised while talking to the cluster
#[derive(Debug, Error)]
pub enum K8sError {
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("Pod watch error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} not found")]
    NotFound(String),
}

impl K8sError {
    /// The addressed object does not exist (retrying will not help)
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Api(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}
