use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};

/// Kubeconfig wrapper used to build API clients
pub struct KubeClient {
    kubeconfig: Kubeconfig,
}

impl KubeClient {
    /// Create a new KubeClient by loading the kubeconfig
    pub fn new() -> Result<Self> {
        let kubeconfig =
            Kubeconfig::read().context("Failed to read kubeconfig. Is kubectl configured?")?;

        Ok(Self { kubeconfig })
    }

    /// Create a kube::Client for a specific context
    pub async fn client_for_context(&self, context_name: &str) -> Result<kube::Client> {
        if !self.kubeconfig.contexts.iter().any(|c| c.name == context_name) {
            anyhow::bail!("Context '{}' not found in kubeconfig", context_name);
        }

        let config = kube::Config::from_custom_kubeconfig(
            self.kubeconfig.clone(),
            &KubeConfigOptions {
                context: Some(context_name.to_string()),
                ..Default::default()
            },
        )
        .await
        .context(format!(
            "Failed to create config for context: {}",
            context_name
        ))?;

        kube::Client::try_from(config).context(format!(
            "Failed to create client for context: {}",
            context_name
        ))
    }

    /// Client for the named context, or for the ambient configuration
    /// (current context, or in-cluster service account) when none is given
    pub async fn connect(context: Option<&str>) -> Result<kube::Client> {
        match context {
            Some(name) => Self::new()?.client_for_context(name).await,
            None => {
                let config = kube::Config::infer()
                    .await
                    .context("Failed to infer Kubernetes configuration")?;
                kube::Client::try_from(config).context("Failed to create Kubernetes client")
            }
        }
    }
}
