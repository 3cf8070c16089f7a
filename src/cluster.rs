//! Kubeconfig loading for promwatch

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::info;

/// Build a client for `context`, or for the inferred environment (current
/// kubeconfig context, or the in-cluster service account) when unset
pub async fn connect(context: Option<&str>) -> Result<kube::Client> {
    let config = match context {
        Some(context_name) => {
            let kubeconfig =
                Kubeconfig::read().context("Failed to read kubeconfig. Is kubectl configured?")?;

            if !kubeconfig.contexts.iter().any(|c| c.name == context_name) {
                anyhow::bail!("Context '{}' not found in kubeconfig", context_name);
            }

            kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &KubeConfigOptions {
                    context: Some(context_name.to_string()),
                    ..Default::default()
                },
            )
            .await
            .context(format!(
                "Failed to create config for context: {}",
                context_name
            ))?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer cluster config. Is kubectl configured?")?,
    };

    info!(cluster = %config.cluster_url, "connecting");

    kube::Client::try_from(config).context("Failed to create Kubernetes client")
}
