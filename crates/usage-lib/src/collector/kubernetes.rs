//! kube-rs backed cluster access
//!
//! Builds a client from the cluster's stored endpoint and bearer token, lists
//! pods through the core API and reads `metrics.k8s.io/v1beta1` pod metrics.

use super::{ClusterConnector, ClusterHandle};
use crate::models::{Cluster, ContainerUsage, PodMetricsEntry, PodRef};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, ObjectMeta},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Resource usage of one container as reported by metrics-server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub name: String,
    pub usage: Usage,
}

/// `metrics.k8s.io/v1beta1` PodMetrics object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodMetrics {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub containers: Vec<ContainerMetrics>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub window: String,
}

// The metrics API is not part of k8s-openapi, so describe it by hand
impl k8s_openapi::Resource for PodMetrics {
    const API_VERSION: &'static str = "metrics.k8s.io/v1beta1";
    const GROUP: &'static str = "metrics.k8s.io";
    const KIND: &'static str = "PodMetrics";
    const VERSION: &'static str = "v1beta1";
    const URL_PATH_SEGMENT: &'static str = "pods";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for PodMetrics {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}

impl From<PodMetrics> for PodMetricsEntry {
    fn from(metrics: PodMetrics) -> Self {
        Self {
            pod_name: metrics.metadata.name.unwrap_or_default(),
            containers: metrics
                .containers
                .into_iter()
                .map(|c| ContainerUsage {
                    name: c.name,
                    cpu: c.usage.cpu,
                    memory: c.usage.memory,
                })
                .collect(),
        }
    }
}

/// Client settings shared by every cluster connection
#[derive(Debug, Clone)]
pub struct KubeConnectorConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Skip server certificate verification for clusters without a CA path
    pub skip_tls_verify: bool,
}

impl Default for KubeConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            skip_tls_verify: false,
        }
    }
}

/// Connects to clusters using their registered endpoint and token
#[derive(Debug, Clone, Default)]
pub struct KubeConnector {
    config: KubeConnectorConfig,
}

impl KubeConnector {
    pub fn new(config: KubeConnectorConfig) -> Self {
        Self { config }
    }

    /// Build an in-memory kubeconfig with a single context for `cluster`
    fn kubeconfig_for(&self, cluster: &Cluster) -> Result<Kubeconfig> {
        let server = server_url(&cluster.domain_url)?;
        let name = format!("cluster-{}", cluster.id);

        let mut cluster_entry = serde_json::json!({ "server": server });
        match &cluster.cert_path {
            Some(path) => cluster_entry["certificate-authority"] = path.clone().into(),
            None if self.config.skip_tls_verify => {
                cluster_entry["insecure-skip-tls-verify"] = true.into()
            }
            None => {}
        }

        let document = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": name, "cluster": cluster_entry }],
            "users": [{ "name": name, "user": { "token": cluster.secret_token } }],
            "contexts": [{ "name": name, "context": { "cluster": name, "user": name } }],
            "current-context": name,
        });

        serde_json::from_value(document).context("Failed to build kubeconfig")
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterHandle>> {
        let kubeconfig = self.kubeconfig_for(cluster)?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("Invalid connection settings for cluster {}", cluster.id))?;
        config.connect_timeout = Some(self.config.connect_timeout);
        config.read_timeout = Some(self.config.read_timeout);

        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        debug!(cluster_id = cluster.id, "Created Kubernetes client");

        Ok(Arc::new(KubeHandle { client }))
    }
}

/// Live handle to a cluster's API server
pub struct KubeHandle {
    client: Client,
}

#[async_trait]
impl ClusterHandle for KubeHandle {
    async fn list_pods(&self) -> Result<Vec<PodRef>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default())
            .await
            .context("Failed to list pods")?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| {
                let name = pod.metadata.name?;
                let namespace = pod.metadata.namespace.unwrap_or_else(|| "default".to_string());
                Some(PodRef { name, namespace })
            })
            .collect())
    }

    async fn namespace_metrics(&self, namespace: &str) -> Result<Vec<PodMetricsEntry>> {
        let metrics: Api<PodMetrics> = Api::namespaced(self.client.clone(), namespace);
        let list = metrics
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to read pod metrics in {namespace}"))?;

        Ok(list.items.into_iter().map(PodMetricsEntry::from).collect())
    }
}

/// Turn a stored `host[:port]` into an https server URL
fn server_url(domain_url: &str) -> Result<String> {
    let trimmed = domain_url.trim().trim_end_matches('/');
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let url = url::Url::parse(&candidate)
        .with_context(|| format!("Invalid cluster endpoint {domain_url:?}"))?;
    if url.host_str().is_none() {
        anyhow::bail!("Cluster endpoint {domain_url:?} has no host");
    }

    Ok(candidate)
}
