//! Pod usage collection from remote clusters
//!
//! This module hides the Kubernetes client behind two seams: a
//! [`ClusterConnector`] that turns a registered cluster into an authenticated
//! [`ClusterHandle`], and the handle itself, which lists pods and reads
//! namespace metrics. [`MetricsCollector`] drives both for one cluster and
//! isolates pod-level failures.

mod kubernetes;
mod quantity;


pub use kubernetes::{KubeConnector, KubeConnectorConfig, PodMetrics};
pub use quantity::{parse_cpu_cores, parse_memory_bytes};

use crate::error::CollectError;
use crate::models::{Cluster, PodMetricsEntry, PodRef, PodSample, TickTime, UsageSample};
use anyhow::Result;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

pub use async_trait::async_trait;

/// Produces an authenticated handle for a registered cluster
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterHandle>>;
}

/// Access to one cluster's API server and metrics endpoint
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    /// List every pod across all namespaces
    async fn list_pods(&self) -> Result<Vec<PodRef>>;

    /// Latest metrics for the pods of one namespace, in backend order
    async fn namespace_metrics(&self, namespace: &str) -> Result<Vec<PodMetricsEntry>>;
}

/// Result of collecting one cluster within a tick
#[derive(Debug, Default)]
pub struct ClusterCollection {
    pub samples: Vec<PodSample>,
    pub skipped: Vec<CollectError>,
}

impl ClusterCollection {
    /// Number of pods listed by the cluster
    pub fn pods_seen(&self) -> usize {
        self.samples.len() + self.skipped.len()
    }
}

/// Collects the latest usage sample of every pod in a cluster
pub struct MetricsCollector {
    connector: Arc<dyn ClusterConnector>,
}

impl MetricsCollector {
    pub fn new(connector: Arc<dyn ClusterConnector>) -> Self {
        Self { connector }
    }

    /// Fetch a sample for each pod of `cluster`.
    ///
    /// Only connection and pod-listing failures are returned as errors; a pod
    /// whose metrics cannot be read is recorded in `skipped` and the rest of
    /// the cluster continues.
    pub async fn fetch(
        &self,
        cluster: &Cluster,
        tick: &TickTime,
    ) -> Result<ClusterCollection, CollectError> {
        let handle = self
            .connector
            .connect(cluster)
            .await
            .map_err(|e| CollectError::unreachable(cluster.id, format!("{e:#}")))?;

        let pods = handle
            .list_pods()
            .await
            .map_err(|e| CollectError::unreachable(cluster.id, format!("{e:#}")))?;

        debug!(cluster_id = cluster.id, pods = pods.len(), "Listed pods");

        // One metrics request per namespace, shared by all of its pods
        let mut listings: HashMap<String, Result<Vec<PodMetricsEntry>, String>> = HashMap::new();
        let mut collection = ClusterCollection::default();

        for pod in pods {
            if !listings.contains_key(&pod.namespace) {
                let listing = namespace_listing(&handle, &pod.namespace).await;
                listings.insert(pod.namespace.clone(), listing);
            }

            let outcome = match &listings[&pod.namespace] {
                Ok(entries) => {
                    catch_unwind(AssertUnwindSafe(|| sample_pod(entries, &pod, tick)))
                        .unwrap_or_else(|panic| {
                            Err(CollectError::MetricsUnavailable {
                                namespace: pod.namespace.clone(),
                                pod: pod.name.clone(),
                                reason: format!(
                                    "sample handling panicked: {}",
                                    panic_message(&*panic)
                                ),
                            })
                        })
                }
                Err(reason) => Err(CollectError::MetricsUnavailable {
                    namespace: pod.namespace.clone(),
                    pod: pod.name.clone(),
                    reason: reason.clone(),
                }),
            };

            match outcome {
                Ok(usage) => collection.samples.push(PodSample { pod, usage }),
                Err(e) => {
                    debug!(cluster_id = cluster.id, error = %e, "Skipping pod");
                    collection.skipped.push(e);
                }
            }
        }

        Ok(collection)
    }
}

/// Read one namespace's metrics on its own task, so a panic inside the
/// client only costs that namespace's pods
async fn namespace_listing(
    handle: &Arc<dyn ClusterHandle>,
    namespace: &str,
) -> Result<Vec<PodMetricsEntry>, String> {
    let handle = handle.clone();
    let owned = namespace.to_string();
    let task = tokio::spawn(async move { handle.namespace_metrics(&owned).await });

    match task.await {
        Ok(listing) => listing.map_err(|e| format!("{e:#}")),
        Err(e) if e.is_panic() => Err(format!(
            "metrics lookup panicked: {}",
            panic_message(&*e.into_panic())
        )),
        Err(e) => Err(format!("metrics lookup aborted: {e}")),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Build a pod's sample from the first matching metrics entry
fn sample_pod(
    entries: &[PodMetricsEntry],
    pod: &PodRef,
    tick: &TickTime,
) -> Result<UsageSample, CollectError> {
    let entry = entries
        .iter()
        .find(|e| e.pod_name == pod.name)
        .ok_or_else(|| CollectError::MetricsUnavailable {
            namespace: pod.namespace.clone(),
            pod: pod.name.clone(),
            reason: "no sample reported yet".to_string(),
        })?;

    let malformed = |source| CollectError::MalformedSample {
        namespace: pod.namespace.clone(),
        pod: pod.name.clone(),
        source,
    };

    let mut cpu_cores = 0.0;
    let mut memory_bytes = 0u64;
    for container in &entry.containers {
        cpu_cores += parse_cpu_cores(&container.cpu).map_err(malformed)?;
        memory_bytes =
            memory_bytes.saturating_add(parse_memory_bytes(&container.memory).map_err(malformed)?);
    }

    Ok(UsageSample::new(cpu_cores, memory_bytes, tick))
}
