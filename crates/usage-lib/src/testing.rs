//! In-memory fakes for the cluster seams, shared by unit tests

use crate::collector::{ClusterConnector, ClusterHandle};
use crate::models::{Cluster, ContainerUsage, PodMetricsEntry, PodRef, User};
use crate::registry::ClusterRegistry;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted contents of one cluster
#[derive(Default)]
pub struct FakeHandle {
    pub pods: Vec<PodRef>,
    pub metrics: HashMap<String, Vec<PodMetricsEntry>>,
    pub failing_namespaces: HashSet<String>,
    pub panicking_namespaces: HashSet<String>,
    pub fail_listing: bool,
    pub panic_on_listing: bool,
    pub listing_delay: Option<Duration>,
    pub metrics_calls: AtomicUsize,
}

impl FakeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pod with a single-container sample
    pub fn pod(mut self, namespace: &str, name: &str, cpu: &str, memory: &str) -> Self {
        self.pods.push(pod_ref(namespace, name));
        self.metrics
            .entry(namespace.to_string())
            .or_default()
            .push(entry(name, &[(cpu, memory)]));
        self
    }

    /// Add a pod that metrics-server has not reported yet
    pub fn pod_without_metrics(mut self, namespace: &str, name: &str) -> Self {
        self.pods.push(pod_ref(namespace, name));
        self.metrics.entry(namespace.to_string()).or_default();
        self
    }

    /// Append a raw metrics entry without registering a pod
    pub fn metrics_entry(mut self, namespace: &str, metrics: PodMetricsEntry) -> Self {
        self.metrics
            .entry(namespace.to_string())
            .or_default()
            .push(metrics);
        self
    }

    pub fn failing_namespace(mut self, namespace: &str) -> Self {
        self.failing_namespaces.insert(namespace.to_string());
        self
    }

    pub fn panicking_namespace(mut self, namespace: &str) -> Self {
        self.panicking_namespaces.insert(namespace.to_string());
        self
    }

    pub fn failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    /// Stall pod listing, simulating an API server that stops answering
    pub fn slow(mut self, delay: Duration) -> Self {
        self.listing_delay = Some(delay);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_listing = true;
        self
    }
}

#[async_trait]
impl ClusterHandle for FakeHandle {
    async fn list_pods(&self) -> Result<Vec<PodRef>> {
        if let Some(delay) = self.listing_delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_listing {
            panic!("client library bug");
        }
        if self.fail_listing {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.pods.clone())
    }

    async fn namespace_metrics(&self, namespace: &str) -> Result<Vec<PodMetricsEntry>> {
        self.metrics_calls.fetch_add(1, Ordering::SeqCst);
        if self.panicking_namespaces.contains(namespace) {
            panic!("unexpected metrics payload in {namespace}");
        }
        if self.failing_namespaces.contains(namespace) {
            return Err(anyhow!("metrics API returned 503"));
        }
        Ok(self.metrics.get(namespace).cloned().unwrap_or_default())
    }
}

/// Connector serving scripted handles by cluster id
#[derive(Default)]
pub struct FakeConnector {
    handles: HashMap<i64, Arc<FakeHandle>>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster(mut self, cluster_id: i64, handle: FakeHandle) -> Self {
        self.handles.insert(cluster_id, Arc::new(handle));
        self
    }

    pub fn handle(&self, cluster_id: i64) -> Option<Arc<FakeHandle>> {
        self.handles.get(&cluster_id).cloned()
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterHandle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.handles.get(&cluster.id) {
            Some(handle) => Ok(handle.clone() as Arc<dyn ClusterHandle>),
            None => Err(anyhow!("no route to host {}", cluster.domain_url)),
        }
    }
}

/// Registry backed by a fixed topology
#[derive(Default)]
pub struct FakeRegistry {
    pub users: Vec<User>,
    pub clusters: Vec<Cluster>,
    pub fail_users: bool,
    pub failing_users: HashSet<i64>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, id: i64) -> Self {
        self.users.push(User {
            id,
            nickname: format!("user-{id}"),
        });
        self
    }

    pub fn cluster(mut self, owner_id: i64, cluster_id: i64) -> Self {
        self.clusters.push(cluster(owner_id, cluster_id));
        self
    }
}

#[async_trait]
impl ClusterRegistry for FakeRegistry {
    async fn list_users(&self) -> Result<Vec<User>> {
        if self.fail_users {
            return Err(anyhow!("database unavailable"));
        }
        Ok(self.users.clone())
    }

    async fn list_clusters(&self, user_id: i64) -> Result<Vec<Cluster>> {
        if self.failing_users.contains(&user_id) {
            return Err(anyhow!("query timed out"));
        }
        Ok(self
            .clusters
            .iter()
            .filter(|c| c.owner_id == user_id)
            .cloned()
            .collect())
    }
}

pub fn cluster(owner_id: i64, cluster_id: i64) -> Cluster {
    Cluster {
        id: cluster_id,
        owner_id,
        name: format!("cluster-{cluster_id}"),
        domain_url: format!("10.0.0.{cluster_id}:6443"),
        secret_token: "token".to_string(),
        version: "v1.28.0".to_string(),
        cert_path: None,
        created_at: Utc::now(),
    }
}

pub fn pod_ref(namespace: &str, name: &str) -> PodRef {
    PodRef {
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

pub fn entry(pod_name: &str, containers: &[(&str, &str)]) -> PodMetricsEntry {
    PodMetricsEntry {
        pod_name: pod_name.to_string(),
        containers: containers
            .iter()
            .enumerate()
            .map(|(i, (cpu, memory))| ContainerUsage {
                name: format!("c{i}"),
                cpu: cpu.to_string(),
                memory: memory.to_string(),
            })
            .collect(),
    }
}
