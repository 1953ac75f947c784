//! Error taxonomy for the collection pipeline

use thiserror::Error;

/// Failures scoped to a single cluster or a single pod.
///
/// None of these abort a tick: cluster-scoped variants skip the cluster,
/// pod-scoped variants skip the pod.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Connection or pod listing failed, or the cluster did not answer in time
    #[error("cluster {cluster_id} unreachable: {reason}")]
    ClusterUnreachable { cluster_id: i64, reason: String },

    /// Metrics backend errored or had no sample for the pod
    #[error("metrics unavailable for pod {namespace}/{pod}: {reason}")]
    MetricsUnavailable {
        namespace: String,
        pod: String,
        reason: String,
    },

    /// Metrics backend returned a value we could not interpret
    #[error("malformed sample for pod {namespace}/{pod}: {source}")]
    MalformedSample {
        namespace: String,
        pod: String,
        #[source]
        source: QuantityError,
    },
}

impl CollectError {
    pub fn unreachable(cluster_id: i64, err: impl std::fmt::Display) -> Self {
        Self::ClusterUnreachable {
            cluster_id,
            reason: err.to_string(),
        }
    }

    /// Whether this failure is scoped to the whole cluster
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, Self::ClusterUnreachable { .. })
    }

    /// Namespace and name of the pod a pod-scoped failure refers to
    pub fn pod(&self) -> Option<(&str, &str)> {
        match self {
            Self::ClusterUnreachable { .. } => None,
            Self::MetricsUnavailable { namespace, pod, .. }
            | Self::MalformedSample { namespace, pod, .. } => Some((namespace, pod)),
        }
    }
}

/// Kubernetes resource quantity parse failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity {0:?}")]
    Invalid(String),

    #[error("negative quantity {0:?}")]
    Negative(String),
}

/// Cache store failures
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache value codec error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache backend error: {0}")]
    Backend(String),
}
