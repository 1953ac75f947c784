//! Core data models for the usage agent

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// A user owning zero or more registered clusters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub nickname: String,
}

/// A registered cluster and the credentials needed to reach it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    /// API server host and optional port, without scheme
    pub domain_url: String,
    pub secret_token: String,
    #[serde(default)]
    pub version: String,
    /// CA bundle used to verify the API server, if any
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Pod identity as returned by a pod listing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

/// One container's raw usage quantities as reported by metrics-server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    pub cpu: String,
    pub memory: String,
}

/// One pod entry of a namespace metrics listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodMetricsEntry {
    pub pod_name: String,
    pub containers: Vec<ContainerUsage>,
}

/// CPU and memory usage at one tick
///
/// Pod samples and namespace/cluster aggregates share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    /// Wall-clock label of the tick, "H:MM"
    pub label: String,
    pub collected_at: DateTime<Utc>,
}

/// Sum of samples observed within one tick
pub type AggregateUsage = UsageSample;

impl UsageSample {
    pub fn new(cpu_cores: f64, memory_bytes: u64, tick: &TickTime) -> Self {
        Self {
            cpu_cores,
            memory_bytes,
            label: tick.label.clone(),
            collected_at: tick.at,
        }
    }
}

/// Per-pod sample produced by the collector
#[derive(Debug, Clone)]
pub struct PodSample {
    pub pod: PodRef,
    pub usage: UsageSample,
}

/// Wall-clock facts derived once per tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickTime {
    pub at: DateTime<Utc>,
    /// Minute of the hour, 0-59
    pub bucket: u8,
    pub label: String,
}

impl TickTime {
    pub fn new(at: DateTime<Utc>) -> Self {
        let minute = at.minute();
        Self {
            at,
            bucket: minute as u8,
            label: format!("{}:{:02}", at.hour(), minute),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tick_time_pads_minutes_only() {
        let tick = TickTime::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 4, 0).unwrap());
        assert_eq!(tick.label, "9:04");
        assert_eq!(tick.bucket, 4);

        let tick = TickTime::new(Utc.with_ymd_and_hms(2024, 3, 1, 23, 58, 30).unwrap());
        assert_eq!(tick.label, "23:58");
        assert_eq!(tick.bucket, 58);
    }

    #[test]
    fn test_cluster_deserializes_with_defaults() {
        let json = r#"{
            "id": 7,
            "owner_id": 1,
            "name": "staging",
            "domain_url": "10.0.0.5:6443",
            "secret_token": "abc"
        }"#;
        let cluster: Cluster = serde_json::from_str(json).unwrap();
        assert_eq!(cluster.id, 7);
        assert!(cluster.cert_path.is_none());
        assert!(cluster.version.is_empty());
    }
}
