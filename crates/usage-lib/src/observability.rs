//! Observability infrastructure for the usage agent
//!
//! Provides:
//! - Prometheus metrics (tick and cluster latency, cluster/pod outcomes, cache writes)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for tick and per-cluster latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<UsageMetricsInner> = OnceLock::new();

struct UsageMetricsInner {
    tick_duration_seconds: Histogram,
    cluster_collection_seconds: Histogram,
    ticks: IntCounter,
    clusters_collected: IntCounter,
    clusters_unreachable: IntCounter,
    pods_sampled: IntCounter,
    pods_skipped: IntCounter,
    cache_writes: IntCounter,
    cache_write_errors: IntCounter,
    cache_entries: IntGauge,
    last_tick_timestamp: IntGauge,
}

impl UsageMetricsInner {
    fn new() -> Self {
        Self {
            tick_duration_seconds: register_histogram!(
                "usage_agent_tick_duration_seconds",
                "Time spent on one full collection tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_duration_seconds"),

            cluster_collection_seconds: register_histogram!(
                "usage_agent_cluster_collection_seconds",
                "Time spent collecting, aggregating and caching one cluster",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cluster_collection_seconds"),

            ticks: register_int_counter!(
                "usage_agent_ticks_total",
                "Total number of completed collection ticks"
            )
            .expect("Failed to register ticks_total"),

            clusters_collected: register_int_counter!(
                "usage_agent_clusters_collected_total",
                "Clusters whose usage was collected and cached"
            )
            .expect("Failed to register clusters_collected_total"),

            clusters_unreachable: register_int_counter!(
                "usage_agent_clusters_unreachable_total",
                "Clusters skipped because they could not be reached"
            )
            .expect("Failed to register clusters_unreachable_total"),

            pods_sampled: register_int_counter!(
                "usage_agent_pods_sampled_total",
                "Pods with a usage sample"
            )
            .expect("Failed to register pods_sampled_total"),

            pods_skipped: register_int_counter!(
                "usage_agent_pods_skipped_total",
                "Pods skipped because metrics were missing or malformed"
            )
            .expect("Failed to register pods_skipped_total"),

            cache_writes: register_int_counter!(
                "usage_agent_cache_writes_total",
                "Snapshots written to the cache"
            )
            .expect("Failed to register cache_writes_total"),

            cache_write_errors: register_int_counter!(
                "usage_agent_cache_write_errors_total",
                "Snapshot writes that failed"
            )
            .expect("Failed to register cache_write_errors_total"),

            cache_entries: register_int_gauge!(
                "usage_agent_cache_entries",
                "Entries currently held by the cache store"
            )
            .expect("Failed to register cache_entries"),

            last_tick_timestamp: register_int_gauge!(
                "usage_agent_last_tick_timestamp_seconds",
                "Unix time at which the last tick started"
            )
            .expect("Failed to register last_tick_timestamp_seconds"),
        }
    }
}

/// Usage agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct UsageMetrics {
    _private: (),
}

impl Default for UsageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(UsageMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &UsageMetricsInner {
        GLOBAL_METRICS.get_or_init(UsageMetricsInner::new)
    }

    pub fn observe_tick(&self, duration_secs: f64, started_at: i64) {
        self.inner().tick_duration_seconds.observe(duration_secs);
        self.inner().ticks.inc();
        self.inner().last_tick_timestamp.set(started_at);
    }

    pub fn observe_cluster(&self, duration_secs: f64) {
        self.inner().cluster_collection_seconds.observe(duration_secs);
    }

    pub fn inc_clusters_collected(&self) {
        self.inner().clusters_collected.inc();
    }

    pub fn inc_clusters_unreachable(&self) {
        self.inner().clusters_unreachable.inc();
    }

    pub fn add_pods(&self, sampled: usize, skipped: usize) {
        self.inner().pods_sampled.inc_by(sampled as u64);
        self.inner().pods_skipped.inc_by(skipped as u64);
    }

    pub fn add_cache_writes(&self, written: usize, failed: usize) {
        self.inner().cache_writes.inc_by(written as u64);
        self.inner().cache_write_errors.inc_by(failed as u64);
    }

    pub fn set_cache_entries(&self, count: usize) {
        self.inner().cache_entries.set(count as i64);
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for ticks, cluster failures
/// and process lifecycle.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a finished tick
    pub fn log_tick_complete(
        &self,
        label: &str,
        clusters_collected: usize,
        clusters_failed: usize,
        pods_sampled: usize,
        pods_skipped: usize,
        elapsed: &str,
    ) {
        info!(
            event = "tick_complete",
            instance = %self.instance,
            tick = %label,
            clusters_collected = clusters_collected,
            clusters_failed = clusters_failed,
            pods_sampled = pods_sampled,
            pods_skipped = pods_skipped,
            elapsed = %elapsed,
            "Resource usage saved"
        );
    }

    /// Log a cluster skipped for the rest of the tick
    pub fn log_cluster_unreachable(&self, user_id: i64, cluster_id: i64, reason: &str) {
        warn!(
            event = "cluster_unreachable",
            instance = %self.instance,
            user_id = user_id,
            cluster_id = cluster_id,
            reason = %reason,
            "Cluster inaccessible, skipping"
        );
    }

    /// Log a pod left out of this tick's snapshots
    pub fn log_pod_skipped(&self, cluster_id: i64, namespace: &str, pod: &str, reason: &str) {
        info!(
            event = "pod_skipped",
            instance = %self.instance,
            cluster_id = cluster_id,
            namespace = %namespace,
            pod = %pod,
            reason = %reason,
            "Pod skipped"
        );
    }

    /// Log a tick that ran past the next scheduled boundary
    pub fn log_tick_overrun(&self, elapsed: &str, interval: &str) {
        warn!(
            event = "tick_overrun",
            instance = %self.instance,
            elapsed = %elapsed,
            interval = %interval,
            "Tick outlasted the collection interval, missed ticks are skipped"
        );
    }

    pub fn log_startup(&self, version: &str, interval: &str) {
        info!(
            event = "agent_started",
            instance = %self.instance,
            agent_version = %version,
            interval = %interval,
            "Usage agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Usage agent shutting down"
        );
    }
}
