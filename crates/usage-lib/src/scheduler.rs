//! Periodic collection tick
//!
//! Every interval the scheduler walks users, then their clusters, and for each
//! cluster runs fetch, aggregation and cache writes on its own task. A failing
//! cluster or pod is logged and skipped; nothing inside a cluster's processing
//! can abort the tick.

use crate::aggregate::UsageAggregator;
use crate::cache::{CacheKey, Scope, TimeBucketCache, DEFAULT_TTL};
use crate::clock::{Clock, SystemClock};
use crate::collector::{ClusterConnector, MetricsCollector};
use crate::error::CollectError;
use crate::format::format_duration;
use crate::health::{components, HealthRegistry};
use crate::models::{Cluster, TickTime, UsageSample};
use crate::observability::{StructuredLogger, UsageMetrics};
use crate::registry::ClusterRegistry;
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{self, JoinSet};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick interval, ticks are aligned to multiples of it (default: 2 minutes)
    pub interval: Duration,
    /// Upper bound on one cluster's fetch (default: 60 seconds)
    pub cluster_timeout: Duration,
    /// Clusters processed at the same time (default: 8)
    pub max_concurrent_clusters: usize,
    /// Lifetime of every cache write (default: 30 minutes)
    pub cache_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            cluster_timeout: Duration::from_secs(60),
            max_concurrent_clusters: 8,
            cache_ttl: DEFAULT_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Summary of one tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub label: String,
    pub bucket: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub users: usize,
    pub users_failed: usize,
    pub clusters_collected: usize,
    pub clusters_failed: usize,
    /// Clusters listed under a user that does not own them
    pub clusters_skipped: usize,
    pub pods_sampled: usize,
    pub pods_skipped: usize,
    pub cache_writes: usize,
    pub cache_write_errors: usize,
    pub unreachable: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_error: Option<String>,
    pub elapsed_ms: u64,
}

impl TickReport {
    fn new(tick: &TickTime) -> Self {
        Self {
            label: tick.label.clone(),
            bucket: tick.bucket,
            started_at: Some(tick.at),
            ..Self::default()
        }
    }

    fn clusters_total(&self) -> usize {
        self.clusters_collected + self.clusters_failed
    }
}

/// What happened to one cluster within a tick
#[derive(Debug)]
enum ClusterOutcome {
    Collected {
        pods_sampled: usize,
        pods_skipped: usize,
        writes: WriteCount,
    },
    Unreachable {
        user_id: i64,
        cluster_id: i64,
        error: CollectError,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct WriteCount {
    written: usize,
    failed: usize,
}

/// Everything one cluster task needs, cloned out of the scheduler
struct ClusterWorker {
    collector: Arc<MetricsCollector>,
    cache: TimeBucketCache,
    metrics: UsageMetrics,
    logger: StructuredLogger,
    tick: TickTime,
    cluster_timeout: Duration,
    cache_ttl: Duration,
}

impl ClusterWorker {
    async fn process(self, user_id: i64, cluster: Cluster) -> ClusterOutcome {
        let started = Instant::now();

        let fetched = match timeout(
            self.cluster_timeout,
            self.collector.fetch(&cluster, &self.tick),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CollectError::unreachable(
                cluster.id,
                format!("no answer within {}", format_duration(self.cluster_timeout)),
            )),
        };

        let collection = match fetched {
            Ok(collection) => collection,
            Err(error) => {
                return ClusterOutcome::Unreachable {
                    user_id,
                    cluster_id: cluster.id,
                    error,
                }
            }
        };

        for skipped in &collection.skipped {
            if let Some((namespace, pod)) = skipped.pod() {
                self.logger
                    .log_pod_skipped(cluster.id, namespace, pod, &skipped.to_string());
            }
        }

        let mut aggregator = UsageAggregator::new(self.tick.clone());
        aggregator.fold_all(&collection.samples);
        let usage = aggregator.finish();

        let mut writes = WriteCount::default();
        for sample in &collection.samples {
            let scope = Scope::Pod(sample.pod.name.clone());
            self.write(cluster.id, scope, &sample.usage, &mut writes)
                .await;
        }
        for (namespace, total) in &usage.namespaces {
            let scope = Scope::Namespace(namespace.clone());
            self.write(cluster.id, scope, total, &mut writes).await;
        }
        self.write(cluster.id, Scope::ClusterTotal, &usage.total, &mut writes)
            .await;

        self.metrics.observe_cluster(started.elapsed().as_secs_f64());
        debug!(
            cluster_id = cluster.id,
            namespaces = usage.namespaces.len(),
            pods = usage.pod_count,
            cpu_cores = usage.total.cpu_cores,
            memory_bytes = usage.total.memory_bytes,
            "Cluster usage cached"
        );

        ClusterOutcome::Collected {
            pods_sampled: collection.samples.len(),
            pods_skipped: collection.skipped.len(),
            writes,
        }
    }

    async fn write(
        &self,
        cluster_id: i64,
        scope: Scope,
        value: &UsageSample,
        count: &mut WriteCount,
    ) {
        let key = CacheKey::new(cluster_id, scope, self.tick.bucket);
        match self.cache.store(&key, value, self.cache_ttl).await {
            Ok(()) => count.written += 1,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to cache usage snapshot");
                count.failed += 1;
            }
        }
    }
}

/// Drives the user, cluster and pod traversal on a fixed interval
pub struct UsageScheduler {
    registry: Arc<dyn ClusterRegistry>,
    collector: Arc<MetricsCollector>,
    cache: TimeBucketCache,
    clock: Arc<dyn Clock>,
    health: HealthRegistry,
    metrics: UsageMetrics,
    logger: StructuredLogger,
    config: SchedulerConfig,
    running: AtomicBool,
}

/// Clears the running flag when a tick ends, including by panic
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl UsageScheduler {
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    /// Run one tick now.
    ///
    /// Returns `None` without doing anything if another tick is still
    /// running.
    pub async fn tick(&self) -> Option<TickReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Previous tick still running, skipping");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let started = Instant::now();
        let tick = TickTime::new(self.clock.now());
        let mut report = TickReport::new(&tick);

        match self.registry.list_users().await {
            Ok(users) => {
                report.users = users.len();
                let mut tasks = JoinSet::new();
                let mut spawned: HashMap<task::Id, (i64, i64)> = HashMap::new();
                let permits = Arc::new(Semaphore::new(self.config.max_concurrent_clusters.max(1)));

                for user in users {
                    let clusters = match self.registry.list_clusters(user.id).await {
                        Ok(clusters) => clusters,
                        Err(e) => {
                            warn!(user_id = user.id, error = %format!("{e:#}"), "Failed to list clusters, skipping user");
                            report.users_failed += 1;
                            continue;
                        }
                    };

                    for cluster in clusters {
                        if cluster.owner_id != user.id {
                            warn!(
                                user_id = user.id,
                                cluster_id = cluster.id,
                                owner_id = cluster.owner_id,
                                "Cluster not owned by user, skipping"
                            );
                            report.clusters_skipped += 1;
                            continue;
                        }

                        let worker = self.worker(&tick);
                        let permits = permits.clone();
                        let user_id = user.id;
                        let cluster_id = cluster.id;
                        let handle = tasks.spawn(async move {
                            let _permit = permits.acquire_owned().await.ok();
                            worker.process(user_id, cluster).await
                        });
                        spawned.insert(handle.id(), (user_id, cluster_id));
                    }
                }

                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok(outcome) => self.record(&mut report, outcome),
                        Err(e) => {
                            error!(error = %e, "Cluster task aborted");
                            self.metrics.inc_clusters_unreachable();
                            report.clusters_failed += 1;
                            if let Some(&(user_id, cluster_id)) = spawned.get(&e.id()) {
                                self.logger.log_cluster_unreachable(
                                    user_id,
                                    cluster_id,
                                    &format!("cluster task failed: {e}"),
                                );
                                report.unreachable.push(cluster_id);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                let reason = format!("{e:#}");
                error!(error = %reason, "Failed to list users, tick skipped");
                report.registry_error = Some(reason);
            }
        }

        let elapsed = started.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;
        report.unreachable.sort_unstable();

        self.metrics
            .observe_tick(elapsed.as_secs_f64(), tick.at.timestamp());
        self.metrics
            .set_cache_entries(self.cache.store_backend().len());
        self.update_health(&report).await;
        self.logger.log_tick_complete(
            &report.label,
            report.clusters_collected,
            report.clusters_failed,
            report.pods_sampled,
            report.pods_skipped,
            &format_duration(elapsed),
        );

        Some(report)
    }

    fn worker(&self, tick: &TickTime) -> ClusterWorker {
        ClusterWorker {
            collector: self.collector.clone(),
            cache: self.cache.clone(),
            metrics: self.metrics.clone(),
            logger: self.logger.clone(),
            tick: tick.clone(),
            cluster_timeout: self.config.cluster_timeout,
            cache_ttl: self.config.cache_ttl,
        }
    }

    fn record(&self, report: &mut TickReport, outcome: ClusterOutcome) {
        match outcome {
            ClusterOutcome::Collected {
                pods_sampled,
                pods_skipped,
                writes,
            } => {
                self.metrics.inc_clusters_collected();
                self.metrics.add_pods(pods_sampled, pods_skipped);
                self.metrics.add_cache_writes(writes.written, writes.failed);
                report.clusters_collected += 1;
                report.pods_sampled += pods_sampled;
                report.pods_skipped += pods_skipped;
                report.cache_writes += writes.written;
                report.cache_write_errors += writes.failed;
            }
            ClusterOutcome::Unreachable {
                user_id,
                cluster_id,
                error,
            } => {
                self.metrics.inc_clusters_unreachable();
                self.logger
                    .log_cluster_unreachable(user_id, cluster_id, &error.to_string());
                report.clusters_failed += 1;
                report.unreachable.push(cluster_id);
            }
        }
    }

    async fn update_health(&self, report: &TickReport) {
        if let Some(reason) = &report.registry_error {
            self.health
                .set_unhealthy(components::REGISTRY, reason.clone())
                .await;
            return;
        }

        if report.users_failed > 0 {
            self.health
                .set_degraded(
                    components::REGISTRY,
                    format!("{} users could not be listed", report.users_failed),
                )
                .await;
        } else {
            self.health.set_healthy(components::REGISTRY).await;
        }

        if report.clusters_failed > 0 {
            self.health
                .set_degraded(
                    components::COLLECTOR,
                    format!(
                        "{} of {} clusters unreachable",
                        report.clusters_failed,
                        report.clusters_total()
                    ),
                )
                .await;
        } else {
            self.health.set_healthy(components::COLLECTOR).await;
        }

        if report.cache_write_errors > 0 {
            self.health
                .set_degraded(
                    components::CACHE,
                    format!("{} writes failed", report.cache_write_errors),
                )
                .await;
        } else {
            self.health.set_healthy(components::CACHE).await;
        }
    }

    /// Tick on every aligned boundary until shutdown.
    ///
    /// A tick runs to completion before the next boundary is computed, so
    /// boundaries passed while a tick overran are skipped.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting usage scheduler"
        );

        loop {
            let now = self.clock.now();
            let wait = (next_aligned_tick(now, self.config.interval) - now)
                .to_std()
                .unwrap_or_default();

            tokio::select! {
                _ = sleep(wait) => {
                    let started = Instant::now();
                    if self.tick().await.is_none() {
                        continue;
                    }

                    let elapsed = started.elapsed();
                    if elapsed >= self.config.interval {
                        self.logger.log_tick_overrun(
                            &format_duration(elapsed),
                            &format_duration(self.config.interval),
                        );
                        self.health
                            .set_degraded(components::SCHEDULER, "Tick outlasted the interval")
                            .await;
                    } else {
                        self.health.set_healthy(components::SCHEDULER).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down usage scheduler");
                    break;
                }
            }
        }
    }
}

/// First multiple of `every` since the Unix epoch strictly after `now`
pub fn next_aligned_tick(now: DateTime<Utc>, every: Duration) -> DateTime<Utc> {
    let step = (every.as_millis() as i64).max(1);
    let next = (now.timestamp_millis().div_euclid(step) + 1) * step;
    Utc.timestamp_millis_opt(next)
        .single()
        .unwrap_or_else(|| now + chrono::Duration::milliseconds(step))
}

/// Builder for [`UsageScheduler`]
pub struct UsageSchedulerBuilder {
    registry: Option<Arc<dyn ClusterRegistry>>,
    collector: Option<Arc<MetricsCollector>>,
    cache: Option<TimeBucketCache>,
    clock: Arc<dyn Clock>,
    health: HealthRegistry,
    logger: StructuredLogger,
    config: SchedulerConfig,
}

impl UsageSchedulerBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            collector: None,
            cache: None,
            clock: Arc::new(SystemClock),
            health: HealthRegistry::new(),
            logger: StructuredLogger::new("usage-agent"),
            config: SchedulerConfig::default(),
        }
    }

    pub fn registry(mut self, registry: Arc<dyn ClusterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
        self.collector = Some(Arc::new(MetricsCollector::new(connector)));
        self
    }

    pub fn cache(mut self, cache: TimeBucketCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn cluster_timeout(mut self, timeout: Duration) -> Self {
        self.config.cluster_timeout = timeout;
        self
    }

    pub fn max_concurrent_clusters(mut self, limit: usize) -> Self {
        self.config.max_concurrent_clusters = limit;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<UsageScheduler> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("Registry is required"))?;
        let collector = self
            .collector
            .ok_or_else(|| anyhow::anyhow!("Connector is required"))?;
        let cache = self
            .cache
            .ok_or_else(|| anyhow::anyhow!("Cache is required"))?;

        Ok(UsageScheduler {
            registry,
            collector,
            cache,
            clock: self.clock,
            health: self.health,
            metrics: UsageMetrics::new(),
            logger: self.logger,
            config: self.config,
            running: AtomicBool::new(false),
        })
    }
}

impl Default for UsageSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::clock::ManualClock;
    use crate::health::ComponentStatus;
    use crate::testing::{FakeConnector, FakeHandle, FakeRegistry};

    struct Harness {
        clock: Arc<ManualClock>,
        cache: TimeBucketCache,
        health: HealthRegistry,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 3, 1, 10, 4, 0).unwrap(),
            ));
            let cache = TimeBucketCache::new(Arc::new(MemoryStore::new(clock.clone())));
            Self {
                clock,
                cache,
                health: HealthRegistry::new(),
            }
        }

        fn scheduler(&self, registry: FakeRegistry, connector: FakeConnector) -> UsageScheduler {
            UsageSchedulerBuilder::new()
                .registry(Arc::new(registry))
                .connector(Arc::new(connector))
                .cache(self.cache.clone())
                .clock(self.clock.clone())
                .health(self.health.clone())
                .cluster_timeout(Duration::from_millis(200))
                .build()
                .unwrap()
        }

        async fn cached(&self, cluster_id: i64, scope: Scope) -> Option<UsageSample> {
            self.cache
                .get(&CacheKey::new(cluster_id, scope, 4))
                .await
                .unwrap()
        }
    }

    fn pod(name: &str) -> Scope {
        Scope::Pod(name.to_string())
    }

    fn namespace(name: &str) -> Scope {
        Scope::Namespace(name.to_string())
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(120));
        assert_eq!(config.cluster_timeout, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_clusters, 8);
        assert_eq!(config.cache_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn test_builder_requires_dependencies() {
        let result = UsageSchedulerBuilder::new()
            .registry(Arc::new(FakeRegistry::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_next_aligned_tick() {
        let every = Duration::from_secs(120);
        let at = |h, m, s| Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap();

        assert_eq!(next_aligned_tick(at(10, 3, 17), every), at(10, 4, 0));
        assert_eq!(next_aligned_tick(at(10, 4, 0), every), at(10, 6, 0));
        assert_eq!(next_aligned_tick(at(10, 59, 59), every), at(11, 0, 0));
        assert_eq!(
            next_aligned_tick(at(10, 0, 1), Duration::from_secs(3600)),
            at(11, 0, 0)
        );
    }

    #[tokio::test]
    async fn test_unreachable_cluster_does_not_stop_others() {
        let harness = Harness::new();
        let registry = FakeRegistry::new().user(1).cluster(1, 10).cluster(1, 20);
        // Cluster 10 has no route; cluster 20 answers
        let connector = FakeConnector::new().cluster(
            20,
            FakeHandle::new()
                .pod("shop", "web-1", "250m", "128Mi")
                .pod("shop", "web-2", "500m", "64Mi")
                .pod("ops", "agent", "100000000n", "1Gi"),
        );

        let report = harness
            .scheduler(registry, connector)
            .tick()
            .await
            .unwrap();

        assert_eq!(report.clusters_collected, 1);
        assert_eq!(report.clusters_failed, 1);
        assert_eq!(report.unreachable, vec![10]);
        assert_eq!(report.pods_sampled, 3);
        // 3 pods, 2 namespaces, 1 total
        assert_eq!(report.cache_writes, 6);
        assert_eq!(report.label, "10:04");

        let web = harness.cached(20, pod("web-1")).await.unwrap();
        assert_eq!(web.cpu_cores, 0.25);
        assert_eq!(web.memory_bytes, 128 * 1024 * 1024);

        let shop = harness.cached(20, namespace("shop")).await.unwrap();
        assert_eq!(shop.cpu_cores, 0.75);
        assert_eq!(shop.memory_bytes, 192 * 1024 * 1024);

        let total = harness.cached(20, Scope::ClusterTotal).await.unwrap();
        assert!((total.cpu_cores - 0.85).abs() < 1e-9);
        assert_eq!(total.memory_bytes, (192 + 1024) * 1024 * 1024);
        assert_eq!(total.label, "10:04");

        assert!(harness.cached(10, Scope::ClusterTotal).await.is_none());

        let health = harness.health.health().await;
        assert_eq!(
            health.components[components::COLLECTOR].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_failed_cluster_keeps_previous_entries() {
        let harness = Harness::new();
        let earlier = TickTime::new(harness.clock.now() - chrono::Duration::hours(1));
        let key = CacheKey::new(10, Scope::ClusterTotal, 4);
        let previous = UsageSample::new(3.0, 42, &earlier);
        harness
            .cache
            .store(&key, &previous, DEFAULT_TTL)
            .await
            .unwrap();

        let registry = FakeRegistry::new().user(1).cluster(1, 10);
        let connector = FakeConnector::new().cluster(10, FakeHandle::new().failing_listing());
        let report = harness
            .scheduler(registry, connector)
            .tick()
            .await
            .unwrap();

        assert_eq!(report.clusters_failed, 1);
        assert_eq!(report.cache_writes, 0);
        assert_eq!(harness.cache.get(&key).await.unwrap(), Some(previous));
    }

    #[tokio::test]
    async fn test_pod_without_metrics_is_left_out() {
        let harness = Harness::new();
        let registry = FakeRegistry::new().user(1).cluster(1, 10);
        let connector = FakeConnector::new().cluster(
            10,
            FakeHandle::new()
                .pod("shop", "web-1", "1", "1Ki")
                .pod_without_metrics("shop", "web-2")
                .pod("shop", "web-3", "2", "1Ki"),
        );

        let report = harness
            .scheduler(registry, connector)
            .tick()
            .await
            .unwrap();

        assert_eq!(report.pods_sampled, 2);
        assert_eq!(report.pods_skipped, 1);
        assert!(harness.cached(10, pod("web-2")).await.is_none());

        let shop = harness.cached(10, namespace("shop")).await.unwrap();
        assert_eq!(shop.cpu_cores, 3.0);
        assert_eq!(shop.memory_bytes, 2048);
    }

    #[tokio::test]
    async fn test_registry_failure_skips_tick() {
        let harness = Harness::new();
        let registry = FakeRegistry {
            fail_users: true,
            ..FakeRegistry::new()
        };

        let report = harness
            .scheduler(registry, FakeConnector::new())
            .tick()
            .await
            .unwrap();

        assert!(report.registry_error.is_some());
        assert_eq!(report.clusters_total(), 0);
        let health = harness.health.health().await;
        assert_eq!(
            health.components[components::REGISTRY].status,
            ComponentStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_failing_user_and_foreign_cluster_are_skipped() {
        let harness = Harness::new();
        let mut registry = FakeRegistry::new()
            .user(1)
            .user(2)
            .user(3)
            .cluster(2, 20)
            .cluster(3, 30);
        registry.failing_users.insert(1);

        // Hands user 3 a cluster owned by user 9
        struct Leaky(FakeRegistry);

        #[async_trait::async_trait]
        impl ClusterRegistry for Leaky {
            async fn list_users(&self) -> Result<Vec<crate::models::User>> {
                self.0.list_users().await
            }

            async fn list_clusters(&self, user_id: i64) -> Result<Vec<Cluster>> {
                let mut clusters = self.0.list_clusters(user_id).await?;
                if user_id == 3 {
                    clusters.push(crate::testing::cluster(9, 32));
                }
                Ok(clusters)
            }
        }

        let connector = FakeConnector::new()
            .cluster(20, FakeHandle::new().pod("a", "p", "1", "1"))
            .cluster(30, FakeHandle::new().pod("a", "p", "1", "1"))
            .cluster(32, FakeHandle::new().pod("a", "p", "1", "1"));

        let scheduler = UsageSchedulerBuilder::new()
            .registry(Arc::new(Leaky(registry)))
            .connector(Arc::new(connector))
            .cache(harness.cache.clone())
            .clock(harness.clock.clone())
            .health(harness.health.clone())
            .build()
            .unwrap();

        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.users, 3);
        assert_eq!(report.users_failed, 1);
        assert_eq!(report.clusters_collected, 2);
        assert_eq!(report.clusters_skipped, 1);
        assert!(harness.cached(32, Scope::ClusterTotal).await.is_none());

        let health = harness.health.health().await;
        assert_eq!(
            health.components[components::REGISTRY].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_slow_cluster_times_out() {
        let harness = Harness::new();
        let registry = FakeRegistry::new().user(1).cluster(1, 10).cluster(1, 20);
        let connector = FakeConnector::new()
            .cluster(10, FakeHandle::new().slow(Duration::from_secs(30)))
            .cluster(20, FakeHandle::new().pod("shop", "web", "1", "1Mi"));

        let report = harness
            .scheduler(registry, connector)
            .tick()
            .await
            .unwrap();

        assert_eq!(report.unreachable, vec![10]);
        assert_eq!(report.clusters_collected, 1);
        assert!(report.elapsed_ms < 10_000);
    }

    #[tokio::test]
    async fn test_panicking_cluster_counts_as_failed() {
        let harness = Harness::new();
        let registry = FakeRegistry::new().user(1).cluster(1, 10).cluster(1, 20);
        let connector = FakeConnector::new()
            .cluster(10, FakeHandle::new().panicking())
            .cluster(20, FakeHandle::new().pod("shop", "web", "1", "1Mi"));

        let report = harness
            .scheduler(registry, connector)
            .tick()
            .await
            .unwrap();

        assert_eq!(report.clusters_failed, 1);
        assert_eq!(report.clusters_collected, 1);
        assert_eq!(report.unreachable, vec![10]);
        assert!(harness.cached(20, Scope::ClusterTotal).await.is_some());
    }

    #[tokio::test]
    async fn test_panicking_namespace_keeps_sibling_namespace_cached() {
        let harness = Harness::new();
        let registry = FakeRegistry::new().user(1).cluster(1, 10);
        let connector = FakeConnector::new().cluster(
            10,
            FakeHandle::new()
                .pod("bad", "x", "1", "1Mi")
                .pod("good", "y", "250m", "2Mi")
                .panicking_namespace("bad"),
        );

        let report = harness
            .scheduler(registry, connector)
            .tick()
            .await
            .unwrap();

        assert_eq!(report.clusters_collected, 1);
        assert!(report.unreachable.is_empty());
        assert_eq!(report.pods_sampled, 1);
        assert_eq!(report.pods_skipped, 1);

        let good = harness.cached(10, namespace("good")).await.unwrap();
        assert_eq!(good.cpu_cores, 0.25);
        assert_eq!(good.memory_bytes, 2 * 1024 * 1024);
        assert!(harness.cached(10, namespace("bad")).await.is_none());
        assert!(harness.cached(10, pod("x")).await.is_none());

        let total = harness.cached(10, Scope::ClusterTotal).await.unwrap();
        assert_eq!(total.cpu_cores, 0.25);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_skipped_pod_is_logged() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let harness = Harness::new();
        let registry = FakeRegistry::new().user(1).cluster(1, 10);
        let connector = FakeConnector::new().cluster(
            10,
            FakeHandle::new()
                .pod("shop", "web-1", "1", "1Ki")
                .pod_without_metrics("shop", "web-2"),
        );

        let report = harness
            .scheduler(registry, connector)
            .tick()
            .await
            .unwrap();
        assert_eq!(report.pods_skipped, 1);

        let text = logs.text();
        let line = text
            .lines()
            .find(|line| line.contains("pod_skipped"))
            .expect("no pod_skipped event");
        assert!(line.contains("web-2"));
        assert!(line.contains("cluster_id=10"));
        assert!(!text.lines().any(|l| l.contains("pod_skipped") && l.contains("web-1")));
    }

    #[tokio::test]
    async fn test_concurrent_tick_is_rejected() {
        let harness = Harness::new();
        let registry = FakeRegistry::new().user(1).cluster(1, 10);
        let connector = FakeConnector::new().cluster(
            10,
            FakeHandle::new()
                .pod("shop", "web", "1", "1Mi")
                .slow(Duration::from_millis(100)),
        );
        let scheduler = harness.scheduler(registry, connector);

        let (first, second) = tokio::join!(scheduler.tick(), async {
            sleep(Duration::from_millis(20)).await;
            assert_eq!(scheduler.state(), SchedulerState::Running);
            scheduler.tick().await
        });

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(scheduler.tick().await.is_some());
    }

    #[tokio::test]
    async fn test_next_tick_overwrites_same_bucket() {
        let harness = Harness::new();
        let registry = FakeRegistry::new().user(1).cluster(1, 10);
        let connector = FakeConnector::new().cluster(
            10,
            FakeHandle::new().pod("shop", "web", "500m", "1Mi"),
        );
        let scheduler = harness.scheduler(registry, connector);

        scheduler.tick().await.unwrap();
        harness.clock.advance(chrono::Duration::minutes(2));
        scheduler.tick().await.unwrap();

        let history = harness
            .cache
            .history(10, &Scope::ClusterTotal)
            .await
            .unwrap();
        let labels: Vec<&str> = history.iter().map(|(_, s)| s.label.as_str()).collect();
        assert_eq!(labels, vec!["10:04", "10:06"]);

        // Same minute an hour later lands on the same key
        harness.clock.advance(chrono::Duration::minutes(58));
        scheduler.tick().await.unwrap();
        let total = harness.cached(10, Scope::ClusterTotal).await.unwrap();
        assert_eq!(total.label, "11:04");
    }
}
