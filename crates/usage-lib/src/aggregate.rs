//! Per-tick roll-up of pod samples into namespace and cluster totals

use crate::models::{AggregateUsage, PodSample, TickTime};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    cpu_cores: f64,
    memory_bytes: u64,
}

impl Totals {
    fn add(&mut self, cpu_cores: f64, memory_bytes: u64) {
        self.cpu_cores += cpu_cores;
        self.memory_bytes = self.memory_bytes.saturating_add(memory_bytes);
    }
}

/// Running sums for one cluster within one tick.
///
/// Created fresh for every cluster-tick and consumed by [`finish`], so no
/// state survives into the next tick.
///
/// [`finish`]: UsageAggregator::finish
#[derive(Debug)]
pub struct UsageAggregator {
    tick: TickTime,
    namespaces: BTreeMap<String, Totals>,
    pods: usize,
}

/// Namespace and cluster totals for one cluster-tick
#[derive(Debug, Clone)]
pub struct ClusterUsage {
    pub namespaces: BTreeMap<String, AggregateUsage>,
    pub total: AggregateUsage,
    pub pod_count: usize,
}

impl UsageAggregator {
    pub fn new(tick: TickTime) -> Self {
        Self {
            tick,
            namespaces: BTreeMap::new(),
            pods: 0,
        }
    }

    /// Add one pod's sample to its namespace
    pub fn fold_pod(&mut self, sample: &PodSample) {
        self.namespaces
            .entry(sample.pod.namespace.clone())
            .or_default()
            .add(sample.usage.cpu_cores, sample.usage.memory_bytes);
        self.pods += 1;
    }

    pub fn fold_all<'a>(&mut self, samples: impl IntoIterator<Item = &'a PodSample>) {
        for sample in samples {
            self.fold_pod(sample);
        }
    }

    /// Produce namespace totals and the cluster total derived from them
    pub fn finish(self) -> ClusterUsage {
        let mut cluster = Totals::default();
        let mut namespaces = BTreeMap::new();

        // Namespaces are visited in name order, which keeps the cluster sum
        // independent of pod arrival order
        for (name, totals) in self.namespaces {
            cluster.add(totals.cpu_cores, totals.memory_bytes);
            namespaces.insert(
                name,
                AggregateUsage::new(totals.cpu_cores, totals.memory_bytes, &self.tick),
            );
        }

        ClusterUsage {
            namespaces,
            total: AggregateUsage::new(cluster.cpu_cores, cluster.memory_bytes, &self.tick),
            pod_count: self.pods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageSample;
    use crate::testing::pod_ref;
    use chrono::{TimeZone, Utc};

    fn tick() -> TickTime {
        TickTime::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap())
    }

    fn sample(namespace: &str, name: &str, cpu: f64, memory: u64) -> PodSample {
        PodSample {
            pod: pod_ref(namespace, name),
            usage: UsageSample::new(cpu, memory, &tick()),
        }
    }

    fn aggregate(samples: &[PodSample]) -> ClusterUsage {
        let mut aggregator = UsageAggregator::new(tick());
        aggregator.fold_all(samples);
        aggregator.finish()
    }

    #[test]
    fn test_namespace_totals_sum_pods() {
        let usage = aggregate(&[
            sample("shop", "a", 0.25, 100),
            sample("shop", "b", 0.5, 200),
            sample("ops", "c", 1.0, 50),
        ]);

        assert_eq!(usage.namespaces.len(), 2);
        assert_eq!(usage.namespaces["shop"].cpu_cores, 0.75);
        assert_eq!(usage.namespaces["shop"].memory_bytes, 300);
        assert_eq!(usage.namespaces["ops"].cpu_cores, 1.0);
        assert_eq!(usage.total.cpu_cores, 1.75);
        assert_eq!(usage.total.memory_bytes, 350);
        assert_eq!(usage.pod_count, 3);
        assert_eq!(usage.total.label, "8:30");
    }

    #[test]
    fn test_cluster_total_equals_namespace_sum() {
        let samples: Vec<PodSample> = (0..40)
            .map(|i| {
                sample(
                    &format!("ns-{}", i % 7),
                    &format!("pod-{i}"),
                    0.013 * i as f64,
                    1_000 + i as u64 * 37,
                )
            })
            .collect();
        let usage = aggregate(&samples);

        let ns_cpu: f64 = usage.namespaces.values().map(|n| n.cpu_cores).sum();
        let ns_mem: u64 = usage.namespaces.values().map(|n| n.memory_bytes).sum();
        let pod_mem: u64 = samples.iter().map(|s| s.usage.memory_bytes).sum();

        assert!((usage.total.cpu_cores - ns_cpu).abs() < 1e-9);
        assert_eq!(usage.total.memory_bytes, ns_mem);
        assert_eq!(ns_mem, pod_mem);
    }

    #[test]
    fn test_order_of_pods_does_not_matter() {
        let mut samples = vec![
            sample("a", "1", 0.1, 10),
            sample("b", "2", 0.2, 20),
            sample("a", "3", 0.3, 30),
            sample("c", "4", 0.4, 40),
        ];
        let forward = aggregate(&samples);
        samples.reverse();
        let backward = aggregate(&samples);

        for (name, usage) in &forward.namespaces {
            let other = &backward.namespaces[name];
            assert!((usage.cpu_cores - other.cpu_cores).abs() < 1e-12);
            assert_eq!(usage.memory_bytes, other.memory_bytes);
        }
        assert!((forward.total.cpu_cores - backward.total.cpu_cores).abs() < 1e-12);
        assert_eq!(forward.total.memory_bytes, backward.total.memory_bytes);
    }

    #[test]
    fn test_empty_cluster_has_zero_total() {
        let usage = aggregate(&[]);
        assert!(usage.namespaces.is_empty());
        assert_eq!(usage.total.cpu_cores, 0.0);
        assert_eq!(usage.total.memory_bytes, 0);
        assert_eq!(usage.pod_count, 0);
    }
}
