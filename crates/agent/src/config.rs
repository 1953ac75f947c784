//! Agent configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use usage_lib::scheduler::SchedulerConfig;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name attached to every structured log record
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics/usage
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON document listing users and their clusters
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cluster_timeout")]
    pub cluster_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_max_concurrent_clusters")]
    pub max_concurrent_clusters: usize,

    /// How often expired cache entries are purged
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Accept any API server certificate when a cluster has no CA bundle
    #[serde(default)]
    pub skip_tls_verify: bool,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "usage-agent".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/etc/usage-agent/clusters.json")
}

fn default_collection_interval() -> u64 {
    120
}

fn default_cache_ttl() -> u64 {
    1800
}

fn default_cluster_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_max_concurrent_clusters() -> usize {
    8
}

fn default_sweep_interval() -> u64 {
    60
}

impl AgentConfig {
    /// Load configuration from an optional file, then `USAGE_AGENT_*`
    /// environment variables
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("USAGE_AGENT").try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.collection_interval_secs > 0,
            "collection_interval_secs must be positive"
        );
        anyhow::ensure!(self.cache_ttl_secs > 0, "cache_ttl_secs must be positive");
        anyhow::ensure!(
            self.max_concurrent_clusters > 0,
            "max_concurrent_clusters must be positive"
        );
        Ok(())
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.collection_interval_secs),
            cluster_timeout: Duration::from_secs(self.cluster_timeout_secs),
            max_concurrent_clusters: self.max_concurrent_clusters,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "instance_name = \"agent-a\"\ncollection_interval_secs = 60\nskip_tls_verify = true"
        )
        .unwrap();

        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.instance_name, "agent-a");
        assert_eq!(config.api_port, 8080);
        assert!(config.skip_tls_verify);

        let scheduler = config.scheduler();
        assert_eq!(scheduler.interval, Duration::from_secs(60));
        assert_eq!(scheduler.cache_ttl, Duration::from_secs(1800));
        assert_eq!(scheduler.max_concurrent_clusters, 8);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "collection_interval_secs = 0").unwrap();

        assert!(AgentConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AgentConfig::load(Some(Path::new("/nonexistent/agent.toml"))).is_err());
    }
}
