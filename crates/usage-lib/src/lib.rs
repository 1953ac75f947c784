//! Cluster resource usage collection
//!
//! This crate provides the core functionality for:
//! - Sampling pod CPU and memory from registered Kubernetes clusters
//! - Rolling samples up into namespace and cluster totals
//! - Caching snapshots in minute-of-hour buckets with a fixed TTL
//! - Scheduling periodic ticks, health checks and observability

pub mod aggregate;
pub mod cache;
pub mod clock;
pub mod collector;
pub mod error;
pub mod format;
pub mod health;
pub mod models;
pub mod observability;
pub mod registry;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use cache::{CacheKey, CacheStore, MemoryStore, Scope, TimeBucketCache};
pub use clock::{Clock, SystemClock};
pub use error::{CacheError, CollectError, QuantityError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, UsageMetrics};
pub use registry::{ClusterRegistry, FileRegistry, StaticRegistry};
pub use scheduler::{SchedulerConfig, TickReport, UsageScheduler, UsageSchedulerBuilder};
