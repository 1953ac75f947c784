//! Component health for liveness and readiness checks
//!
//! The pipeline reports on four components: the cluster registry, the
//! collector, the cache and the scheduler. The overall status is the worst
//! component status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Partially working, e.g. some clusters unreachable
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }

    fn severity(&self) -> u8 {
        match self {
            ComponentStatus::Healthy => 0,
            ComponentStatus::Degraded => 1,
            ComponentStatus::Unhealthy => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status among `components`, healthy when empty
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|h| h.status)
            .max_by_key(ComponentStatus::severity)
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names used by the pipeline
pub mod components {
    pub const REGISTRY: &str = "registry";
    pub const COLLECTOR: &str = "collector";
    pub const CACHE: &str = "cache";
    pub const SCHEDULER: &str = "scheduler";

    pub const ALL: [&str; 4] = [REGISTRY, COLLECTOR, CACHE, SCHEDULER];
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Track a component, starting out healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn register_all(&self) {
        for name in components::ALL {
            self.register(name).await;
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once initialized, as long as no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        if !ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("Agent not yet initialized".to_string()),
            };
        }

        let health = self.health().await;
        let unhealthy: Vec<&str> = health
            .components
            .iter()
            .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect();

        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            let mut names = unhealthy;
            names.sort_unstable();
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy components: {}", names.join(", "))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_register_all_components() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        let health = registry.health().await;
        assert_eq!(health.components.len(), 4);
        assert_eq!(
            health.components[components::SCHEDULER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_worst_status_wins() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        registry
            .set_degraded(components::COLLECTOR, "2 of 5 clusters unreachable")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::REGISTRY, "Failed to read registry")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);

        registry.set_healthy(components::REGISTRY).await;
        registry.set_healthy(components::COLLECTOR).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_readiness_lifecycle() {
        let registry = HealthRegistry::new();
        registry.register_all().await;
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        // Degraded components still serve traffic
        registry
            .set_degraded(components::CACHE, "3 writes failed")
            .await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::CACHE, "Store rejected writes")
            .await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Unhealthy components: cache")
        );
    }
}
