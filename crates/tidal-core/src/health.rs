//! Health check system for monitoring pipeline components.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// Component names registered by the driver.
pub mod components {
    pub const SOURCE: &str = "source";
    pub const TABLE: &str = "table";
    pub const CHECKPOINT: &str = "checkpoint";
}

/// Health status of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component status is unknown
    Unknown,
}

/// Overall pipeline health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time view of all components, as served on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pipeline_state: String,
    pub components: BTreeMap<String, ComponentStatus>,
}

/// Tracks component health and the driver's current state.
pub struct HealthCheck {
    components: RwLock<BTreeMap<String, ComponentStatus>>,
    pipeline_state: RwLock<String>,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(BTreeMap::new()),
            pipeline_state: RwLock::new("init".to_string()),
        }
    }

    /// Health check with the driver's components registered.
    pub fn for_pipeline() -> Self {
        let health = Self::new();
        health.register_component(components::SOURCE);
        health.register_component(components::TABLE);
        health.register_component(components::CHECKPOINT);
        health
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        self.components
            .write()
            .insert(name.to_string(), ComponentStatus::Unknown);
    }

    pub fn mark_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy);
    }

    pub fn mark_degraded(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Degraded(reason.to_string()));
    }

    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Unhealthy(reason.to_string()));
    }

    fn set(&self, name: &str, status: ComponentStatus) {
        self.components.write().insert(name.to_string(), status);
    }

    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().get(name).cloned()
    }

    /// Overall status: the worst of all components.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        self.overall_status() != HealthStatus::Unhealthy
    }

    /// Record the driver's state label.
    pub fn set_pipeline_state(&self, state: &str) {
        *self.pipeline_state.write() = state.to_string();
    }

    pub fn pipeline_state(&self) -> String {
        self.pipeline_state.read().clone()
    }

    /// Operational and actively moving data.
    pub fn is_ready(&self) -> bool {
        self.is_operational()
            && !matches!(self.pipeline_state().as_str(), "init" | "stopped" | "failed")
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.overall_status(),
            pipeline_state: self.pipeline_state(),
            components: self.components.read().clone(),
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_components_start_unknown() {
        let health = HealthCheck::for_pipeline();
        assert_eq!(
            health.get_component_status(components::TABLE),
            Some(ComponentStatus::Unknown)
        );
        assert_eq!(health.overall_status(), HealthStatus::Healthy);
        assert!(!health.is_ready());
    }

    #[test]
    fn test_status_priority() {
        let health = HealthCheck::for_pipeline();
        health.mark_healthy(components::SOURCE);
        health.mark_degraded(components::TABLE, "storage retrying");
        assert_eq!(health.overall_status(), HealthStatus::Degraded);
        assert!(health.is_operational());

        health.mark_unhealthy(components::CHECKPOINT, "disk full");
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);
        assert!(!health.is_operational());

        health.mark_healthy(components::CHECKPOINT);
        health.mark_healthy(components::TABLE);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_readiness_follows_pipeline_state() {
        let health = HealthCheck::for_pipeline();
        health.set_pipeline_state("streaming");
        assert!(health.is_ready());

        health.set_pipeline_state("failed");
        assert!(!health.is_ready());
    }

    #[test]
    fn test_report_serializes() {
        let health = HealthCheck::for_pipeline();
        health.mark_unhealthy(components::TABLE, "schema mismatch");
        health.set_pipeline_state("failed");

        let json = serde_json::to_value(health.report()).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["pipeline_state"], "failed");
        assert_eq!(json["components"]["table"]["status"], "unhealthy");
        assert_eq!(json["components"]["table"]["reason"], "schema mismatch");
        assert_eq!(json["components"]["source"]["status"], "unknown");
    }
}
