//! Component health registry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Health state of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub detail: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Tracks per-component health. Components register at startup, update
/// their status as they observe failures (retry exhaustion, low cache hit
/// rates), and unregister during shutdown.
#[derive(Default)]
pub struct HealthMonitor {
    components: Mutex<HashMap<String, ComponentHealth>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) {
        self.components.lock().insert(
            name.to_string(),
            ComponentHealth {
                status: ComponentStatus::Healthy,
                detail: None,
                last_updated: Utc::now(),
            },
        );
    }

    pub fn unregister(&self, name: &str) {
        self.components.lock().remove(name);
    }

    pub fn update(&self, name: &str, status: ComponentStatus, detail: Option<String>) {
        let mut components = self.components.lock();
        if let Some(health) = components.get_mut(name) {
            health.status = status;
            health.detail = detail;
            health.last_updated = Utc::now();
        }
    }

    pub fn status_of(&self, name: &str) -> Option<ComponentStatus> {
        self.components.lock().get(name).map(|h| h.status)
    }

    /// Worst status across all registered components. Healthy when none
    /// are registered.
    pub fn overall(&self) -> ComponentStatus {
        let components = self.components.lock();
        let mut overall = ComponentStatus::Healthy;
        for health in components.values() {
            overall = match (overall, health.status) {
                (_, ComponentStatus::Unhealthy) | (ComponentStatus::Unhealthy, _) => {
                    ComponentStatus::Unhealthy
                }
                (_, ComponentStatus::Degraded) | (ComponentStatus::Degraded, _) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            };
        }
        overall
    }

    pub fn snapshot(&self) -> HashMap<String, ComponentHealth> {
        self.components.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_is_worst_component_status() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.overall(), ComponentStatus::Healthy);

        monitor.register("retry_manager");
        monitor.register("search_engine");
        assert_eq!(monitor.overall(), ComponentStatus::Healthy);

        monitor.update(
            "retry_manager",
            ComponentStatus::Degraded,
            Some("low retry success rate".to_string()),
        );
        assert_eq!(monitor.overall(), ComponentStatus::Degraded);

        monitor.update("search_engine", ComponentStatus::Unhealthy, None);
        assert_eq!(monitor.overall(), ComponentStatus::Unhealthy);
    }

    #[test]
    fn updates_to_unregistered_components_are_ignored() {
        let monitor = HealthMonitor::new();
        monitor.update("ghost", ComponentStatus::Unhealthy, None);
        assert_eq!(monitor.status_of("ghost"), None);
        assert_eq!(monitor.overall(), ComponentStatus::Healthy);
    }

    #[test]
    fn unregister_removes_component() {
        let monitor = HealthMonitor::new();
        monitor.register("cache_analytics");
        monitor.update("cache_analytics", ComponentStatus::Unhealthy, None);
        monitor.unregister("cache_analytics");
        assert_eq!(monitor.overall(), ComponentStatus::Healthy);
    }
}
