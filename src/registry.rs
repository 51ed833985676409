use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{GatewayError, Result};

/// A dynamically registered service instance.
///
/// The health label is an opaque string (`"healthy"`, `"unhealthy"`,
/// `"unknown"`); `last_seen` is refreshed on registration and on every
/// health update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub url: String,
    #[serde(default = "default_health")]
    pub health: String,
    pub route: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

fn default_health() -> String {
    "unknown".to_string()
}

/// Authoritative mapping: route pattern -> (instance id -> instance).
///
/// A route key exists iff it has at least one instance. Every operation is
/// atomic under the readers-writer lock; queries return snapshots.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, HashMap<String, ServiceInstance>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by (route, id), refreshing `last_seen`.
    pub async fn register(&self, mut instance: ServiceInstance) {
        instance.last_seen = Utc::now();
        let mut services = self.services.write().await;
        info!(route = %instance.route, id = %instance.id, url = %instance.url, "registered service");
        services
            .entry(instance.route.clone())
            .or_default()
            .insert(instance.id.clone(), instance);
    }

    /// Remove an instance; the route key disappears with its last instance.
    pub async fn deregister(&self, route: &str, id: &str) -> Result<()> {
        let mut services = self.services.write().await;

        let instances = services.get_mut(route).ok_or_else(|| not_found(route, id))?;
        if instances.remove(id).is_none() {
            return Err(not_found(route, id));
        }
        if instances.is_empty() {
            services.remove(route);
        }

        info!(route, id, "deregistered service");
        Ok(())
    }

    /// Snapshot of a route's instances; empty when the route is unknown.
    pub async fn get_services(&self, route: &str) -> Vec<ServiceInstance> {
        let services = self.services.read().await;
        services
            .get(route)
            .map(|instances| instances.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every registered route pattern.
    pub async fn get_all_routes(&self) -> Vec<String> {
        let services = self.services.read().await;
        services.keys().cloned().collect()
    }

    /// Snapshot of all instances grouped by route.
    pub async fn all_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        let services = self.services.read().await;
        services
            .iter()
            .map(|(route, instances)| {
                (route.clone(), instances.values().cloned().collect())
            })
            .collect()
    }

    /// Set an instance's health label, refreshing `last_seen`.
    pub async fn update_health(&self, route: &str, id: &str, health: &str) -> Result<()> {
        let mut services = self.services.write().await;

        let instance = services
            .get_mut(route)
            .and_then(|instances| instances.get_mut(id))
            .ok_or_else(|| not_found(route, id))?;

        instance.health = health.to_string();
        instance.last_seen = Utc::now();
        Ok(())
    }
}

fn not_found(route: &str, id: &str) -> GatewayError {
    GatewayError::ServiceNotFound {
        route: route.to_string(),
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(route: &str, id: &str) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            url: format!("http://{}.internal:80", id),
            health: "unknown".to_string(),
            route: route.to_string(),
            metadata: HashMap::new(),
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_then_deregister_restores_route_snapshot() {
        let registry = ServiceRegistry::new();
        let before = registry.get_all_routes().await;

        registry.register(instance("/r", "s1")).await;
        assert_eq!(registry.get_all_routes().await, vec!["/r".to_string()]);

        registry.deregister("/r", "s1").await.unwrap();
        assert_eq!(registry.get_all_routes().await, before);
    }

    #[tokio::test]
    async fn register_is_an_upsert() {
        let registry = ServiceRegistry::new();
        registry.register(instance("/r", "s1")).await;

        let mut updated = instance("/r", "s1");
        updated.url = "http://replacement:80".to_string();
        registry.register(updated).await;

        let services = registry.get_services("/r").await;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].url, "http://replacement:80");
    }

    #[tokio::test]
    async fn route_key_survives_while_instances_remain() {
        let registry = ServiceRegistry::new();
        registry.register(instance("/r", "s1")).await;
        registry.register(instance("/r", "s2")).await;

        registry.deregister("/r", "s1").await.unwrap();
        assert_eq!(registry.get_all_routes().await, vec!["/r".to_string()]);
        assert_eq!(registry.get_services("/r").await.len(), 1);
    }

    #[tokio::test]
    async fn deregister_unknown_instance_fails() {
        let registry = ServiceRegistry::new();
        assert!(matches!(
            registry.deregister("/r", "s1").await,
            Err(GatewayError::ServiceNotFound { .. })
        ));

        registry.register(instance("/r", "s1")).await;
        assert!(matches!(
            registry.deregister("/r", "nope").await,
            Err(GatewayError::ServiceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn update_health_refreshes_last_seen() {
        let registry = ServiceRegistry::new();
        registry.register(instance("/r", "s1")).await;
        let registered_at = registry.get_services("/r").await[0].last_seen;

        registry.update_health("/r", "s1", "healthy").await.unwrap();
        let updated = &registry.get_services("/r").await[0];
        assert_eq!(updated.health, "healthy");
        assert!(updated.last_seen >= registered_at);

        assert!(matches!(
            registry.update_health("/r", "missing", "healthy").await,
            Err(GatewayError::ServiceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn snapshots_are_isolated_from_later_mutations() {
        let registry = ServiceRegistry::new();
        registry.register(instance("/r", "s1")).await;

        let snapshot = registry.get_services("/r").await;
        registry.deregister("/r", "s1").await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(registry.get_services("/r").await.is_empty());
    }
}
