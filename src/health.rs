use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::Client;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::HealthCheckConfig;
use crate::proxy::upstream::RouteTable;
use crate::registry::{ServiceInstance, ServiceRegistry};

/// Background prober that keeps registry health labels current.
///
/// Every tick it snapshots the registered instances and probes them in
/// parallel. The consecutive-failure counters live here, not in the
/// registry; they are process-local and reset by a single healthy probe.
/// When a probed URL matches a statically configured backend, the result is
/// mirrored into that backend's `healthy` flag.
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    table: Arc<RouteTable>,
    config: HealthCheckConfig,
    client: Client,
    failures: Mutex<HashMap<String, u32>>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        table: Arc<RouteTable>,
        config: HealthCheckConfig,
    ) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(format!(
                "{}-healthcheck/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .expect("failed to create HTTP client for health checks");

        Self {
            registry,
            table,
            config,
            client,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Probe loop; runs until the owning task is aborted.
    pub async fn run(self: Arc<Self>) {
        info!(interval = ?self.config.interval, "health checker started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so freshly registered
        // services get a full interval before their first probe.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.check_once().await;
        }
    }

    /// One full pass: snapshot all instances and probe them in parallel.
    pub async fn check_once(self: &Arc<Self>) {
        let mut probes = JoinSet::new();
        for (_, instances) in self.registry.all_services().await {
            for instance in instances {
                let checker = self.clone();
                probes.spawn(async move {
                    let healthy = checker.probe(&instance).await;
                    checker.record(&instance, healthy).await;
                });
            }
        }
        while probes.join_next().await.is_some() {}
    }

    /// A probe is healthy iff `GET url + health_endpoint` returns 200.
    async fn probe(&self, instance: &ServiceInstance) -> bool {
        let url = format!(
            "{}{}",
            instance.url.trim_end_matches('/'),
            self.config.health_endpoint
        );

        match self.client.get(&url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url, error = %e, "health probe failed");
                false
            }
        }
    }

    async fn record(&self, instance: &ServiceInstance, healthy: bool) {
        if healthy {
            self.lock().remove(&instance.id);
            self.set_health(instance, "healthy").await;
            return;
        }

        let failures = {
            let mut map = self.lock();
            let count = map.entry(instance.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if failures >= self.config.failure_limit {
            warn!(
                id = %instance.id,
                url = %instance.url,
                failures,
                "marking service unhealthy"
            );
            self.set_health(instance, "unhealthy").await;
        }
    }

    async fn set_health(&self, instance: &ServiceInstance, health: &str) {
        // The instance may have been deregistered since the snapshot.
        if let Err(e) = self
            .registry
            .update_health(&instance.route, &instance.id, health)
            .await
        {
            debug!(error = %e, "skipping health update");
            return;
        }

        if let Some(backend) = self.table.backend(&instance.url) {
            backend.set_healthy(health == "healthy");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
