use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::config::{Config, LoadBalancerStrategy};
use crate::proxy::bulkhead::Bulkhead;
use crate::proxy::circuit_breaker::CircuitBreaker;

/// A single upstream HTTP endpoint.
///
/// `healthy` starts from configuration and is flipped by the health checker;
/// the circuit breaker is shared with every other route that lists the same
/// URL.
#[derive(Debug)]
pub struct Backend {
    url: String,
    weight: u32,
    healthy: AtomicBool,
    breaker: Arc<CircuitBreaker>,
}

impl Backend {
    pub fn new(url: String, weight: u32, healthy: bool, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            url,
            weight,
            healthy: AtomicBool::new(healthy),
            breaker,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// A backend may be offered to the load balancer iff it is healthy and
    /// its breaker admits the request. Half-open admission is counted here.
    pub fn is_selectable(&self) -> bool {
        self.is_healthy() && self.breaker.can_request()
    }
}

/// A URL-pattern -> backend-set mapping with a selection strategy.
#[derive(Debug)]
pub struct Route {
    pattern: String,
    strategy: LoadBalancerStrategy,
    strip_prefix: Option<String>,
    backends: Vec<Arc<Backend>>,
}

impl Route {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn strategy(&self) -> LoadBalancerStrategy {
        self.strategy
    }

    pub fn strip_prefix(&self) -> Option<&str> {
        self.strip_prefix.as_deref()
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Pattern `P/*` prefix-matches `P`; a bare pattern matches exactly.
    pub fn matches(&self, path: &str) -> bool {
        if let Some(prefix) = self.pattern.strip_suffix("/*") {
            path.starts_with(prefix)
        } else {
            self.pattern == path
        }
    }
}

/// The gateway's routing table plus the process-wide resilience state keyed
/// by backend URL: one circuit breaker, one bulkhead and one `Backend` per
/// distinct URL, shared across routes.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Route>,
    backends: DashMap<String, Arc<Backend>>,
    bulkheads: DashMap<String, Arc<Bulkhead>>,
}

impl RouteTable {
    pub fn from_config(config: &Config) -> Self {
        let backends: DashMap<String, Arc<Backend>> = DashMap::new();
        let bulkheads: DashMap<String, Arc<Bulkhead>> = DashMap::new();

        let routes = config
            .routes
            .iter()
            .map(|route| {
                let route_backends = route
                    .backends
                    .iter()
                    .map(|backend| {
                        bulkheads
                            .entry(backend.url.clone())
                            .or_insert_with(|| {
                                Arc::new(Bulkhead::new(config.bulkhead.clone()))
                            });
                        backends
                            .entry(backend.url.clone())
                            .or_insert_with(|| {
                                let breaker = Arc::new(CircuitBreaker::new(
                                    config.circuit_breaker.clone(),
                                ));
                                Arc::new(Backend::new(
                                    backend.url.clone(),
                                    backend.weight,
                                    backend.healthy,
                                    breaker,
                                ))
                            })
                            .clone()
                    })
                    .collect();

                info!(
                    pattern = %route.pattern,
                    strategy = route.strategy.name(),
                    backends = route.backends.len(),
                    "configured route"
                );

                Route {
                    pattern: route.pattern.clone(),
                    strategy: route.strategy,
                    strip_prefix: route.strip_prefix.clone(),
                    backends: route_backends,
                }
            })
            .collect();

        Self {
            routes,
            backends,
            bulkheads,
        }
    }

    /// First matching route in declaration order wins.
    pub fn match_route(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn bulkhead(&self, url: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.get(url).map(|entry| entry.clone())
    }

    pub fn backend(&self, url: &str) -> Option<Arc<Backend>> {
        self.backends.get(url).map(|entry| entry.clone())
    }

    pub fn stats(&self) -> serde_json::Value {
        let backends: Vec<_> = self
            .backends
            .iter()
            .map(|entry| {
                let backend = entry.value();
                serde_json::json!({
                    "url": backend.url(),
                    "weight": backend.weight(),
                    "healthy": backend.is_healthy(),
                    "circuit_breaker": backend.circuit_breaker().stats(),
                })
            })
            .collect();

        let bulkheads: Vec<_> = self
            .bulkheads
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "url": entry.key(),
                    "bulkhead": entry.value().stats(),
                })
            })
            .collect();

        serde_json::json!({
            "backends": backends,
            "bulkheads": bulkheads,
        })
    }
}
