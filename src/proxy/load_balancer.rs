use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use tracing::debug;

use crate::config::LoadBalancerStrategy;
use crate::error::{GatewayError, Result};
use crate::proxy::upstream::Backend;

/// Selects one backend from the selectable subset of a route's backends.
///
/// One instance exists per route; the least-connections counters are keyed by
/// backend URL and mutated by the proxy through [`ConnectionGuard`]s.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: LoadBalancerStrategy,
    counter: AtomicU64,
    connections: Mutex<HashMap<String, u64>>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancerStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn select(&self, backends: &[Arc<Backend>]) -> Result<Arc<Backend>> {
        let selectable: Vec<&Arc<Backend>> =
            backends.iter().filter(|b| b.is_selectable()).collect();
        if selectable.is_empty() {
            return Err(GatewayError::NoAvailableBackend);
        }

        let selected = match self.strategy {
            LoadBalancerStrategy::RoundRobin => {
                let idx =
                    self.counter.fetch_add(1, Ordering::Relaxed) as usize % selectable.len();
                selectable[idx]
            }
            LoadBalancerStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..selectable.len());
                selectable[idx]
            }
            LoadBalancerStrategy::LeastConnections => {
                let connections = self.lock();
                let mut min = u64::MAX;
                let mut choice = selectable[0];
                for &backend in &selectable {
                    let in_flight = connections.get(backend.url()).copied().unwrap_or(0);
                    if in_flight < min {
                        min = in_flight;
                        choice = backend;
                    }
                }
                choice
            }
        };

        debug!(url = selected.url(), strategy = self.strategy_name(), "selected backend");
        Ok(selected.clone())
    }

    /// Start tracking an in-flight request for least-connections accounting.
    /// Returns `None` for strategies that do not track connections.
    pub fn track(self: &Arc<Self>, url: &str) -> Option<ConnectionGuard> {
        if self.strategy != LoadBalancerStrategy::LeastConnections {
            return None;
        }
        *self.lock().entry(url.to_string()).or_insert(0) += 1;
        Some(ConnectionGuard {
            balancer: self.clone(),
            url: url.to_string(),
        })
    }

    pub fn connection_count(&self, url: &str) -> u64 {
        self.lock().get(url).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "strategy": self.strategy_name(),
            "connections": self.lock().clone(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pairs every in-flight increment with a decrement on all exit paths.
#[derive(Debug)]
pub struct ConnectionGuard {
    balancer: Arc<LoadBalancer>,
    url: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut connections = self.balancer.lock();
        if let Some(count) = connections.get_mut(&self.url) {
            *count = count.saturating_sub(1);
        }
    }
}
