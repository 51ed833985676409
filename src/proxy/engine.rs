use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::Request,
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::{Config, LimitsConfig};
use crate::error::{GatewayError, Result as GatewayResult};
use crate::proxy::load_balancer::LoadBalancer;
use crate::proxy::retry::RetryPolicy;
use crate::proxy::timeout::TimeoutBudget;
use crate::proxy::upstream::{Backend, Route, RouteTable};
use crate::proxy::{is_hop_by_hop_header, BufferedResponse};

const GATEWAY_NAME: &str = env!("CARGO_PKG_NAME");
const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Headers the gateway owns on the forwarded request. Client-supplied values
/// are dropped so the injected ones are authoritative.
const GATEWAY_HEADERS: [&str; 4] = [
    "x-forwarded-by",
    "x-gateway-version",
    "x-backend-url",
    "x-load-balancer",
];

/// The request-path orchestrator: matches a route, then runs the retry loop
/// of select backend -> bulkhead admission -> deadline-bounded forward ->
/// buffered capture, recording circuit-breaker outcomes along the way.
pub struct Gateway {
    table: Arc<RouteTable>,
    balancers: RwLock<HashMap<String, Arc<LoadBalancer>>>,
    retry: RetryPolicy,
    budget: TimeoutBudget,
    limits: LimitsConfig,
    client: reqwest::Client,
}

/// The outbound view of the client request, buffered once so every retry
/// attempt replays the same method, headers, body and query string.
struct ForwardedRequest {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

impl Gateway {
    pub fn new(config: &Config) -> Result<Self> {
        let budget = TimeoutBudget::new(config.timeouts.clone());

        let client = reqwest::Client::builder()
            .timeout(budget.backend_timeout())
            .connect_timeout(budget.connect_timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .user_agent(format!("{}/{}", GATEWAY_NAME, GATEWAY_VERSION))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            table: Arc::new(RouteTable::from_config(config)),
            balancers: RwLock::new(HashMap::new()),
            retry: RetryPolicy::new(config.retry.clone()),
            budget,
            limits: config.limits.clone(),
            client,
        })
    }

    /// The routing table is shared with the health checker so active probes
    /// can flip backend health.
    pub fn route_table(&self) -> Arc<RouteTable> {
        self.table.clone()
    }

    /// Full request lifecycle under the request budget. Budget exhaustion
    /// cancels whatever the pipeline is waiting on and yields 504.
    #[instrument(skip(self, req), fields(request_id = %Uuid::new_v4(), method = %req.method(), path = %req.uri().path()))]
    pub async fn handle(&self, req: Request) -> Response {
        match self.budget.with_request_budget(self.proxy_request(req)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "request failed");
                err.into_response()
            }
        }
    }

    async fn proxy_request(&self, req: Request) -> GatewayResult<Response> {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();

        let route = self
            .table
            .match_route(&path)
            .ok_or_else(|| GatewayError::RouteNotFound(path.clone()))?;
        let balancer = self.balancer_for(route).await;

        let body = body
            .collect()
            .await
            .map_err(|e| GatewayError::InvalidRequest(format!("failed to read request body: {}", e)))?
            .to_bytes();

        let outbound = Arc::new(ForwardedRequest {
            method: parts.method,
            path,
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
            body,
        });

        // Last backend an attempt actually reached. Exactly one breaker
        // outcome is recorded per request, after the loop, derived from the
        // final attempt's status.
        let last_backend: Mutex<Option<Arc<Backend>>> = Mutex::new(None);
        let last_used = &last_backend;

        let result = self
            .retry
            .run(|attempt| {
                let outbound = Arc::clone(&outbound);
                let balancer = Arc::clone(&balancer);
                async move {
                    self.forward_once(route, &balancer, &outbound, attempt, last_used)
                        .await
                }
            })
            .await;

        let last_backend = last_backend
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(backend) = last_backend {
            match &result {
                Ok(_) => backend.circuit_breaker().record_success(),
                Err(
                    GatewayError::UpstreamStatus(_)
                    | GatewayError::Transport(_)
                    | GatewayError::ConnectFailed(_)
                    | GatewayError::BackendTimeout
                    | GatewayError::ResponseTooLarge,
                ) => backend.circuit_breaker().record_failure(),
                // The final attempt never produced a backend outcome (e.g.
                // no selectable backend, bulkhead rejection): nothing to
                // record.
                Err(_) => {}
            }
        }

        result.map(BufferedResponse::into_response)
    }

    /// One attempt: select, admit, forward, buffer. A 5xx response surfaces
    /// as a retryable error; the bulkhead permit and in-flight guard release
    /// on every exit path. Breaker outcomes are recorded by the caller, once
    /// per request.
    async fn forward_once(
        &self,
        route: &Route,
        balancer: &Arc<LoadBalancer>,
        outbound: &ForwardedRequest,
        attempt: u32,
        last_backend: &Mutex<Option<Arc<Backend>>>,
    ) -> GatewayResult<BufferedResponse> {
        let backend = balancer.select(route.backends())?;

        let bulkhead = self
            .table
            .bulkhead(backend.url())
            .ok_or_else(|| GatewayError::Internal(format!("no bulkhead for {}", backend.url())))?;
        let _permit = bulkhead.acquire().await?;
        let _in_flight = balancer.track(backend.url());

        *last_backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(backend.clone());

        let target = target_url(route, &backend, outbound);
        debug!(attempt, target = %target, "forwarding request");

        let mut request = self.client.request(outbound.method.clone(), &target);
        for (name, value) in outbound.headers.iter() {
            if is_hop_by_hop_header(name)
                || name == header::HOST
                || name == header::CONTENT_LENGTH
                || GATEWAY_HEADERS.contains(&name.as_str())
            {
                continue;
            }
            request = request.header(name, value);
        }
        request = request
            .header("X-Forwarded-By", GATEWAY_NAME)
            .header("X-Gateway-Version", GATEWAY_VERSION)
            .header("X-Backend-URL", backend.url())
            .header("X-Load-Balancer", balancer.strategy_name());
        if !outbound.body.is_empty() {
            request = request.body(outbound.body.clone());
        }

        let mut response = request.send().await.map_err(classify_forward_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify_forward_error)? {
            if body.len() + chunk.len() > self.limits.max_response_bytes {
                return Err(GatewayError::ResponseTooLarge);
            }
            body.extend_from_slice(&chunk);
        }

        if status.as_u16() >= 500 {
            warn!(status = status.as_u16(), url = backend.url(), "backend returned server error");
            return Err(GatewayError::UpstreamStatus(status.as_u16()));
        }

        Ok(BufferedResponse {
            status,
            headers,
            body: Bytes::from(body),
        })
    }

    /// Returns the cached load balancer for the route, creating it on first
    /// use (double-checked under the write lock).
    async fn balancer_for(&self, route: &Route) -> Arc<LoadBalancer> {
        {
            let balancers = self.balancers.read().await;
            if let Some(balancer) = balancers.get(route.pattern()) {
                return balancer.clone();
            }
        }

        let mut balancers = self.balancers.write().await;
        if let Some(balancer) = balancers.get(route.pattern()) {
            return balancer.clone();
        }

        let balancer = Arc::new(LoadBalancer::new(route.strategy()));
        debug!(
            pattern = route.pattern(),
            strategy = balancer.strategy_name(),
            "created load balancer for route"
        );
        balancers.insert(route.pattern().to_string(), balancer.clone());
        balancer
    }

    pub async fn stats(&self) -> serde_json::Value {
        let balancers = self.balancers.read().await;
        let balancer_stats: HashMap<String, serde_json::Value> = balancers
            .iter()
            .map(|(pattern, balancer)| (pattern.clone(), balancer.stats()))
            .collect();

        serde_json::json!({
            "routing": self.table.stats(),
            "load_balancers": balancer_stats,
        })
    }
}

fn target_url(route: &Route, backend: &Backend, outbound: &ForwardedRequest) -> String {
    let path = match route.strip_prefix() {
        Some(prefix) => outbound.path.strip_prefix(prefix).unwrap_or(&outbound.path),
        None => outbound.path.as_str(),
    };
    let path = if path.is_empty() { "/" } else { path };

    let mut target = String::from(backend.url().trim_end_matches('/'));
    if !path.starts_with('/') {
        target.push('/');
    }
    target.push_str(path);
    if let Some(query) = &outbound.query {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// Classify a forwarding failure once, at the attempt boundary. Typed kinds
/// (timeout, connect) are preferred; everything else keeps the full error
/// chain so the substring fallback can still recognize it.
fn classify_forward_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::BackendTimeout
    } else if err.is_connect() {
        GatewayError::ConnectFailed(format!("{:#}", anyhow::Error::new(err)))
    } else {
        GatewayError::Transport(format!("{:#}", anyhow::Error::new(err)))
    }
}
