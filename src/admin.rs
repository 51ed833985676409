use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::{GatewayError, Result};
use crate::proxy::Gateway;
use crate::registry::{ServiceInstance, ServiceRegistry};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub registry: Arc<ServiceRegistry>,
}

/// The gateway's full HTTP surface: registry administration, liveness,
/// stats, and the catch-all proxy handler for everything else.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/registry/register", post(register))
        .route("/registry/deregister/:id", delete(deregister))
        .route("/registry/services", get(all_services))
        .route("/registry/services/*route", get(services_by_route))
        .route("/gateway/stats", get(stats))
        .fallback(proxy)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
    }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    route: String,
    health: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    if body.id.is_empty() {
        return Err(GatewayError::MissingField("id"));
    }
    if body.url.is_empty() {
        return Err(GatewayError::MissingField("url"));
    }
    if body.route.is_empty() {
        return Err(GatewayError::MissingField("route"));
    }

    state
        .registry
        .register(ServiceInstance {
            id: body.id,
            url: body.url,
            route: body.route,
            health: body.health.unwrap_or_else(|| "unknown".to_string()),
            metadata: body.metadata,
            last_seen: Utc::now(),
        })
        .await;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": { "message": "service registered successfully" } })),
    ))
}

#[derive(Debug, Deserialize)]
struct RouteQuery {
    route: Option<String>,
}

async fn deregister(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RouteQuery>,
) -> Result<impl IntoResponse> {
    let route = query
        .route
        .filter(|route| !route.is_empty())
        .ok_or(GatewayError::MissingField("route"))?;

    state.registry.deregister(&route, &id).await?;

    Ok(Json(
        json!({ "data": { "message": "service deregistered successfully" } }),
    ))
}

async fn all_services(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "data": state.registry.all_services().await }))
}

/// The route pattern contains slashes, so it travels in the `route` query
/// parameter; the path segment is ignored.
async fn services_by_route(
    State(state): State<AppState>,
    Query(query): Query<RouteQuery>,
) -> Result<impl IntoResponse> {
    let route = query
        .route
        .filter(|route| !route.is_empty())
        .ok_or(GatewayError::MissingField("route"))?;

    let services = state.registry.get_services(&route).await;
    if services.is_empty() {
        return Err(GatewayError::NoRegisteredServices(route));
    }

    Ok(Json(json!({ "data": services })))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "data": {
            "gateway": state.gateway.stats().await,
            "registered_routes": state.registry.get_all_routes().await,
        }
    }))
}

async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    state.gateway.handle(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let config = Config::builtin(true);
        let state = AppState {
            gateway: Arc::new(Gateway::new(&config).unwrap()),
            registry: Arc::new(ServiceRegistry::new()),
        };
        router(state)
    }

    fn post_json(uri: &str, body: Value) -> Request {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn send(method: &str, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn register_list_deregister_roundtrip() {
        let app = test_router();

        let response = app
            .clone()
            .oneshot(post_json(
                "/registry/register",
                json!({ "id": "s1", "url": "http://x", "route": "/r" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(send("GET", "/registry/services"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["/r"][0]["id"], "s1");
        assert_eq!(body["data"]["/r"][0]["url"], "http://x");

        let response = app
            .clone()
            .oneshot(send("DELETE", "/registry/deregister/s1?route=/r"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(send("GET", "/registry/services"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["data"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_rejects_missing_fields() {
        let app = test_router();

        let response = app
            .clone()
            .oneshot(post_json(
                "/registry/register",
                json!({ "id": "s1", "route": "/r" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("url"));
    }

    #[tokio::test]
    async fn deregister_requires_route_param() {
        let app = test_router();
        let response = app
            .oneshot(send("DELETE", "/registry/deregister/s1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deregister_unknown_service_is_404() {
        let app = test_router();
        let response = app
            .oneshot(send("DELETE", "/registry/deregister/ghost?route=/r"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn services_by_route_uses_the_query_param() {
        let app = test_router();

        app.clone()
            .oneshot(post_json(
                "/registry/register",
                json!({ "id": "s1", "url": "http://x", "route": "/api/users/*" }),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(send(
                "GET",
                "/registry/services/lookup?route=/api/users/*",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"][0]["id"], "s1");

        let response = app
            .clone()
            .oneshot(send("GET", "/registry/services/lookup?route=/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(send("GET", "/registry/services/lookup"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy() {
        let app = test_router();
        let response = app.oneshot(send("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn stats_endpoint_exposes_breaker_snapshots() {
        let app = test_router();
        let response = app.oneshot(send("GET", "/gateway/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let backends = body["data"]["gateway"]["routing"]["backends"]
            .as_array()
            .unwrap();
        assert!(!backends.is_empty());
        assert_eq!(backends[0]["circuit_breaker"]["state"], "CLOSED");
    }
}
