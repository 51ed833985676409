use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no route matches path: {0}")]
    RouteNotFound(String),

    #[error("no healthy backends available")]
    NoAvailableBackend,

    #[error("bulkhead queue is full")]
    BulkheadFull,

    #[error("bulkhead queue timeout")]
    BulkheadQueueTimeout,

    #[error("request timed out")]
    RequestTimeout,

    #[error("backend request timed out")]
    BackendTimeout,

    #[error("backend connection failed: {0}")]
    ConnectFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error: {0}")]
    UpstreamStatus(u16),

    #[error("upstream response exceeds the buffer limit")]
    ResponseTooLarge,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("service {id} not found for route {route}")]
    ServiceNotFound { route: String, id: String },

    #[error("no services found for route: {0}")]
    NoRegisteredServices(String),

    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NoAvailableBackend
            | GatewayError::BulkheadFull
            | GatewayError::BulkheadQueueTimeout
            | GatewayError::BackendTimeout
            | GatewayError::ConnectFailed(_)
            | GatewayError::Transport(_)
            | GatewayError::UpstreamStatus(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ResponseTooLarge => StatusCode::BAD_GATEWAY,
            GatewayError::MissingField(_) | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::ServiceNotFound { .. } | GatewayError::NoRegisteredServices(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
