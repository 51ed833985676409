pub mod bulkhead;
pub mod circuit_breaker;
pub mod engine;
pub mod load_balancer;
pub mod retry;
pub mod timeout;
pub mod upstream;

pub use engine::Gateway;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::error;

/// A fully buffered upstream response: status, headers and body captured
/// per attempt so a failed attempt never leaks partial writes to the client.
/// Only the final attempt's capture is replayed.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedResponse {
    /// Replay the captured status, headers and body to the client.
    pub fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in self.headers.iter() {
            if !is_hop_by_hop_header(name) {
                builder = builder.header(name, value);
            }
        }

        builder.body(Body::from(self.body)).unwrap_or_else(|e| {
            error!("failed to build response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
    }
}

/// Hop-by-hop headers are never forwarded in either direction.
pub(crate) fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
