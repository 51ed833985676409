use std::future::Future;
use std::time::Duration;

use crate::config::TimeoutConfig;
use crate::error::{GatewayError, Result};

/// Layered deadlines: the request budget wraps the whole retry loop, the
/// backend budget bounds a single forwarded call. Validation guarantees
/// backend <= request and connect <= backend.
#[derive(Debug, Clone)]
pub struct TimeoutBudget {
    config: TimeoutConfig,
}

impl TimeoutBudget {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    pub fn backend_timeout(&self) -> Duration {
        self.config.backend_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    /// Bound `fut` by the overall request budget. Expiry drops the inner
    /// future (cancelling any pending attempt, backoff sleep or bulkhead
    /// wait) and surfaces as a request timeout.
    pub async fn with_request_budget<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .map_err(|_| GatewayError::RequestTimeout)?
    }
}
