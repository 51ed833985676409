use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub routes: Vec<RouteConfig>,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub bulkhead: BulkheadConfig,
    pub health_check: HealthCheckConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub pattern: String,
    #[serde(default)]
    pub strategy: LoadBalancerStrategy,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub strip_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub healthy: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
}

impl LoadBalancerStrategy {
    /// Strategy name as reported in the `X-Load-Balancer` header.
    pub fn name(&self) -> &'static str {
        match self {
            LoadBalancerStrategy::RoundRobin => "RoundRobin",
            LoadBalancerStrategy::Random => "Random",
            LoadBalancerStrategy::LeastConnections => "LeastConnections",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Overall request timeout (client -> gateway -> backend -> client).
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Per-attempt timeout (gateway -> backend).
    #[serde(with = "duration_serde")]
    pub backend_timeout: Duration,
    /// TCP connection timeout.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            backend_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_serde")]
    pub initial_delay: Duration,
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Successful half-open probes before the breaker closes.
    pub success_threshold: u32,
    /// How long the breaker stays open before probing again.
    #[serde(with = "duration_serde")]
    pub open_timeout: Duration,
    /// Probe budget while half-open.
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            max_half_open_requests: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    #[serde(with = "duration_serde")]
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_capacity: 5,
            queue_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub failure_limit: u32,
    pub health_endpoint: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_limit: 3,
            health_endpoint: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Cap on a buffered upstream response body.
    pub max_response_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::builtin(false)
    }
}

impl Config {
    /// Built-in route table, mirroring the default deployment layout.
    /// `use_localhost` swaps the docker host alias for localhost.
    pub fn builtin(use_localhost: bool) -> Self {
        let host = if use_localhost {
            "localhost"
        } else {
            "host.docker.internal"
        };

        let backend = |port: u16| BackendConfig {
            url: format!("http://{}:{}", host, port),
            weight: 1,
            healthy: true,
        };

        Self {
            server: ServerConfig::default(),
            routes: vec![
                RouteConfig {
                    pattern: "/api/users/*".to_string(),
                    strategy: LoadBalancerStrategy::RoundRobin,
                    backends: vec![backend(8001)],
                    strip_prefix: None,
                },
                RouteConfig {
                    pattern: "/api/products/*".to_string(),
                    strategy: LoadBalancerStrategy::RoundRobin,
                    backends: vec![backend(8002)],
                    strip_prefix: None,
                },
            ],
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            bulkhead: BulkheadConfig::default(),
            health_check: HealthCheckConfig::default(),
            limits: LimitsConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.routes.is_empty() {
            anyhow::bail!("At least one route must be configured");
        }

        for route in &self.routes {
            if route.pattern.is_empty() {
                anyhow::bail!("Route pattern cannot be empty");
            }
            if route.backends.is_empty() {
                anyhow::bail!("Route '{}' must have at least one backend", route.pattern);
            }
            for backend in &route.backends {
                if backend.url.is_empty() {
                    anyhow::bail!("Backend URL cannot be empty in route '{}'", route.pattern);
                }
                if !backend.url.starts_with("http://") && !backend.url.starts_with("https://") {
                    anyhow::bail!(
                        "Backend URL '{}' in route '{}' must be absolute",
                        backend.url,
                        route.pattern
                    );
                }
                if backend.weight == 0 {
                    anyhow::bail!("Backend weight cannot be zero in route '{}'", route.pattern);
                }
            }
        }

        if self.timeouts.backend_timeout > self.timeouts.request_timeout {
            anyhow::bail!("backend-timeout must not exceed request-timeout");
        }
        if self.timeouts.connect_timeout > self.timeouts.backend_timeout {
            anyhow::bail!("connect-timeout must not exceed backend-timeout");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry max_attempts must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            anyhow::bail!("retry multiplier must be at least 1.0");
        }

        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
        {
            anyhow::bail!("circuit breaker thresholds must be at least 1");
        }

        if self.bulkhead.max_concurrent == 0 {
            anyhow::bail!("bulkhead max_concurrent must be at least 1");
        }

        if self.health_check.failure_limit == 0 {
            anyhow::bail!("health check failure_limit must be at least 1");
        }

        Ok(())
    }
}

/// Parse a human-readable duration: `250ms`, `5s`, `2m`, `1h`, or bare seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (value, unit): (&str, fn(u64) -> Duration) = if let Some(v) = s.strip_suffix("ms") {
        (v, Duration::from_millis)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, Duration::from_secs)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, |n| Duration::from_secs(n * 60))
    } else if let Some(v) = s.strip_suffix('h') {
        (v, |n| Duration::from_secs(n * 3600))
    } else {
        (s, Duration::from_secs)
    };

    value
        .parse::<u64>()
        .map(unit)
        .map_err(|e| format!("invalid duration '{}': {}", s, e))
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
