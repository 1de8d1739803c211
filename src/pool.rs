//! Pooled HTTP client for talking to managed apps
//!
//! Shared by the proxy (forwarding client requests) and the health monitor
//! (heartbeat probes), so keep-alive connections to an app are reused.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per app
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Result of one heartbeat probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// Answered 200
    Healthy,
    /// Answered with another status
    Status(StatusCode),
    /// Connection refused, reset, or no answer in time
    Unreachable,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// A connection pool for HTTP connections to managed apps
pub struct ConnectionPool {
    /// Client for proxied requests
    client: Client<HttpConnector, Incoming>,
    /// Dedicated client for heartbeat probes (uses Empty body type)
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            probe_client,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Forward a request to `127.0.0.1:port`, keeping method, path, headers and body
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!(
            "http://127.0.0.1:{}{}",
            port,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET `path` on `127.0.0.1:port`, bounded by `timeout`
    pub async fn probe(&self, port: u16, path: &str, timeout: Duration) -> ProbeResult {
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return ProbeResult::Unreachable,
        };

        match tokio::time::timeout(timeout, self.probe_client.request(req)).await {
            Ok(Ok(response)) if response.status() == StatusCode::OK => ProbeResult::Healthy,
            Ok(Ok(response)) => ProbeResult::Status(response.status()),
            Ok(Err(e)) => {
                debug!(port, path, error = %e, "Probe failed");
                ProbeResult::Unreachable
            }
            Err(_) => ProbeResult::Unreachable,
        }
    }
}
