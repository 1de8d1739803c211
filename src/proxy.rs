use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolError};
use crate::registry::{AppRegistry, INTERNAL_PATH_PREFIX};
use crate::runtime::RuntimeRegistry;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Everything a request needs to be routed
struct Router {
    apps: Arc<AppRegistry>,
    runtime: Arc<RuntimeRegistry>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

/// Host-based reverse proxy in front of the managed apps
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        apps: Arc<AppRegistry>,
        runtime: Arc<RuntimeRegistry>,
        pool: Arc<ConnectionPool>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router: Arc::new(Router {
                apps,
                runtime,
                pool,
                request_timeout,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<Router>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { handle_request(req, router, addr).await }
    });

    // HTTP/1.1 and h2c on the same port
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    router: Arc<Router>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Reserved for management, whatever the host
    if req.uri().path().starts_with(INTERNAL_PATH_PREFIX) {
        debug!(path = %req.uri().path(), "Rejected request for internal path");
        return Ok(json_error_response(
            ProxyErrorCode::InternalPath,
            "Path is reserved",
        ));
    }

    let Some(hostname) = extract_hostname(&req) else {
        return Ok(json_error_response(
            ProxyErrorCode::UnknownHost,
            "Missing or invalid Host header",
        ));
    };

    let Some(name) = router.apps.resolve_host(&hostname) else {
        debug!(hostname, "No app for host");
        return Ok(json_error_response(
            ProxyErrorCode::UnknownHost,
            "Unknown or unconfigured host",
        ));
    };

    let port = match router.apps.lookup_by_name(name) {
        Some(app) if router.runtime.is_published(name) => app.listen_port,
        _ => {
            debug!(hostname, app = name, state = ?router.runtime.state(name), "App not running");
            return Ok(json_error_response(
                ProxyErrorCode::AppUnavailable,
                "App is not running",
            ));
        }
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this proxy is the first trusted hop.
    let original_host = req
        .headers()
        .get(hyper::header::HOST)
        .cloned()
        .or_else(|| HeaderValue::from_str(&hostname).ok());
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname, app = name, port, method = %req.method(), uri = %req.uri(), request_id, "Forwarding request");

    let request_timeout = router.request_timeout;
    match tokio::time::timeout(request_timeout, router.pool.send_request(req, port)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(PoolError::RequestBuild(e))) => {
            error!(app = name, port, error = %e, "Failed to build upstream request");
            Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Internal proxy error",
            ))
        }
        Ok(Err(e)) => {
            // Details stay in the log
            warn!(app = name, port, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to app",
            ))
        }
        Err(_) => {
            warn!(
                app = name,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::UpstreamTimeout,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Host header, or the URI authority for HTTP/2
fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    let raw = match req.headers().get(hyper::header::HOST) {
        Some(h) => h.to_str().ok()?,
        None => req.uri().host()?,
    };
    normalize_hostname(raw)
}

/// Strip the port, validate, lower-case
fn normalize_hostname(raw: &str) -> Option<String> {
    let hostname = raw.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Rejects anything that could smuggle into logs
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("a.example.com"), Some("a.example.com".to_string()));
        assert_eq!(normalize_hostname("A.Example.COM:8080"), Some("a.example.com".to_string()));
        assert_eq!(normalize_hostname("localhost:80"), Some("localhost".to_string()));
    }

    #[test]
    fn test_normalize_hostname_rejects_invalid() {
        assert_eq!(normalize_hostname(""), None);
        assert_eq!(normalize_hostname(":8080"), None);
        assert_eq!(normalize_hostname("a b.com"), None);
        assert_eq!(normalize_hostname("evil.com\r\nX-Injected: 1"), None);
        assert_eq!(normalize_hostname(&"a".repeat(MAX_HOSTNAME_LEN + 1)), None);
        assert!(normalize_hostname(&"a".repeat(MAX_HOSTNAME_LEN)).is_some());
    }
}
