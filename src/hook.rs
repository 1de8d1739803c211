//! Webhook listener
//!
//! Accepts GitHub webhook deliveries on any path. Only `push` events are
//! read; everything else is acknowledged with `200` and dropped.
//!
//! Neither the sender nor the payload size is checked.

use crate::dispatcher::{Dispatcher, PushNotification};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Header carrying the GitHub event name
pub const EVENT_HEADER: &str = "x-github-event";

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

pub struct HookServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HookServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            dispatcher,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Webhook server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = serve_hook_connection(stream, dispatcher).await {
                                    debug!(addr = %addr, error = %e, "Webhook connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept webhook connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Webhook server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_hook_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { handle_hook_request(req, dispatcher).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Webhook connection error: {}", e))?;

    Ok(())
}

async fn handle_hook_request(
    req: Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let event = req
        .headers()
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    debug!(method = %req.method(), path = %req.uri().path(), event = %event, "Webhook delivery");

    if event != "push" {
        return Ok(response(StatusCode::OK, "ignored"));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read push payload");
            return Ok(response(StatusCode::BAD_REQUEST, "unreadable body"));
        }
    };

    let notification = match PushNotification::from_slice(&body) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Invalid push payload");
            return Ok(response(StatusCode::BAD_REQUEST, "invalid push payload"));
        }
    };

    let outcome = dispatcher.on_push_notification(&event, &notification);
    Ok(response(StatusCode::OK, outcome.as_str()))
}
