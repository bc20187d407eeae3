//! Metrics and admin HTTP server.
//!
//! Serves Prometheus metrics on a configurable path, plus JSON endpoints for
//! inspecting and changing the server pool at runtime:
//!
//! - `GET /stats` global request metrics
//! - `GET /servers`, `GET /servers/{id}` per-server metrics
//! - `POST /servers` register a server from a JSON descriptor
//! - `DELETE /servers/{id}` deregister a server

use crate::backend::{Router, ServerDescriptor};
use crate::config::validate_server;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Largest accepted admin request body.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Metrics and admin HTTP server.
pub struct MetricsServer {
    /// Bound listener.
    listener: TcpListener,
    /// Path for metrics endpoint.
    path: String,
    /// Router being observed.
    router: Router,
}

impl MetricsServer {
    /// Bind the metrics server.
    pub async fn bind(address: SocketAddr, path: String, router: Router) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            path,
            router,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the server until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        match self.listener.local_addr() {
            Ok(address) => info!(address = %address, path = %self.path, "metrics server started"),
            Err(e) => warn!(error = %e, "metrics server started on unknown address"),
        }

        let router = self.router;
        let path = Arc::new(self.path);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let router = router.clone();
                            let path = Arc::clone(&path);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let router = router.clone();
                                    let path = Arc::clone(&path);
                                    async move { handle_request(req, &router, &path).await }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

/// Handle an incoming metrics or admin request.
async fn handle_request(
    req: Request<Incoming>,
    router: &Router,
    metrics_path: &str,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(path = %path, method = %method, "admin request");

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, _) if path == metrics_path => prometheus_text(router),
        (&Method::GET, ["health"]) => text(StatusCode::OK, "OK\n"),
        (&Method::GET, ["stats"]) => json(StatusCode::OK, &router.global_metrics()),
        (&Method::GET, ["servers"]) => json(StatusCode::OK, &router.server_metrics()),
        (&Method::GET, ["servers", id]) => match router.server_metrics_for(id) {
            Ok(metrics) => json(StatusCode::OK, &metrics),
            Err(e) => error_json(StatusCode::NOT_FOUND, e.to_string()),
        },
        (&Method::POST, ["servers"]) => add_server(req, router).await,
        (&Method::DELETE, ["servers", id]) => {
            if router.remove_server(id) {
                empty(StatusCode::NO_CONTENT)
            } else {
                error_json(StatusCode::NOT_FOUND, format!("server not found: {}", id))
            }
        }
        (_, ["health"] | ["stats"] | ["servers"] | ["servers", _]) => {
            text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n")
        }
        _ if path == metrics_path => text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n"),
        _ => text(StatusCode::NOT_FOUND, "Not found\n"),
    };

    Ok(response)
}

/// Register a server from a JSON descriptor body.
async fn add_server(req: Request<Incoming>, router: &Router) -> Response<Full<Bytes>> {
    let body = match read_body(req.into_body()).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let descriptor: ServerDescriptor = match serde_json::from_slice(&body) {
        Ok(d) => d,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, format!("invalid server: {}", e)),
    };

    let problems = validate_server(&descriptor);
    if !problems.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, problems.join("; "));
    }

    let id = descriptor.id.clone();
    if !router.add_server(descriptor) {
        return error_json(StatusCode::CONFLICT, format!("server already registered: {}", id));
    }

    match router.server_metrics_for(&id) {
        Ok(metrics) => json(StatusCode::CREATED, &metrics),
        // Removed again by a concurrent request
        Err(e) => error_json(StatusCode::NOT_FOUND, e.to_string()),
    }
}

/// Collect a request body, giving up once it exceeds `MAX_BODY_BYTES`.
async fn read_body<B>(body: B) -> Result<Bytes, Response<Full<Bytes>>>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(error_json(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("body exceeds {} bytes", MAX_BODY_BYTES),
        )),
        Err(e) => Err(error_json(
            StatusCode::BAD_REQUEST,
            format!("failed to read body: {}", e),
        )),
    }
}

fn prometheus_text(router: &Router) -> Response<Full<Bytes>> {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, router.metrics().registry()) {
        error!(error = %e, "failed to encode metrics");
        return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics\n");
    }

    build(
        StatusCode::OK,
        "text/plain; version=0.0.4; charset=utf-8",
        Bytes::from(buffer),
    )
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_json(status: StatusCode, error: String) -> Response<Full<Bytes>> {
    json(status, &ErrorBody { error })
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => build(status, "application/json", Bytes::from(body)),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to serialize response\n")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    build(status, "text/plain", Bytes::from_static(body.as_bytes()))
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn build(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}
