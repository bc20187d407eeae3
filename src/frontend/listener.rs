//! Frontend listener implementation.
//!
//! Accepts client HTTP/1.1 connections, turns each request into a routed
//! [`Request`] and writes back whatever the router answers.

use crate::backend::Router;
use crate::config::FrontendConfig;
use crate::message::{Request, Response};
use crate::util::RequestId;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Response headers that are recomputed for the client connection.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding", "content-length"];

/// Frontend listener that accepts and handles connections.
pub struct FrontendListener {
    /// Frontend configuration.
    config: Arc<FrontendConfig>,
    /// Router handling every request.
    router: Router,
    /// TCP listener.
    listener: TcpListener,
}

impl FrontendListener {
    /// Create a new frontend listener.
    pub async fn bind(config: FrontendConfig, router: Router) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;

        info!(
            listen = %config.listen,
            algorithm = router.algorithm(),
            "frontend listener bound"
        );

        Ok(Self {
            config: Arc::new(config),
            router,
            listener,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    #[instrument(skip_all, fields(listen = %self.config.listen))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("frontend listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("frontend listener shutting down");
                    break;
                }
            }
        }
    }

    /// Handle an incoming connection.
    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let router = self.router.clone();
        let config = Arc::clone(&self.config);

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let router = router.clone();
                let config = Arc::clone(&config);
                async move { serve(req, client_addr, &router, &config).await }
            });

            // Serve HTTP/1.1 with keep-alive support
            if let Err(e) = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, service)
                .await
            {
                debug!(client = %client_addr, error = %e, "client connection error");
            }
        });
    }
}

/// Route one client request.
async fn serve(
    req: hyper::Request<Incoming>,
    client_addr: SocketAddr,
    router: &Router,
    config: &FrontendConfig,
) -> Result<hyper::Response<Full<Bytes>>, Infallible> {
    let request = match to_routed_request(req, client_addr, config).await {
        Ok(request) => request,
        Err(e) => {
            warn!(client = %client_addr, error = %e, "failed to read client request");
            return Ok(to_hyper_response(Response::synthetic(400, "Bad request\n")));
        }
    };

    let request_id = request.id.clone();
    let method = request.method.clone();
    let path = request.path.clone();

    let response = router.handle_request(request).await;

    info!(
        request_id = %request_id,
        client = %client_addr,
        method = %method,
        path = %path,
        status = response.status_code,
        server = response.server_id.as_deref().unwrap_or("-"),
        duration_ms = response.response_time_ms,
        "request completed"
    );

    Ok(to_hyper_response(response))
}

/// Build a routed request from an incoming hyper request.
async fn to_routed_request(
    req: hyper::Request<Incoming>,
    client_addr: SocketAddr,
    config: &FrontendConfig,
) -> Result<Request, hyper::Error> {
    let (parts, body) = req.into_parts();

    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let body = body.collect().await?.to_bytes();

    let mut request = Request {
        id: String::new(),
        method: parts.method.as_str().to_string(),
        path,
        headers,
        client_ip: client_addr.ip(),
        session_id: None,
        timestamp: SystemTime::now(),
        body,
    };
    request.id = RequestId::from_header(request.header("x-request-id")).into_string();
    request.session_id = session_id(&request, config);

    Ok(request)
}

/// Session ID from the configured header, falling back to the cookie.
fn session_id(request: &Request, config: &FrontendConfig) -> Option<String> {
    let header_name = config.session_header.to_ascii_lowercase();
    if let Some(value) = request.header(&header_name).map(str::trim) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    request.header("cookie").and_then(|cookies| {
        cookies.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name.trim() == config.session_cookie && !value.trim().is_empty())
                .then(|| value.trim().to_string())
        })
    })
}

/// Convert the router's response for the client.
fn to_hyper_response(response: Response) -> hyper::Response<Full<Bytes>> {
    let mut out = hyper::Response::new(Full::new(response.body));
    *out.status_mut() = hyper::StatusCode::from_u16(response.status_code)
        .unwrap_or(hyper::StatusCode::BAD_GATEWAY);

    let headers = out.headers_mut();
    for (name, value) in &response.headers {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    if let Some(server_id) = &response.server_id {
        if let Ok(value) = HeaderValue::from_str(server_id) {
            headers.insert("x-served-by", value);
        }
    }

    out
}
