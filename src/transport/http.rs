//! HTTP/1.1 transport over hyper.

use super::{Transport, TransportError, TransportResponse};
use crate::backend::ServerDescriptor;
use crate::config::Protocol;
use crate::message::Request;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, HeaderValue};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

/// Headers that describe a single hop and are not forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "host",
    "content-length",
];

/// Plain-HTTP transport, one connection per request.
#[derive(Debug, Default, Clone)]
pub struct HttpTransport;

impl HttpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(
        server = %server.id,
        method = %request.method,
        path = %request.path,
        request_id = %request.id
    ))]
    async fn send(
        &self,
        server: &ServerDescriptor,
        request: &Request,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        if server.protocol == Protocol::Https {
            return Err(TransportError::Protocol(
                "https upstreams are not supported".to_string(),
            ));
        }

        match tokio::time::timeout(timeout, exchange(server, request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("upstream request timed out");
                Err(TransportError::Timeout(timeout))
            }
        }
    }
}

async fn exchange(
    server: &ServerDescriptor,
    request: &Request,
) -> Result<TransportResponse, TransportError> {
    let stream = TcpStream::connect(server.authority())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let _ = stream.set_nodelay(true);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| TransportError::Protocol(format!("handshake failed: {}", e)))?;

    // Spawn connection driver
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!(error = %e, "upstream connection error");
        }
    });

    let outgoing = build_request(server, request)?;
    let response = sender
        .send_request(outgoing)
        .await
        .map_err(|e| TransportError::Protocol(e.to_string()))?;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| TransportError::Protocol(format!("failed to read body: {}", e)))?
        .to_bytes();

    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect::<HashMap<_, _>>();

    debug!(status = parts.status.as_u16(), bytes = body.len(), "upstream responded");

    Ok(TransportResponse {
        status: parts.status.as_u16(),
        headers,
        body,
    })
}

/// Translate a routed request into a hyper request for `server`.
fn build_request(
    server: &ServerDescriptor,
    request: &Request,
) -> Result<hyper::Request<Full<Bytes>>, TransportError> {
    let path = if request.path.is_empty() {
        "/"
    } else {
        request.path.as_str()
    };

    let mut builder = hyper::Request::builder()
        .method(request.method.as_str())
        .uri(path)
        .header(hyper::header::HOST, server.authority());

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &request.headers {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        if let Ok(value) = HeaderValue::from_str(&request.client_ip.to_string()) {
            headers.insert("x-forwarded-for", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request.id) {
            headers.insert("x-request-id", value);
        }
    }

    builder
        .body(Full::new(request.body.clone()))
        .map_err(|e| TransportError::Protocol(format!("invalid request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one connection, capture the request head, answer with `reply`.
    async fn one_shot_server(reply: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        (port, handle)
    }

    #[tokio::test]
    async fn test_send_forwards_and_collects() {
        let (port, handle) = one_shot_server(
            "HTTP/1.1 201 Created\r\nContent-Length: 5\r\nX-Cpu-Usage: 0.5\r\n\r\nhello",
        )
        .await;

        let server = ServerDescriptor::new("s1", "127.0.0.1", port);
        let request = Request::get("req-1", "/users?page=2")
            .with_header("X-Custom", "yes")
            .with_client_ip("10.0.0.9".parse().unwrap());

        let response = HttpTransport::new()
            .send(&server, &request, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body, Bytes::from("hello"));
        assert_eq!(response.header("x-cpu-usage"), Some("0.5"));

        let head = handle.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /users?page=2 http/1.1"));
        assert!(head.contains("x-custom: yes"));
        assert!(head.contains("x-forwarded-for: 10.0.0.9"));
        assert!(head.contains("x-request-id: req-1"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let server = ServerDescriptor::new("s1", "127.0.0.1", port);

        let err = HttpTransport::new()
            .send(&server, &Request::get("r", "/"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept but never answer
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let server = ServerDescriptor::new("s1", "127.0.0.1", port);
        let err = HttpTransport::new()
            .send(&server, &Request::get("r", "/"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_https_rejected() {
        let mut server = ServerDescriptor::new("s1", "127.0.0.1", 443);
        server.protocol = Protocol::Https;

        let err = HttpTransport::new()
            .send(&server, &Request::get("r", "/"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
