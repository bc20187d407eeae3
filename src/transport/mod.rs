//! Sending requests to upstream servers.
//!
//! The router and health monitor only see the [`Transport`] trait, so tests
//! can swap in scripted servers without opening sockets.

mod http;

pub use http::HttpTransport;

use crate::backend::ServerDescriptor;
use crate::message::Request;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

/// A response received from a server.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    /// A bodyless response with the given status.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header (name is lowercased).
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Header lookup by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Why a request to a server failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server returned status {status}")]
    ServerError { status: u16 },

    #[error("request aborted")]
    Aborted,
}

/// Sends one request to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to `server`, giving up after `timeout`.
    ///
    /// Any HTTP status is a successful exchange; the caller decides what a
    /// 5xx means.
    async fn send(
        &self,
        server: &ServerDescriptor,
        request: &Request,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}
