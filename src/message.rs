//! Requests routed by the balancer and the responses handed back.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::SystemTime;

/// An incoming client request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    /// Path and query, e.g. `/users?page=2`
    pub path: String,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub client_ip: IpAddr,
    pub session_id: Option<String>,
    pub timestamp: SystemTime,
    pub body: Bytes,
}

impl Request {
    /// A bodyless request from an unspecified client.
    pub fn new(id: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            client_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            session_id: None,
            timestamp: SystemTime::now(),
            body: Bytes::new(),
        }
    }

    /// Shorthand for a GET request.
    pub fn get(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(id, "GET", path)
    }

    /// Set the session ID.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the client IP.
    pub fn with_client_ip(mut self, client_ip: IpAddr) -> Self {
        self.client_ip = client_ip;
        self
    }

    /// Add a header (name is lowercased).
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Header lookup by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Key used by hash-based selection: the session, or else the client IP.
    pub fn affinity_key(&self) -> String {
        match &self.session_id {
            Some(session) => session.clone(),
            None => self.client_ip.to_string(),
        }
    }
}

/// The answer returned to the client.
#[derive(Debug, Clone)]
pub struct Response {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub response_time_ms: f64,
    /// Present only when a server actually handled the request.
    pub server_id: Option<String>,
}

impl Response {
    /// A plain-text response that no server produced.
    pub fn synthetic(status_code: u16, message: impl Into<String>) -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        Self {
            status_code,
            headers,
            body: Bytes::from(message.into()),
            response_time_ms: 0.0,
            server_id: None,
        }
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_key_prefers_session() {
        let ip: IpAddr = "192.168.1.10".parse().unwrap();
        let req = Request::get("r1", "/").with_client_ip(ip);
        assert_eq!(req.affinity_key(), "192.168.1.10");

        let req = req.with_session("abc");
        assert_eq!(req.affinity_key(), "abc");
    }

    #[test]
    fn test_headers_lowercased() {
        let req = Request::get("r1", "/").with_header("X-Custom", "1");
        assert_eq!(req.header("x-custom"), Some("1"));
    }

    #[test]
    fn test_synthetic_response() {
        let resp = Response::synthetic(503, "no healthy server");
        assert_eq!(resp.status_code, 503);
        assert!(resp.server_id.is_none());
        assert!(!resp.is_success());
        assert_eq!(resp.body, Bytes::from("no healthy server"));
    }
}
