//! Integration tests for resilb.
//!
//! These drive the router through its public API, both against scripted
//! transports and against real HTTP servers on loopback.

use async_trait::async_trait;
use dashmap::DashMap;
use resilb::backend::{Router, ServerDescriptor};
use resilb::config::{Algorithm, BalancerConfig, CircuitBreakerConfig, FrontendConfig};
use resilb::frontend::FrontendListener;
use resilb::health::CircuitState;
use resilb::transport::{HttpTransport, Transport, TransportError, TransportResponse};
use resilb::util::ManualClock;
use resilb::Request;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;

/// Transport that fails for the servers listed in `down` and answers 200
/// with the server ID as body otherwise.
#[derive(Default)]
struct ScriptedTransport {
    down: DashMap<String, ()>,
}

impl ScriptedTransport {
    fn take_down(&self, id: &str) {
        self.down.insert(id.to_string(), ());
    }

    fn bring_up(&self, id: &str) {
        self.down.remove(id);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        server: &ServerDescriptor,
        _request: &Request,
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        if self.down.contains_key(&server.id) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        Ok(TransportResponse::status(200).with_body(server.id.clone()))
    }
}

fn balancer(algorithm: Algorithm) -> BalancerConfig {
    BalancerConfig {
        algorithm,
        retry_backoff: Duration::ZERO,
        ..BalancerConfig::default()
    }
}

/// Router over healthy servers `s1..=sN` using a scripted transport.
fn scripted_router(
    config: BalancerConfig,
    n: usize,
    clock: Arc<ManualClock>,
) -> (Router, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::default());
    let router = Router::with_clock(config, transport.clone(), clock);
    for i in 1..=n {
        let id = format!("s{}", i);
        assert!(router.add_server(ServerDescriptor::new(id.clone(), "127.0.0.1", 9000 + i as u16)));
        router.set_server_health(&id, true).unwrap();
    }
    (router, transport)
}

async fn served_by(router: &Router, request: Request) -> Option<String> {
    router.handle_request(request).await.server_id
}

/// Minimal blocking HTTP server answering every request with `body`.
fn start_http_server(body: &'static str) -> (SocketAddr, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let addr = listener.local_addr().unwrap();
    let request_count = Arc::new(AtomicU32::new(0));
    let count = Arc::clone(&request_count);

    thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            count.fetch_add(1, Ordering::SeqCst);

            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    (addr, request_count)
}

/// An address nothing listens on.
fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    listener.local_addr().unwrap()
}

/// Send one request through the frontend and return (status, headers, body).
async fn http_get(addr: SocketAddr, path: &str) -> (u16, HashMap<String, String>, String) {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8_lossy(&raw).to_string();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap();
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    (status, headers, body.to_string())
}

#[tokio::test]
async fn test_round_robin_cycles_servers() {
    let (router, _) = scripted_router(balancer(Algorithm::RoundRobin), 3, Arc::new(ManualClock::new()));

    let mut served = Vec::new();
    for i in 0..6 {
        served.push(served_by(&router, Request::get(format!("r{}", i), "/")).await.unwrap());
    }
    assert_eq!(served, vec!["s1", "s2", "s3", "s1", "s2", "s3"]);
}

#[tokio::test]
async fn test_open_breaker_excludes_server_until_timeout() {
    let config = BalancerConfig {
        max_retries: 0,
        circuit_breaker: CircuitBreakerConfig {
            enabled: true,
            threshold: 2,
            timeout: Duration::from_secs(30),
        },
        ..balancer(Algorithm::RoundRobin)
    };
    let clock = Arc::new(ManualClock::new());
    let (router, transport) = scripted_router(config, 2, Arc::clone(&clock));
    transport.take_down("s1");

    // Round robin hands s1 every other request until it trips
    for i in 0..4 {
        router.handle_request(Request::get(format!("r{}", i), "/")).await;
    }
    assert_eq!(router.breakers().state("s1"), CircuitState::Open);

    for i in 0..4 {
        assert_eq!(
            served_by(&router, Request::get(format!("open{}", i), "/")).await.as_deref(),
            Some("s2")
        );
    }

    // After the timeout one probe gets through and closes the breaker
    transport.bring_up("s1");
    clock.advance(Duration::from_secs(31));

    let mut served = Vec::new();
    for i in 0..4 {
        served.push(served_by(&router, Request::get(format!("after{}", i), "/")).await.unwrap());
    }
    assert!(served.contains(&"s1".to_string()));
    assert_eq!(router.breakers().state("s1"), CircuitState::Closed);
}

#[tokio::test]
async fn test_least_connections_prefers_idle_server() {
    let (router, _) = scripted_router(balancer(Algorithm::LeastConnections), 3, Arc::new(ManualClock::new()));

    let registry = router.registry();
    let _busy1 = [registry.get("s1").unwrap().acquire(), registry.get("s1").unwrap().acquire()];
    let _busy3 = registry.get("s3").unwrap().acquire();

    assert_eq!(
        served_by(&router, Request::get("r1", "/")).await.as_deref(),
        Some("s2")
    );
}

#[tokio::test]
async fn test_sticky_session_rebinds_when_server_fails() {
    let config = BalancerConfig {
        session_affinity: true,
        ..balancer(Algorithm::RoundRobin)
    };
    let (router, _) = scripted_router(config, 3, Arc::new(ManualClock::new()));

    let first = served_by(&router, Request::get("r0", "/").with_session("alice"))
        .await
        .unwrap();
    for i in 1..5 {
        let again = served_by(&router, Request::get(format!("r{}", i), "/").with_session("alice")).await;
        assert_eq!(again.as_deref(), Some(first.as_str()));
    }

    router.set_server_health(&first, false).unwrap();
    let moved = served_by(&router, Request::get("r5", "/").with_session("alice"))
        .await
        .unwrap();
    assert_ne!(moved, first);
    assert_eq!(router.sessions().server_for_session("alice"), Some(moved.clone()));

    // The new binding holds even after the old server recovers
    router.set_server_health(&first, true).unwrap();
    assert_eq!(
        served_by(&router, Request::get("r6", "/").with_session("alice")).await,
        Some(moved)
    );
}

#[tokio::test]
async fn test_every_attempt_recorded_once() {
    let config = BalancerConfig {
        max_retries: 2,
        ..balancer(Algorithm::RoundRobin)
    };
    let (router, transport) = scripted_router(config, 3, Arc::new(ManualClock::new()));
    transport.take_down("s2");

    let mut handles = Vec::new();
    for i in 0..30 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router.handle_request(Request::get(format!("r{}", i), "/")).await
        }));
    }

    let mut ok = 0;
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_ne!(response.server_id.as_deref(), Some("s2"));
        ok += 1;
    }

    let global = router.global_metrics();
    assert_eq!(ok, 30);
    assert_eq!(global.success_count, 30);
    assert_eq!(global.total_requests, global.success_count + global.failure_count);

    let per_server: u64 = router
        .server_metrics()
        .values()
        .map(|m| m.runtime.total_requests)
        .sum();
    assert_eq!(per_server, global.total_requests);

    for metrics in router.server_metrics().values() {
        assert_eq!(metrics.runtime.active_connections, 0);
    }
}

#[tokio::test]
async fn test_all_servers_down_is_service_unavailable() {
    let config = BalancerConfig {
        max_retries: 5,
        ..balancer(Algorithm::Random)
    };
    let (router, transport) = scripted_router(config, 2, Arc::new(ManualClock::new()));
    transport.take_down("s1");
    transport.take_down("s2");

    let response = router.handle_request(Request::get("r1", "/")).await;
    assert_eq!(response.status_code, 503);
    assert!(response.server_id.is_none());
    // Only two distinct servers to try
    assert_eq!(router.global_metrics().failure_count, 2);
}

#[test]
fn test_config_file_builds_router() {
    use resilb::config::load_config;
    use std::io::Write as IoWrite;
    use tempfile::NamedTempFile;

    let config_content = r#"
frontend:
  listen: "127.0.0.1:0"
balancer:
  algorithm: weighted_round_robin
  circuit_breaker:
    threshold: 3
    timeout: 10s
servers:
  - id: a
    host: 127.0.0.1
    port: 9001
    weight: 3
  - id: b
    host: 127.0.0.1
    port: 9002
"#;

    let mut temp_file = NamedTempFile::new().expect("failed to create temp file");
    temp_file
        .write_all(config_content.as_bytes())
        .expect("failed to write config");

    let config = tokio_test::assert_ok!(load_config(temp_file.path()));
    assert_eq!(config.balancer.circuit_breaker.threshold, 3);

    let router = Router::new(config.balancer, Arc::new(HttpTransport::new()));
    for server in config.servers {
        assert!(router.add_server(server));
    }
    assert_eq!(router.algorithm(), "weighted_round_robin");
    assert_eq!(router.registry().len(), 2);
    assert_eq!(router.registry().get("a").unwrap().weight(), 3);
}

#[test]
fn test_config_validation_rejects_duplicate_ids() {
    use resilb::config::parse_config;

    let config_content = r#"
servers:
  - id: a
    host: 127.0.0.1
    port: 9001
  - id: a
    host: 127.0.0.1
    port: 9002
"#;

    tokio_test::assert_err!(parse_config(config_content));
}

#[tokio::test]
async fn test_end_to_end_over_http() {
    let (addr1, count1) = start_http_server("one");
    let (addr2, count2) = start_http_server("two");
    let dead = closed_port();

    let router = Router::new(balancer(Algorithm::RoundRobin), Arc::new(HttpTransport::new()));
    for (id, addr) in [("one", addr1), ("two", addr2), ("dead", dead)] {
        let descriptor = ServerDescriptor::new(id, addr.ip().to_string(), addr.port())
            .with_request_timeout(Duration::from_secs(2));
        assert!(router.add_server(descriptor));
    }

    let summary = router.health_monitor().check_all().await;
    assert_eq!(summary.healthy, 2);
    assert_eq!(summary.unhealthy, 1);

    let frontend = FrontendConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..FrontendConfig::default()
    };
    let listener = FrontendListener::bind(frontend, router.clone()).await.unwrap();
    let frontend_addr = listener.local_addr().unwrap();
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(listener.run(rx));

    let mut bodies = Vec::new();
    for _ in 0..4 {
        let (status, headers, body) = http_get(frontend_addr, "/hello").await;
        assert_eq!(status, 200);
        assert_eq!(headers.get("x-served-by"), Some(&body));
        bodies.push(body);
    }
    assert_eq!(bodies, vec!["one", "two", "one", "two"]);

    // One probe plus two routed requests each
    assert_eq!(count1.load(Ordering::SeqCst), 3);
    assert_eq!(count2.load(Ordering::SeqCst), 3);
    assert_eq!(router.global_metrics().success_count, 4);

    let _ = tx.send(());
}

#[tokio::test]
async fn test_no_healthy_server_over_http() {
    let dead = closed_port();
    let router = Router::new(balancer(Algorithm::RoundRobin), Arc::new(HttpTransport::new()));
    router.add_server(ServerDescriptor::new("dead", dead.ip().to_string(), dead.port()));
    router.health_monitor().check_all().await;

    let frontend = FrontendConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..FrontendConfig::default()
    };
    let listener = FrontendListener::bind(frontend, router).await.unwrap();
    let frontend_addr = listener.local_addr().unwrap();
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(listener.run(rx));

    let (status, headers, _) = http_get(frontend_addr, "/").await;
    assert_eq!(status, 503);
    assert!(!headers.contains_key("x-served-by"));

    let _ = tx.send(());
}
