//! Benchmarks for resilb components.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resilb::backend::algorithms::build_load_balancer;
use resilb::backend::{Server, ServerDescriptor};
use resilb::config::{Algorithm, CircuitBreakerConfig};
use resilb::health::CircuitBreakers;
use resilb::metrics::MetricsCollector;
use resilb::util::{RequestId, SystemClock};
use resilb::Request;
use std::sync::Arc;

const ALGORITHMS: &[Algorithm] = &[
    Algorithm::RoundRobin,
    Algorithm::WeightedRoundRobin,
    Algorithm::LeastConnections,
    Algorithm::WeightedLeastConnections,
    Algorithm::ConsistentHash,
    Algorithm::Random,
    Algorithm::ResourceBased,
];

fn create_servers(n: usize) -> Vec<Arc<Server>> {
    (0..n)
        .map(|i| {
            let descriptor = ServerDescriptor::new(format!("s{}", i), "127.0.0.1", 9000 + i as u16)
                .with_weight(i as u32 % 4 + 1);
            Arc::new(Server::new(descriptor))
        })
        .collect()
}

fn benchmark_select(c: &mut Criterion) {
    let servers = create_servers(10);

    // Uneven load so the connection-based algorithms have work to do
    let _guards: Vec<_> = servers
        .iter()
        .enumerate()
        .flat_map(|(i, s)| (0..i % 3).map(move |_| s.acquire()))
        .collect();

    let request = Request::get("bench", "/").with_session("session-42");

    let mut group = c.benchmark_group("select");
    for algorithm in ALGORITHMS {
        let balancer = build_load_balancer(*algorithm, 150);
        group.bench_with_input(
            BenchmarkId::from_parameter(balancer.name()),
            &request,
            |b, request| {
                b.iter(|| {
                    black_box(balancer.select(request, &servers));
                })
            },
        );
    }
    group.finish();
}

fn benchmark_consistent_hash_membership(c: &mut Criterion) {
    let balancer = build_load_balancer(Algorithm::ConsistentHash, 150);
    let full = create_servers(10);
    let shrunk: Vec<_> = full[1..].to_vec();
    let request = Request::get("bench", "/").with_session("session-42");

    // Alternating candidate sets forces a ring rebuild on every select
    c.bench_function("consistent_hash_rebuild", |b| {
        let mut flip = false;
        b.iter(|| {
            flip = !flip;
            let candidates = if flip { &full } else { &shrunk };
            black_box(balancer.select(&request, candidates));
        })
    });
}

fn benchmark_circuit_breaker(c: &mut Criterion) {
    let breakers = CircuitBreakers::new(CircuitBreakerConfig::default(), Arc::new(SystemClock));

    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("can_execute", |b| {
        b.iter(|| {
            black_box(breakers.can_execute(black_box("s1")));
        })
    });

    group.bench_function("record_success", |b| {
        b.iter(|| {
            breakers.record_success(black_box("s1"));
        })
    });

    group.finish();
}

fn benchmark_metrics(c: &mut Criterion) {
    let collector = MetricsCollector::new(1000);
    let server = Server::new(ServerDescriptor::new("s1", "127.0.0.1", 9001));

    for i in 0..1000 {
        collector.record_request(&server, (i % 100) as f64, true);
    }

    let mut group = c.benchmark_group("metrics");
    group.throughput(Throughput::Elements(1));

    group.bench_function("record_request", |b| {
        b.iter(|| {
            collector.record_request(&server, black_box(12.5), black_box(true));
        })
    });

    group.bench_function("global_metrics", |b| {
        b.iter(|| {
            black_box(collector.global_metrics());
        })
    });

    group.finish();
}

fn benchmark_request_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_id");

    group.bench_function("uuid", |b| {
        b.iter(|| {
            black_box(RequestId::new());
        })
    });

    group.bench_function("short", |b| {
        b.iter(|| {
            black_box(RequestId::short());
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_select,
    benchmark_consistent_hash_membership,
    benchmark_circuit_breaker,
    benchmark_metrics,
    benchmark_request_id,
);

criterion_main!(benches);
