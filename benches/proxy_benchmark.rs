//! Benchmarks for the request-path hot spots.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fluxgate::loadbalancer::{Backend, LeastConnection, LoadBalancer, RoundRobin};
use fluxgate::router::Router;
use http::Method;
use std::sync::Arc;

fn bench_router_match(c: &mut Criterion) {
    let router = Router::new();
    for i in 0..50 {
        router.add_route(format!("/service{i}/*"), format!("service{i}"), Vec::new());
    }

    c.bench_function("router_match_first", |b| {
        b.iter(|| black_box(router.match_route(&Method::GET, "/service0/users/42")));
    });

    c.bench_function("router_match_last", |b| {
        b.iter(|| black_box(router.match_route(&Method::GET, "/service49/users/42")));
    });

    c.bench_function("router_match_miss", |b| {
        b.iter(|| black_box(router.match_route(&Method::GET, "/unknown/path")));
    });
}

fn bench_pool_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_next");
    group.throughput(Throughput::Elements(1));

    let rr = RoundRobin::new();
    for i in 0..10 {
        rr.add(Arc::new(Backend::new(
            format!("http://backend{i}:8080").parse().unwrap(),
            1,
        )));
    }
    group.bench_function("round_robin", |b| {
        b.iter(|| black_box(rr.next()));
    });

    let lc = LeastConnection::new();
    for i in 0..10 {
        lc.add(Arc::new(Backend::new(
            format!("http://backend{i}:8080").parse().unwrap(),
            1,
        )));
    }
    group.bench_function("least_connection", |b| {
        b.iter(|| {
            let backend = lc.next().expect("pool is non-empty");
            lc.release(&backend);
            black_box(backend)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_router_match, bench_pool_selection);
criterion_main!(benches);
