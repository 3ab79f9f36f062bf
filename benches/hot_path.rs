//! Hot Path Benchmarks
//!
//! Measures the per-connect work done before any portal round trip.

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ocserv_agent_core::{
    fingerprint::{CacheKey, Fingerprint},
    handler::HandlerConfig,
    AuthHandler, AuthRequest, BreakerConfig, CacheConfig, CircuitBreaker, DecisionCache,
    FailMode, PolicyDecision, PortalClient, PortalVerdict,
};
use std::sync::Arc;
use std::time::Duration;

fn request(i: u64) -> AuthRequest {
    AuthRequest {
        reason: "connect".to_string(),
        username: format!("user{:05}", i),
        groupname: "staff".to_string(),
        ip_real: "198.51.100.23".to_string(),
        ip_remote: "10.8.0.2".to_string(),
        device: "vpns0".to_string(),
        session_id: "a1b2c3".to_string(),
    }
}

fn bench_fingerprint(c: &mut Criterion) {
    let req = request(42);

    let mut group = c.benchmark_group("fingerprint");
    group.throughput(Throughput::Elements(1));

    group.bench_function("of_request", |b| b.iter(|| black_box(Fingerprint::of(&req))));
    group.bench_function("cache_key", |b| b.iter(|| black_box(CacheKey::for_request(&req))));

    group.finish();
}

fn bench_cache_operations(c: &mut Criterion) {
    let cache = DecisionCache::new(CacheConfig {
        max_size: 100_000,
        ..Default::default()
    });

    for i in 0..1000 {
        cache.set(&CacheKey::for_request(&request(i)), PolicyDecision::allow());
    }

    let hit = CacheKey::for_request(&request(500));
    let miss = CacheKey::for_request(&request(99_999));

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function("cache_hit", |b| b.iter(|| black_box(cache.get(&hit))));
    group.bench_function("cache_miss", |b| b.iter(|| black_box(cache.get(&miss))));
    group.bench_function("cache_stale_hit", |b| b.iter(|| black_box(cache.get_stale(&hit))));

    group.bench_function("cache_set", |b| {
        let mut i = 2000u64;
        b.iter(|| {
            cache.set(&CacheKey::for_request(&request(i % 50_000)), PolicyDecision::allow());
            i += 1;
        })
    });

    group.finish();
}

fn bench_breaker(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("bench", BreakerConfig::default());

    let mut group = c.benchmark_group("breaker");
    group.throughput(Throughput::Elements(1));

    group.bench_function("admit_success", |b| {
        b.iter(|| {
            if let Some(admission) = breaker.admit() {
                admission.success();
            }
        })
    });

    let runtime = tokio::runtime::Runtime::new().unwrap();
    group.bench_function("execute_success", |b| {
        let breaker = &breaker;
        b.to_async(&runtime).iter(|| async move {
            black_box(breaker.execute(|| async { Ok::<_, ()>(1u8) }).await)
        })
    });

    group.bench_function("state", |b| b.iter(|| black_box(breaker.state())));

    group.finish();
}

struct AllowAll;

#[async_trait]
impl PortalClient for AllowAll {
    async fn check_policy(
        &self,
        _: &str,
        _: &str,
        _: &str,
    ) -> ocserv_agent_core::Result<PortalVerdict> {
        Ok(PortalVerdict::allow())
    }
}

fn bench_process(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let handler = AuthHandler::new(
        HandlerConfig::default(),
        Arc::new(AllowAll),
        Arc::new(DecisionCache::default()),
        CircuitBreaker::new("portal", BreakerConfig::default()),
        FailMode::Close,
    );
    let cached = request(1);

    let mut group = c.benchmark_group("process");
    group.throughput(Throughput::Elements(1));

    // Cached path (fastest)
    group.bench_function("cache_hit_path", |b| {
        let handler = &handler;
        let cached = &cached;
        b.to_async(&runtime).iter(|| async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            black_box(handler.process(cached, deadline).await)
        })
    });

    // Cold path through the breaker
    group.bench_function("portal_path", |b| {
        let handler = &handler;
        let mut i = 0u64;
        b.to_async(&runtime).iter(|| {
            i += 1;
            let req = request(10_000 + i);
            async move {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
                black_box(handler.process(&req, deadline).await)
            }
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fingerprint,
    bench_cache_operations,
    bench_breaker,
    bench_process,
);

criterion_main!(benches);
