use criterion::{criterion_group, criterion_main, Criterion};
use metergate::credits::{tokens_to_credits, CreditCheckParams, CreditGate, InMemoryLedger};
use metergate::pipeline::{CreditCheckGate, GatePipeline, RateLimitGate, RequestContext};
use metergate::rate_limit::{
    InMemoryStore, RateLimitConfig, RateLimitSpec, RateLimitStore, RateLimiter,
};
use std::hint::black_box;
use std::sync::Arc;

fn bench_gate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    c.bench_function("tokens_to_credits", |b| {
        b.iter(|| black_box(tokens_to_credits(black_box(123_456))));
    });

    // Budget large enough that every iteration is admitted
    let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryStore::new());
    let limiter = RateLimiter::new(RateLimitSpec::new(u32::MAX, 60_000), store.clone());
    c.bench_function("rate_limiter_check_single_key", |b| {
        b.iter(|| {
            let result = rt.block_on(limiter.check("bench:key"));
            black_box(result.expect("limiter check failed"));
        });
    });

    let mut counter = 0u64;
    c.bench_function("rate_limiter_check_fresh_keys", |b| {
        b.iter(|| {
            counter += 1;
            let key = format!("bench:fresh:{counter}");
            let result = rt.block_on(limiter.check(&key));
            black_box(result.expect("limiter check failed"));
        });
    });

    let ledger = Arc::new(InMemoryLedger::with_balances([("bench-org", i64::MAX / 2)]));
    let credits = CreditGate::new(ledger);
    c.bench_function("credit_gate_admit", |b| {
        b.iter(|| {
            let ctx = rt.block_on(credits.admit(CreditCheckParams::new("bench-org", "bench-user")));
            black_box(ctx.expect("admission failed"));
        });
    });

    let pipeline = GatePipeline::new()
        .with_gate(RateLimitGate::new(RateLimitConfig::disabled(), store))
        .with_gate(CreditCheckGate::new(credits.clone()));
    c.bench_function("pipeline_run", |b| {
        b.iter(|| {
            let ctx = RequestContext::new("ip:127.0.0.1", 1000)
                .with_organization("bench-org")
                .with_user("bench-user");
            black_box(rt.block_on(pipeline.run(ctx)).expect("pipeline rejected"));
        });
    });
}

criterion_group!(benches, bench_gate);
criterion_main!(benches);
