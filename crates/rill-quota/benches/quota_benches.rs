//! Criterion benchmarks for rill-quota hot paths.
//!
//! Covers: policy evaluation, guard admission, and decimal amount parsing.

use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use rill_quota::constants::DEFAULT_DECIMALS;
use rill_quota::{Amount, AnomalyGuard, GuardConfig, QuotaLimits, QuotaPolicy, WindowStats};

fn bench_policy_decide(c: &mut Criterion) {
    let limits = QuotaLimits::new(
        Amount::from_base_units(1_000_000_000),
        Amount::from_base_units(5_000_000_000),
        3,
        Duration::from_secs(86_400),
    )
    .unwrap();
    let stats = WindowStats {
        total_amount: Amount::from_base_units(400_000_000),
        request_count: 1,
        ..WindowStats::default()
    };

    c.bench_function("policy_decide", |b| {
        b.iter(|| QuotaPolicy::decide(black_box(&stats), black_box(&limits), black_box(false)))
    });
}

fn bench_guard_admit(c: &mut Criterion) {
    // Threshold high enough that the benchmark never trips a block.
    let guard = AnomalyGuard::new(GuardConfig {
        suspicious_threshold: u32::MAX,
        ..GuardConfig::default()
    })
    .unwrap();
    let origins: Vec<String> = (0..1024).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();
    let now = Instant::now();
    let mut i = 0usize;

    c.bench_function("guard_admit", |b| {
        b.iter(|| {
            i = (i + 1) % origins.len();
            guard.admit_at(black_box(&origins[i]), now)
        })
    });
}

fn bench_amount_parse(c: &mut Criterion) {
    c.bench_function("amount_from_decimal_str", |b| {
        b.iter(|| Amount::from_decimal_str(black_box("12345.6789"), DEFAULT_DECIMALS))
    });
}

criterion_group!(benches, bench_policy_decide, bench_guard_admit, bench_amount_parse);
criterion_main!(benches);
