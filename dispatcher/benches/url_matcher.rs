//! Benchmarks the URL matcher's weighted-similarity scoring path (C10) --
//! the hottest per-flow computation in the dispatcher addon, run once per
//! pending session per intercepted request.
//!
//! Grounded on `cli/benches/prove_bench.rs`: one criterion group, one hot
//! path, no more.

use criterion::{criterion_group, criterion_main, Criterion};
use dispatcher::url_matcher::score;

fn bench_url_matcher(c: &mut Criterion) {
    let live = "https://bank.example.com/api/v2/accounts/12345/transactions?page=3&sort=desc";
    let candidate = "https://bank.example.com/api/v2/accounts/{{accountId}}/transactions?page={{page}}";

    c.bench_function("url_matcher_score_non_exact", |b| {
        b.iter(|| score(std::hint::black_box(live), std::hint::black_box(candidate)))
    });

    let exact_candidate = "https://bank.example.com/api/v2/accounts/12345/transactions?sort=desc&page=3";
    c.bench_function("url_matcher_score_base_exact", |b| {
        b.iter(|| score(std::hint::black_box(live), std::hint::black_box(exact_candidate)))
    });
}

criterion_group!(benches, bench_url_matcher);
criterion_main!(benches);
