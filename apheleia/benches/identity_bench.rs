//! Benchmarks for record identity derivation.

use apheleia::core::Gav;
use apheleia::identity::{artifact_build_name, dependency_build_id};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn identity_benchmark(c: &mut Criterion) {
    c.bench_function("dependency_build_id", |b| {
        b.iter(|| {
            dependency_build_id(
                black_box("https://github.com/apache/commons-lang.git"),
                black_box("rel/commons-lang-3.12.0"),
                black_box(""),
            )
        })
    });

    c.bench_function("artifact_build_name", |b| {
        b.iter(|| artifact_build_name(black_box("org.apache.commons:commons-lang3:3.12.0")))
    });

    c.bench_function("gav_parse", |b| {
        b.iter(|| Gav::parse(black_box("org.apache.commons:commons-lang3:3.12.0")))
    });
}

criterion_group!(benches, identity_benchmark);
criterion_main!(benches);
