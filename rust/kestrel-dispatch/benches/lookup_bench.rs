use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kestrel_core::{AtomRef, FunctionType, Type, Value};
use kestrel_dispatch::{Definition, InlineCache, MethodRegistry};

fn registry_with(definitions: usize) -> (MethodRegistry, AtomRef) {
    let registry = MethodRegistry::new();
    let name = AtomRef::new("_+_", None);
    for i in 0..definitions as i64 {
        let lo = i * 10;
        let signature = FunctionType::new(
            vec![Type::int_range_i64(lo, lo + 9), Type::integer()],
            Type::integer(),
        );
        registry
            .add_definition(&name, Definition::forward(None, signature))
            .expect("distinct signatures");
    }
    (registry, name)
}

fn lookup_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("method_lookup");

    for size in [2usize, 8, 32] {
        let (registry, name) = registry_with(size);
        let method = registry.method(&name).expect("method exists");
        let args = [Value::from((size as i64 - 1) * 10 + 3), Value::from(1)];

        group.bench_with_input(BenchmarkId::new("tree", size), &args, |b, args| {
            b.iter(|| black_box(method.lookup_by_values(black_box(args))))
        });

        group.bench_with_input(BenchmarkId::new("linear_scan", size), &args, |b, args| {
            b.iter(|| black_box(method.lookup_by_scan(black_box(args))))
        });

        let cache = InlineCache::default();
        group.bench_with_input(BenchmarkId::new("inline_cache", size), &args, |b, args| {
            b.iter(|| black_box(cache.lookup(&method, black_box(args))))
        });

        let bounds = [Type::int_range_i64(0, 5), Type::integer()];
        group.bench_with_input(BenchmarkId::new("upper_bound", size), &bounds, |b, bounds| {
            b.iter(|| black_box(method.definitions_at_or_below(black_box(bounds))))
        });
    }

    group.finish();
}

criterion_group!(benches, lookup_benchmark);
criterion_main!(benches);
