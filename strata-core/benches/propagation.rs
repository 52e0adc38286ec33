use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use strata_core::{Family, Node, NodeSpec, Store, Subscription};

/// Invalidation scenarios over different graph shapes.
fn bench_propagation(c: &mut Criterion) {
    bench_chain_set(c);
    bench_chain_cutoff(c);
    bench_fanout_set(c);
    bench_family_lookup(c);
}

/// A state node feeding a chain of `len` derived nodes, watched at the tail.
fn build_chain(store: &Store, len: usize) -> (Node<u64>, Subscription<u64>) {
    let root = store.state(0_u64);
    let mut prev = root;
    for _ in 0..len {
        let upstream = prev;
        prev = store.derived(move |scope| Ok(scope.get(&upstream)? + 1));
    }
    let sub = store.watch(&prev).expect("tail registered");
    (root, sub)
}

/// Every set changes every node in the chain.
fn bench_chain_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_set");
    for len in [8_usize, 64, 256] {
        let store = Store::new();
        let (root, sub) = build_chain(&store, len);
        let mut value = 0_u64;
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                value += 1;
                store.set(&root, black_box(value)).unwrap();
            });
        });
        drop(sub);
    }
    group.finish();
}

/// The first derived node clamps its input, so nothing past it recomputes.
fn bench_chain_cutoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_cutoff");
    for len in [8_usize, 64, 256] {
        let store = Store::new();
        let root = store.state(0_u64);
        let clamped = store.derived(move |scope| Ok(scope.get(&root)?.min(1)));
        let mut prev = clamped;
        for _ in 0..len {
            let upstream = prev;
            prev = store.derived(move |scope| Ok(scope.get(&upstream)? + 1));
        }
        let sub = store.watch(&prev).unwrap();
        let mut value = 1_u64;
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                value += 1;
                store.set(&root, black_box(value)).unwrap();
            });
        });
        drop(sub);
    }
    group.finish();
}

/// One state node read by `width` independent derived nodes.
fn bench_fanout_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout_set");
    for width in [8_usize, 64, 256] {
        let store = Store::new();
        let root = store.state(0_u64);
        let subs: Vec<_> = (0..width as u64)
            .map(|i| {
                let node = store.derived(move |scope| Ok(scope.get(&root)? * i));
                store.watch(&node).unwrap()
            })
            .collect();
        let mut value = 0_u64;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                value += 1;
                store.set(&root, black_box(value)).unwrap();
            });
        });
        drop(subs);
    }
    group.finish();
}

/// Repeated lookups of already-built keys.
fn bench_family_lookup(c: &mut Criterion) {
    let store = Store::new();
    let family = Family::new(&store, |key: &u32| {
        let key = *key;
        NodeSpec::derived(move |_scope| Ok(key)).keep_alive()
    });
    for key in 0..1024 {
        family.get(&key);
    }
    let mut key = 0_u32;
    c.bench_function("family_lookup", |b| {
        b.iter(|| {
            key = (key + 1) % 1024;
            black_box(family.get(&key));
        });
    });
}

criterion_group!(benches, bench_propagation);
criterion_main!(benches);
