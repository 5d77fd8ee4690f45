//! Criterion micro-benchmarks: point insert, point search, range scan.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

use fastfair::BTree;

const N: usize = 100_000;

/// Multiplicative-hash key stream, deterministic across runs.
fn keys(n: usize) -> Vec<i64> {
    const MULTIPLIER: u64 = 0x9e37_79b9_7f4a_7c15;

    (0..n)
        .map(|i| ((i as u64 + 1).wrapping_mul(MULTIPLIER) >> 1) as i64)
        .collect()
}

fn populated_tree(keys: &[i64]) -> BTree {
    let tree: BTree = BTree::new();
    let guard = tree.guard();
    for &key in keys {
        tree.insert_with_guard(key, key as u64 | 1, &guard).unwrap();
    }
    drop(guard);
    tree
}

fn bench_insert(c: &mut Criterion) {
    let keys = keys(N);

    c.bench_function("insert_100k", |b| {
        b.iter_batched(
            || keys.clone(),
            |keys| {
                let tree: BTree = BTree::new();
                let guard = tree.guard();
                for key in keys {
                    tree.insert_with_guard(key, key as u64 | 1, &guard).unwrap();
                }
                drop(guard);
                tree
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_search(c: &mut Criterion) {
    let keys = keys(N);
    let tree = populated_tree(&keys);

    c.bench_function("search_hit", |b| {
        let guard = tree.guard();
        let mut i = 0usize;
        b.iter(|| {
            let key = keys[i % keys.len()];
            i = i.wrapping_add(7919);
            black_box(tree.search_with_guard(black_box(key), &guard))
        });
    });

    c.bench_function("search_miss", |b| {
        let guard = tree.guard();
        let mut probe = 1i64;
        b.iter(|| {
            probe = probe.wrapping_add(2);
            black_box(tree.search_with_guard(black_box(probe), &guard))
        });
    });
}

fn bench_range(c: &mut Criterion) {
    let tree: BTree = BTree::new();
    for key in 0..(N as i64) {
        tree.insert(key, key as u64 | 1).unwrap();
    }

    c.bench_function("range_1k_window", |b| {
        let guard = tree.guard();
        let mut buf: Vec<u64> = Vec::with_capacity(1024);
        let mut start = 0i64;
        b.iter(|| {
            buf.clear();
            start = (start + 4093) % (N as i64 - 1000);
            black_box(tree.search_range_with_guard(start, start + 1001, &mut buf, &guard))
        });
    });
}

criterion_group!(benches, bench_insert, bench_search, bench_range);
criterion_main!(benches);
