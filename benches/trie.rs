//! Throughput of the core trie operations the rest of the engine is built
//! on: inserting a fresh batch, merging a committed trie with that batch,
//! hashing the result, and building a cumulative-endow traversal.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use speedex_engine::trie::{EndowMetadata, MerkleTrie, TrieValue};
use std::hint::black_box;

#[derive(Clone, Debug)]
struct Endowed(i64);

impl TrieValue for Endowed {
    type Extra = EndowMetadata;

    fn extra_metadata(&self) -> EndowMetadata {
        EndowMetadata { endow: self.0 }
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_be_bytes());
    }
}

type Trie = MerkleTrie<8, Endowed>;

fn key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

fn no_conflict(_existing: &mut Endowed, _incoming: Endowed) -> Result<(), speedex_engine::EngineError> {
    Ok(())
}

fn build_trie(count: u64) -> Trie {
    let mut trie = Trie::new();
    for i in 0..count {
        trie.insert(key(i), Endowed(i as i64), no_conflict).unwrap();
    }
    trie
}

fn insert_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_insert");
    for &count in &[100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("sequential_keys", count), &count, |b, &count| {
            b.iter_batched(
                Trie::new,
                |mut trie| {
                    for i in 0..count {
                        black_box(trie.insert(key(i), Endowed(i as i64), no_conflict)).unwrap();
                    }
                    trie
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn merge_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_merge");
    for &count in &[100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("disjoint_batch", count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let committed = build_trie(count);
                    let mut incoming = Trie::new();
                    for i in count..2 * count {
                        incoming.insert(key(i), Endowed(i as i64), no_conflict).unwrap();
                    }
                    (committed, incoming)
                },
                |(mut committed, incoming)| {
                    black_box(committed.merge_in(incoming, no_conflict)).unwrap();
                    committed
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn hash_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_hash");
    for &count in &[100u64, 1_000, 10_000] {
        let trie = build_trie(count);
        group.bench_with_input(BenchmarkId::new("root_hash", count), &trie, |b, trie| {
            b.iter(|| black_box(trie.hash()));
        });
    }
    group.finish();
}

fn metadata_traversal_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_metadata_traversal");
    for &count in &[100u64, 1_000, 10_000] {
        let trie = build_trie(count);
        group.bench_with_input(BenchmarkId::new("full_traversal", count), &trie, |b, trie| {
            b.iter(|| black_box(trie.metadata_traversal(64)));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    insert_benchmarks,
    merge_benchmarks,
    hash_benchmarks,
    metadata_traversal_benchmarks
);
criterion_main!(benches);
