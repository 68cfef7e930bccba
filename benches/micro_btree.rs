//! Micro benchmarks for the latch-coupled B+tree.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use latchtree::storage::btree::{Btree, BtreeConfig, KeyRange, MemNodeStore, NodeStore};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const INSERT_COUNT: u64 = 16_384;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: u64 = 512;

fn micro_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                tree.insert_sequence(0, INSERT_COUNT);
                black_box(tree.tree.root_id());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                tree.insert_keys(&random_keys);
                black_box(tree.tree.root_id());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("remove_random", |b| {
        b.iter_batched(
            || {
                let tree = FreshTree::new();
                tree.insert_sequence(0, INSERT_COUNT);
                tree
            },
            |tree| {
                tree.remove_keys(&random_keys);
                black_box(tree.tree.root_id());
            },
            BatchSize::SmallInput,
        );
    });

    let mut loaded = LoadedTree::new(INSERT_COUNT);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| loaded.point_lookup(LOOKUP_SAMPLES));
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH));
    group.bench_function(BenchmarkId::new("range_query", RANGE_WIDTH), |b| {
        b.iter(|| loaded.range_query(RANGE_WIDTH));
    });

    group.bench_function(BenchmarkId::new("range_update", RANGE_WIDTH), |b| {
        b.iter(|| loaded.range_update(RANGE_WIDTH));
    });

    group.finish();
}

fn bench_config() -> BtreeConfig {
    BtreeConfig {
        name: "bench".to_string(),
        ..BtreeConfig::new(1024, 8, 8)
    }
}

struct FreshTree {
    tree: Btree<u64, u64>,
}

impl FreshTree {
    fn new() -> Self {
        let store: Arc<dyn NodeStore<u64, u64>> = Arc::new(MemNodeStore::new());
        let tree = Btree::create(bench_config(), store).expect("tree");
        Self { tree }
    }

    fn insert_sequence(&self, start: u64, count: u64) {
        for key in start..(start + count) {
            self.tree.insert(key, key).expect("insert");
        }
    }

    fn insert_keys(&self, keys: &[u64]) {
        for key in keys {
            self.tree.insert(*key, *key).expect("insert");
        }
    }

    fn remove_keys(&self, keys: &[u64]) {
        for key in keys {
            self.tree.remove(key).expect("remove");
        }
    }
}

struct LoadedTree {
    tree: Btree<u64, u64>,
    max_key: u64,
    rng: ChaCha8Rng,
}

impl LoadedTree {
    fn new(count: u64) -> Self {
        let fresh = FreshTree::new();
        fresh.insert_sequence(0, count);
        Self {
            tree: fresh.tree,
            max_key: count,
            rng: ChaCha8Rng::seed_from_u64(0xFEED_FACE),
        }
    }

    fn point_lookup(&mut self, samples: usize) {
        for _ in 0..samples {
            let key = self.rng.gen_range(0..self.max_key);
            black_box(self.tree.get(&key).expect("get"));
        }
    }

    fn range_query(&mut self, width: u64) {
        for _ in 0..16 {
            let start = self.rng.gen_range(0..(self.max_key - width));
            let hits = self
                .tree
                .query(KeyRange::new(start, true, start + width, true), None)
                .expect("query");
            black_box(hits);
        }
    }

    fn range_update(&mut self, width: u64) {
        let start = self.rng.gen_range(0..(self.max_key - width));
        self.tree
            .range_update(KeyRange::new(start, true, start + width, false), |entries, _| {
                Ok(entries.iter().map(|(k, v)| (*k, v.wrapping_add(1))).collect())
            })
            .expect("range update");
    }
}

criterion_group!(benches, micro_btree);
criterion_main!(benches);
