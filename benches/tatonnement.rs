//! Tâtonnement-round throughput: one full price-search query against an
//! orderbook manager populated with a fixed offer set, across worker-pool
//! sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use speedex_engine::config::EngineConfig;
use speedex_engine::orderbook::{Offer, OfferCategory, OfferTrie, OrderbookKey, OrderbookManager};
use speedex_engine::price::Price;
use speedex_engine::price_computation::VolumeRelativizer;
use speedex_engine::tatonnement::TatonnementOracle;
use std::hint::black_box;
use std::sync::RwLock;

const NUM_ASSETS: u32 = 4;

fn manager_with_offers(offers_per_book: u64) -> OrderbookManager {
    let manager = OrderbookManager::new(NUM_ASSETS);
    for sell in 0..NUM_ASSETS {
        for buy in 0..NUM_ASSETS {
            if sell == buy {
                continue;
            }
            let category = OfferCategory::new(sell, buy);
            let mut trie = OfferTrie::new();
            for i in 1..=offers_per_book {
                let min_price = Price::from_double((i % 50 + 1) as f64);
                let offer = Offer {
                    owner: i,
                    offer_id: i,
                    category,
                    amount: 10,
                    min_price,
                };
                let key = OrderbookKey {
                    price: min_price,
                    owner: i,
                    offer_id: i,
                }
                .to_bytes();
                trie.insert(key, offer, |_, _| Ok(())).unwrap();
            }
            manager.add_offers(category, trie).unwrap();
        }
    }
    manager.commit_for_production(1).unwrap();
    manager
}

fn run_query_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("tatonnement_run_query");
    group.sample_size(10);
    for &worker_count in &[1usize, 4, 8] {
        let mut config = EngineConfig::new(NUM_ASSETS);
        config.num_tatonnement_workers = worker_count;
        let oracle = TatonnementOracle::new(config);
        let manager = manager_with_offers(200);
        let initial_prices: Vec<Price> = (0..NUM_ASSETS).map(|_| Price::ONE).collect();
        let relativizer = RwLock::new(VolumeRelativizer::new(NUM_ASSETS as usize));

        group.bench_with_input(
            BenchmarkId::new("workers", worker_count),
            &(oracle, manager, initial_prices, relativizer),
            |b, (oracle, manager, initial_prices, relativizer)| {
                b.iter(|| black_box(oracle.run_query(manager, initial_prices, relativizer)));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, run_query_benchmarks);
criterion_main!(benches);
