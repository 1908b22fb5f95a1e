//! Clearing hot-path throughput: demand/supply integration and the
//! endow-split clearing pass, the two operations every tâtonnement round
//! and every block commit run against the full orderbook set.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use speedex_engine::orderbook::{Offer, OfferCategory, OfferTrie, Orderbook, OrderbookKey};
use speedex_engine::price::Price;
use std::hint::black_box;

fn book_with_offers(count: u64) -> Orderbook {
    let category = OfferCategory::new(0, 1);
    let book = Orderbook::new(category);
    let mut trie = OfferTrie::new();
    for i in 1..=count {
        let min_price = Price::from_double((i % 1000 + 1) as f64);
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
    book.add_offers(trie).unwrap();
    book.commit_for_production(1).unwrap();
    book
}

fn demand_supply_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("clearing_demand_supply");
    for &count in &[1_000u64, 10_000, 50_000] {
        let book = book_with_offers(count);
        let prices = [Price::from_double(500.0), Price::from_double(1.0)];
        group.bench_with_input(BenchmarkId::new("calculate_demands_and_supplies", count), &book, |b, book| {
            b.iter(|| {
                let mut demands = vec![0i128; 2];
                let mut supplies = vec![0i128; 2];
                book.calculate_demands_and_supplies(&prices, &mut demands, &mut supplies, 0);
                black_box((demands, supplies))
            });
        });
    }
    group.finish();
}

fn clear_offers_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("clearing_process_clear_offers");
    for &count in &[1_000u64, 10_000, 50_000] {
        group.bench_with_input(BenchmarkId::new("process_clear_offers", count), &count, |b, &count| {
            b.iter_batched(
                || book_with_offers(count),
                |book| {
                    let prices = [Price::from_double(500.0), Price::from_double(1.0)];
                    let mut stats = Default::default();
                    let commitment = black_box(
                        book.process_clear_offers(&prices, 0, (count as i64 / 2) * 10, |_, _| {}, &mut stats),
                    )
                    .unwrap();
                    commitment
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, demand_supply_benchmarks, clear_offers_benchmarks);
criterion_main!(benches);
