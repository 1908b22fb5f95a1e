//! Concrete clearing-algebra scenarios exercised end to end through a
//! single orderbook, matching the worked examples a reviewer would check
//! by hand: ten offers at prices 1..10, queried at a few different price
//! vectors and smooth_mult settings.

use speedex_engine::orderbook::{Offer, OfferCategory, OfferTrie, Orderbook, OrderbookKey};
use speedex_engine::price::Price;

const SELL: u32 = 0;
const BUY: u32 = 1;

/// Ten offers, amount 100 each, minimum prices 1.0 through 10.0.
fn ten_offer_book() -> Orderbook {
    let category = OfferCategory::new(SELL, BUY);
    let book = Orderbook::new(category);
    let mut trie = OfferTrie::new();
    for i in 1..=10u64 {
        let min_price = Price::from_double(i as f64);
        let offer = Offer {
            owner: i,
            offer_id: i,
            category,
            amount: 100,
            min_price,
        };
        let key = OrderbookKey {
            price: min_price,
            owner: i,
            offer_id: i,
        }
        .to_bytes();
        trie.insert(key, offer, |_, incoming| {
            panic!("unexpected duplicate offer id {}", incoming.offer_id)
        })
        .unwrap();
    }
    book.add_offers(trie).unwrap();
    book.commit_for_production(1).unwrap();
    book
}

fn demands_supplies(book: &Orderbook, sell: f64, buy: f64, smooth_mult: u8) -> (i128, i128) {
    let prices = [Price::from_double(sell), Price::from_double(buy)];
    let mut demands = vec![0i128; 2];
    let mut supplies = vec![0i128; 2];
    book.calculate_demands_and_supplies(&prices, &mut demands, &mut supplies, smooth_mult);
    (supplies[SELL as usize], demands[BUY as usize])
}

#[test]
fn smooth_mult_zero_matches_worked_examples() {
    let book = ten_offer_book();

    // upper = 500/100 = 5.0, an exact breakpoint: 5 offers * 100 = 500
    // units of supply, cleared at the uniform price of 5.0.
    let (supply, demand) = demands_supplies(&book, 500.0, 100.0, 0);
    assert_eq!(supply, 500i128 << 24);
    assert_eq!(demand, 2500i128 << 24);

    // upper = 1000/100 = 10.0, the last breakpoint: all 1000 units clear
    // at the uniform price of 10.0.
    let (supply, demand) = demands_supplies(&book, 1000.0, 100.0, 0);
    assert_eq!(supply, 1000i128 << 24);
    assert_eq!(demand, 10000i128 << 24);

    // upper = 80/100 = 0.8, below every offer's minimum price.
    let (supply, demand) = demands_supplies(&book, 80.0, 100.0, 0);
    assert_eq!(supply, 0);
    assert_eq!(demand, 0);
}

#[test]
fn smooth_mult_two_matches_worked_example() {
    // upper = 800/100 = 8.0, lower = upper - upper/4 = 6.0. Full supply up
    // to 6.0 (600 units) plus a linear partial band from 6.0 to 8.0 that
    // activates half of the 100 units priced at 7.0 and none of the 100
    // priced at 8.0: 600 + 50 = 650.
    let book = ten_offer_book();
    let (supply, demand) = demands_supplies(&book, 800.0, 100.0, 2);
    assert_eq!(supply, 650i128 << 24);
    assert_eq!(demand, 5200i128 << 24);
}

#[test]
fn max_feasible_smooth_mult_matches_worked_example() {
    // exact_exchange_rate = 800/100 = 8.0. The breakpoint search is keyed
    // on `amount`, not on the exchange rate: it finds the smallest
    // cumulative-endow entry exceeding `amount` and compares *that* entry's
    // price to 8.0.
    //
    // amount=800 -> first breakpoint with endow > 800 is priced 9.0 (endow
    // 900); 9.0 > 8.0 so no smoothing tolerance is needed at all (MAX).
    // amount=701 -> same breakpoint (9.0, endow 900); MAX.
    // amount=700 -> first breakpoint with endow > 700 is priced 8.0 (endow
    // 800), exactly equal to the exchange rate itself; MAX.
    // amount=699 -> first breakpoint with endow > 699 is priced 7.0 (endow
    // 700); one part in eight below the 8.0 rate -> 2^-3, so smooth_mult 3.
    let book = ten_offer_book();
    let prices = [Price::from_double(800.0), Price::from_double(100.0)];
    assert_eq!(book.max_feasible_smooth_mult(800, &prices), u8::MAX);
    assert_eq!(book.max_feasible_smooth_mult(701, &prices), u8::MAX);
    assert_eq!(book.max_feasible_smooth_mult(700, &prices), u8::MAX);
    assert_eq!(book.max_feasible_smooth_mult(699, &prices), 3);
}
