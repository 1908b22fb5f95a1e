//! Persist-reload fidelity (`SPEC_FULL.md` §8): an orderbook's committed
//! state, written out through a `JournalKv` and rebuilt on a fresh
//! `Orderbook` from that KV's snapshot, must hash identically to the
//! original.

use speedex_engine::kv::JournalKv;
use speedex_engine::orderbook::{Offer, OfferCategory, OfferTrie, Orderbook, OrderbookKey};
use speedex_engine::price::Price;

fn offers_trie(prices: &[f64]) -> OfferTrie {
    let category = OfferCategory::new(0, 1);
    let mut trie = OfferTrie::new();
    for (i, &p) in prices.iter().enumerate() {
        let id = i as u64 + 1;
        let min_price = Price::from_double(p);
        let offer = Offer {
            owner: id,
            offer_id: id,
            category,
            amount: 42,
            min_price,
        };
        let key = OrderbookKey {
            price: min_price,
            owner: id,
            offer_id: id,
        }
        .to_bytes();
        trie.insert(key, offer, |_, _| panic!("duplicate key in test fixture"))
            .unwrap();
    }
    trie
}

#[test]
fn orderbook_root_hash_survives_persist_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let kv = JournalKv::open(dir.path()).unwrap();

    let category = OfferCategory::new(0, 1);
    let original = Orderbook::new(category);
    original.add_offers(offers_trie(&[1.0, 2.5, 3.0, 10.0])).unwrap();
    original.commit_for_production(1).unwrap();
    original.persist(&kv, 1).unwrap();

    let original_hash = original.root_hash();

    let reloaded = Orderbook::new(category);
    reloaded.load_from_disk(&kv).unwrap();
    assert_eq!(reloaded.root_hash(), original_hash);
    assert_eq!(reloaded.num_open_offers(), original.num_open_offers());

    // a fresh `JournalKv` opened over the same directory replays the same
    // committed state from its journal file.
    drop(kv);
    let reopened_kv = JournalKv::open(dir.path()).unwrap();
    let rereloaded = Orderbook::new(category);
    rereloaded.load_from_disk(&reopened_kv).unwrap();
    assert_eq!(rereloaded.root_hash(), original_hash);
}

#[test]
fn persist_drops_deleted_offers_from_the_reloaded_trie() {
    let dir = tempfile::tempdir().unwrap();
    let kv = JournalKv::open(dir.path()).unwrap();

    let category = OfferCategory::new(0, 1);
    let book = Orderbook::new(category);
    book.add_offers(offers_trie(&[1.0, 2.0, 3.0])).unwrap();
    book.commit_for_production(1).unwrap();
    book.persist(&kv, 1).unwrap();

    let key = OrderbookKey {
        price: Price::from_double(2.0),
        owner: 2,
        offer_id: 2,
    };
    book.mark_for_deletion(key);
    book.commit_for_production(2).unwrap();
    book.persist(&kv, 2).unwrap();

    let reloaded = Orderbook::new(category);
    reloaded.load_from_disk(&kv).unwrap();
    assert_eq!(reloaded.num_open_offers(), 2);
    assert_eq!(reloaded.root_hash(), book.root_hash());
}
