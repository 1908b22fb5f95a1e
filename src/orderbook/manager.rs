//! Orderbook manager (§4.3): fan-out/fan-in over every `(sell, buy)`
//! orderbook. Grounded on `orderbook_manager.h`'s `parallel_apply` /
//! `parallel_clear` helpers.

use std::sync::Mutex;

use tracing::info;

use super::book::{ClearingStats, Orderbook, SingleOrderbookStateCommitment};
use super::key::OrderbookKey;
use super::offer::{Offer, OfferCategory};
use crate::error::EngineResult;
use crate::kv::KvEnvironment;
use crate::price::Price;
use crate::trie::Hash;

/// Number of orderbooks handed to one fan-out worker at a time, matching
/// the original's work-stealing grain size.
const GRAIN_SIZE: usize = 3;

/// Run `f` over every orderbook, `GRAIN_SIZE` at a time, each chunk on its
/// own scoped thread. This is the Rust-safe stand-in for the original's
/// lock-stealing work queue (see `trie/merkle_trie.rs` module docs for the
/// analogous call on `parallel_batch_merge`): disjoint slices instead of a
/// shared queue with theft.
fn fan_out<T: Send>(books: &[Orderbook], f: impl Fn(&Orderbook) -> T + Sync) -> Vec<T> {
    if books.is_empty() {
        return Vec::new();
    }
    std::thread::scope(|scope| {
        let handles: Vec<_> = books
            .chunks(GRAIN_SIZE)
            .map(|chunk| {
                let f = &f;
                scope.spawn(move || chunk.iter().map(|b| f(b)).collect::<Vec<T>>())
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().expect("orderbook fan-out worker panicked"))
            .collect()
    })
}

/// The full set of `N*(N-1)` per-category orderbooks plus the coarse lock
/// guarding category-list mutation. The asset universe is fixed at
/// construction in this crate (see `DESIGN.md`): the coarse `category_lock`
/// is retained for interface fidelity with the original, which supports
/// listing new assets at runtime, but nothing in this crate's scope
/// currently grows the book list after `new`.
pub struct OrderbookManager {
    num_assets: u32,
    books: Vec<Orderbook>,
    category_lock: Mutex<()>,
}

impl OrderbookManager {
    pub fn new(num_assets: u32) -> Self {
        let mut books = Vec::with_capacity((num_assets * num_assets.saturating_sub(1)) as usize);
        for sell in 0..num_assets {
            for buy in 0..num_assets {
                if sell == buy {
                    continue;
                }
                books.push(Orderbook::new(OfferCategory::new(sell, buy)));
            }
        }
        OrderbookManager {
            num_assets,
            books,
            category_lock: Mutex::new(()),
        }
    }

    pub fn num_assets(&self) -> u32 {
        self.num_assets
    }

    pub fn book(&self, category: OfferCategory) -> &Orderbook {
        &self.books[category.index(self.num_assets)]
    }

    pub fn books(&self) -> &[Orderbook] {
        &self.books
    }

    /// Add a newly-intaken batch of offers to their book. Held behind the
    /// category lock only long enough to resolve the category's index —
    /// the orderbook's own locking covers the merge itself.
    pub fn add_offers(&self, category: OfferCategory, trie: super::book::OfferTrie) -> EngineResult<()> {
        let _guard = self.category_lock.lock().unwrap();
        self.book(category).add_offers(trie)
    }

    pub fn mark_for_deletion(&self, category: OfferCategory, key: OrderbookKey) -> Option<Offer> {
        self.book(category).mark_for_deletion(key)
    }

    /// Merge every book's uncommitted offers into committed, starting this
    /// block's persistence thunks. Fans out with grain size 3; the first
    /// error encountered is returned (others are dropped, matching the
    /// per-region `exists_failure` propagation policy of §7).
    pub fn commit_for_production(&self, block_number: u64) -> EngineResult<()> {
        let results = fan_out(&self.books, |b| b.commit_for_production(block_number));
        results.into_iter().collect::<EngineResult<Vec<()>>>()?;
        Ok(())
    }

    /// Validation-side alias: semantically identical to
    /// `commit_for_production` (merge-then-snapshot is "tentative" only in
    /// the sense that the whole block can still be rolled back via
    /// `rollback_thunks`).
    pub fn tentative_commit_for_validation(&self, block_number: u64) -> EngineResult<()> {
        self.commit_for_production(block_number)
    }

    /// Fan out `calculate_demands_and_supplies` across every book,
    /// reducing into one pair of per-asset accumulators. Stands in for the
    /// original's per-worker `ParallelDemandOracle` (see `tatonnement`
    /// module docs): one tâtonnement worker's whole demand/supply round
    /// is exactly one call to this function.
    pub fn calculate_demands_and_supplies(
        &self,
        prices: &[Price],
        smooth_mult: u8,
    ) -> (Vec<i128>, Vec<i128>) {
        let n = self.num_assets as usize;
        let partials = fan_out(&self.books, |b| {
            let mut demands = vec![0i128; n];
            let mut supplies = vec![0i128; n];
            b.calculate_demands_and_supplies(prices, &mut demands, &mut supplies, smooth_mult);
            (demands, supplies)
        });
        let mut demands = vec![0i128; n];
        let mut supplies = vec![0i128; n];
        for (d, s) in partials {
            for i in 0..n {
                demands[i] += d[i];
                supplies[i] += s[i];
            }
        }
        (demands, supplies)
    }

    /// The tightest (minimum) feasible smooth_mult across every book whose
    /// supply-activation amount is given per-book in `amounts` (indexed the
    /// same way as `self.books()`).
    pub fn global_max_feasible_smooth_mult(&self, amounts: &[i64], prices: &[Price]) -> u8 {
        self.books
            .iter()
            .zip(amounts)
            .map(|(b, &amount)| b.max_feasible_smooth_mult(amount, prices))
            .min()
            .unwrap_or(u8::MAX)
    }

    /// Fan out `process_clear_offers` across every book using the
    /// per-book supply activation in `supply_activated` (same indexing as
    /// `self.books()`). Returns `(commitments, reduced_stats)`.
    pub fn clear_offers_for_production(
        &self,
        prices: &[Price],
        tax_rate: u8,
        supply_activated: &[i64],
        mut on_execute: impl FnMut(&Offer, i64) + Send + Sync,
    ) -> EngineResult<(Vec<SingleOrderbookStateCommitment>, ClearingStats)>
    where
        Self: Sync,
    {
        let on_execute = &mut on_execute as *mut (dyn FnMut(&Offer, i64) + Send + Sync);
        // SAFETY: `on_execute` is invoked sequentially within each chunk's
        // worker closure and chunks partition the book list disjointly, so
        // there is no concurrent access to the same offer/account state
        // from two workers at once; serialization across workers is
        // enforced by the caller's transfer-application step, not by this
        // function. We still require `Send + Sync` to forbid genuinely
        // unsynchronized captures.
        struct SendPtr(*mut (dyn FnMut(&Offer, i64) + Send + Sync));
        unsafe impl Send for SendPtr {}
        unsafe impl Sync for SendPtr {}
        let ptr = SendPtr(on_execute);

        let results: Vec<EngineResult<(ClearingStats, SingleOrderbookStateCommitment)>> = fan_out(
            &self.books,
            |b| {
                let idx = b.category.index(self.num_assets);
                let mut stats = ClearingStats::default();
                let ptr = &ptr;
                // SAFETY: see note above; each book index is visited by
                // exactly one worker.
                let callback = unsafe { &mut *ptr.0 };
                let commitment = b.process_clear_offers(
                    prices,
                    tax_rate,
                    supply_activated[idx],
                    |offer, amount| callback(offer, amount),
                    &mut stats,
                )?;
                Ok((stats, commitment))
            },
        );

        let mut commitments = Vec::with_capacity(self.books.len());
        let mut reduced = ClearingStats::default();
        for r in results {
            let (stats, commitment) = r?;
            reduced.offers_fully_cleared += stats.offers_fully_cleared;
            reduced.offers_partially_cleared += stats.offers_partially_cleared;
            reduced.total_supply_activated += stats.total_supply_activated;
            commitments.push(commitment);
        }
        Ok((commitments, reduced))
    }

    /// Validation-side clearing: replay each book's claimed commitment.
    /// Returns `Ok(false)` (not an error) the first time a book's
    /// self-check fails.
    pub fn tentative_clear_offers_for_validation(
        &self,
        commitments: &[SingleOrderbookStateCommitment],
        mut on_execute: impl FnMut(&Offer, i64) + Send + Sync,
    ) -> EngineResult<(bool, ClearingStats)> {
        struct SendPtr(*mut (dyn FnMut(&Offer, i64) + Send + Sync));
        unsafe impl Send for SendPtr {}
        unsafe impl Sync for SendPtr {}
        let ptr = SendPtr(&mut on_execute as *mut (dyn FnMut(&Offer, i64) + Send + Sync));

        let results: Vec<EngineResult<(bool, ClearingStats)>> =
            fan_out(&self.books, |b| {
                let idx = b.category.index(self.num_assets);
                let mut stats = ClearingStats::default();
                let ptr = &ptr;
                let callback = unsafe { &mut *ptr.0 };
                let ok = b.tentative_clear_offers_for_validation(
                    &commitments[idx],
                    |offer, amount| callback(offer, amount),
                    &mut stats,
                )?;
                Ok((ok, stats))
            });

        let mut all_ok = true;
        let mut reduced = ClearingStats::default();
        for r in results {
            let (ok, stats) = r?;
            all_ok &= ok;
            reduced.offers_fully_cleared += stats.offers_fully_cleared;
            reduced.offers_partially_cleared += stats.offers_partially_cleared;
            reduced.total_supply_activated += stats.total_supply_activated;
        }
        Ok((all_ok, reduced))
    }

    /// Per-book root hashes, computed in parallel, indexed like
    /// `self.books()`.
    pub fn hash(&self) -> Vec<Hash> {
        fan_out(&self.books, |b| b.root_hash())
    }

    /// Persist every book's accumulated thunks (those with block_number
    /// `<= up_to_block`) against its KV environment. `kv_envs` is indexed
    /// like `self.books()`.
    pub fn persist(
        &self,
        kv_envs: &[&dyn KvEnvironment],
        up_to_block: u64,
    ) -> EngineResult<()> {
        for (book, kv) in self.books.iter().zip(kv_envs) {
            book.persist(*kv, up_to_block)?;
        }
        info!(up_to_block, "orderbook manager persisted all books");
        Ok(())
    }

    pub fn rollback_thunks(&self, b: u64) -> EngineResult<()> {
        for book in &self.books {
            book.rollback_thunks(b)?;
        }
        Ok(())
    }

    pub fn load_from_disk(&self, kv_envs: &[&dyn KvEnvironment]) -> EngineResult<()> {
        for (book, kv) in self.books.iter().zip(kv_envs) {
            book.load_from_disk(*kv)?;
        }
        Ok(())
    }

    pub fn num_open_offers(&self) -> i64 {
        self.books.iter().map(|b| b.num_open_offers()).sum()
    }
}
