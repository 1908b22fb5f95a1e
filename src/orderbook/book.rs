//! A single (sell, buy) orderbook: committed/uncommitted offer tries, the
//! cumulative-endow index, demand/supply integration, and clearing.
//! Grounded on `orderbook/orderbook.h`.

use std::sync::{Mutex, RwLock};

use tracing::{debug, trace, warn};

use super::cumulative_index::CumulativeEndowIndex;
use super::key::OrderbookKey;
use super::offer::{Offer, OfferCategory};
use super::thunk::PersistenceThunk;
use crate::error::{EngineError, EngineResult};
use crate::kv::{KvEnvironment, KvReadTxn, KvWriteTxn};
use crate::price::{wide_multiply_val_by_a_over_b, Price, PRICE_BIT_LEN};
use crate::trie::{MerkleTrie, ORDERBOOK_KEY_BYTES};

pub type OfferTrie = MerkleTrie<ORDERBOOK_KEY_BYTES, Offer>;

/// Depth passed to `metadata_traversal` when building the cumulative-endow
/// index: the orderbook key embeds a 16-bit reserved header in front of
/// the 48-bit price field (see `SPEC_FULL.md` §3), so traversing 64 bits
/// (16 reserved + 48 price) yields a `u64` interpretation exactly equal to
/// the offer's raw `Price` value — the reserved bytes are always zero.
const INDEX_TRAVERSAL_DEPTH_BITS: u16 = 16 + PRICE_BIT_LEN as u16;

/// Per-orderbook statistics accumulated during clearing, reduced across
/// the orderbook manager's fan-out.
#[derive(Debug, Clone, Default)]
pub struct ClearingStats {
    pub offers_fully_cleared: u64,
    pub offers_partially_cleared: u64,
    pub total_supply_activated: i64,
}

/// A straddling-offer clearing outcome for one orderbook, stored in the
/// block header per `SPEC_FULL.md` §6.
#[derive(Debug, Clone)]
pub struct SingleOrderbookStateCommitment {
    pub root_hash: crate::trie::Hash,
    pub fractional_supply_activated: u128,
    pub partial_exec_offer_activation_amount: u128,
    pub partial_exec_threshold_key: OrderbookKey,
    pub threshold_key_is_null: bool,
}

pub struct Orderbook {
    pub category: OfferCategory,
    committed: RwLock<OfferTrie>,
    uncommitted: Mutex<OfferTrie>,
    index: RwLock<CumulativeEndowIndex>,
    thunks: Mutex<Vec<PersistenceThunk>>,
}

impl Orderbook {
    pub fn new(category: OfferCategory) -> Self {
        Orderbook {
            category,
            committed: RwLock::new(MerkleTrie::new()),
            uncommitted: Mutex::new(MerkleTrie::new()),
            index: RwLock::new(CumulativeEndowIndex::default()),
            thunks: Mutex::new(Vec::new()),
        }
    }

    // ---- offer intake --------------------------------------------------

    /// Merge a locally-built batch of new offers into the uncommitted set.
    /// Errors if any offer id collides with one already present.
    pub fn add_offers(&self, local_trie: OfferTrie) -> EngineResult<()> {
        let mut uncommitted = self.uncommitted.lock().unwrap();
        uncommitted.merge_in(local_trie, |existing, incoming| {
            Err(EngineError::DuplicateOfferId {
                offer_id: if existing.offer_id == incoming.offer_id {
                    existing.offer_id
                } else {
                    incoming.offer_id
                },
            })
        })
    }

    pub fn mark_for_deletion(&self, key: OrderbookKey) -> Option<Offer> {
        let mut committed = self.committed.write().unwrap();
        committed.mark_for_deletion(&key.to_bytes())
    }

    // ---- commit ----------------------------------------------------

    pub fn commit_for_production(&self, block_number: u64) -> EngineResult<()> {
        let mut thunk = PersistenceThunk::new(block_number);

        let mut uncommitted = self.uncommitted.lock().unwrap();
        let snapshot = std::mem::replace(&mut *uncommitted, MerkleTrie::new());
        thunk.uncommitted_offers = snapshot.values_in_order();
        drop(uncommitted);

        let mut committed = self.committed.write().unwrap();
        committed.perform_marked_deletions(|prefix, offer| {
            thunk
                .deleted_keys
                .push((OrderbookKey::from_bytes(prefix.bytes()), offer));
        });

        let batch = {
            let mut b = MerkleTrie::new();
            for offer in &thunk.uncommitted_offers {
                let key = OrderbookKey {
                    price: offer.min_price,
                    owner: offer.owner,
                    offer_id: offer.offer_id,
                }
                .to_bytes();
                b.insert(key, offer.clone(), |_, _| {
                    Err(EngineError::DuplicateOfferId {
                        offer_id: offer.offer_id,
                    })
                })?;
            }
            b
        };
        committed.merge_in(batch, |existing, incoming| {
            Err(EngineError::DuplicateOfferId {
                offer_id: existing.offer_id.max(incoming.offer_id),
            })
        })?;

        let traversal = committed.metadata_traversal(INDEX_TRAVERSAL_DEPTH_BITS);
        *self.index.write().unwrap() = CumulativeEndowIndex::build(traversal);

        self.thunks.lock().unwrap().push(thunk);
        debug!(block_number, category = ?self.category, "orderbook committed for production");
        Ok(())
    }

    // ---- price / metadata queries ---------------------------------------

    pub fn get_execution_prices(&self, prices: &[Price], smooth_mult: u8) -> (Price, Price) {
        let sell = prices[self.category.sell_asset as usize];
        let buy = prices[self.category.buy_asset as usize];
        let upper_raw = ((sell.0 as u128) << crate::price::PRICE_RADIX) / buy.0 as u128;
        let upper = Price::new(upper_raw as u64);
        let lower = upper.smooth_mult(smooth_mult);
        (lower, upper)
    }

    pub fn get_metadata(&self, p: Price) -> (i64, i128) {
        self.index.read().unwrap().get_metadata(p)
    }

    /// Integrate demand (in buy-asset terms) and supply (in sell-asset
    /// terms) at the given prices into the shared accumulators, both
    /// expressed as radix-24 fixed point (`<< PRICE_RADIX`), matching the
    /// original engine's demand/supply accumulator convention.
    pub fn calculate_demands_and_supplies(
        &self,
        prices: &[Price],
        demands: &mut [i128],
        supplies: &mut [i128],
        smooth_mult: u8,
    ) {
        let (lower, upper) = self.get_execution_prices(prices, smooth_mult);
        let index = self.index.read().unwrap();

        let (supply_raw, demand_raw) = if smooth_mult == 0 {
            let (endow, endow_times_price) = index.get_metadata(upper);
            (
                (endow as i128) << crate::price::PRICE_RADIX,
                endow_times_price,
            )
        } else {
            let (endow_lower, _) = index.get_metadata(lower);
            let mut supply = (endow_lower as i128) << crate::price::PRICE_RADIX;

            for (price_prefix, incremental) in index.entries_in_band(lower.0, upper.0) {
                let weighted = wide_multiply_val_by_a_over_b(
                    (incremental as u128) << crate::price::PRICE_RADIX,
                    Price(upper.0 - price_prefix),
                    Price(upper.0 - lower.0),
                );
                supply += weighted as i128;
            }
            let demand = wide_multiply_val_by_a_over_b(supply as u128, upper, Price::ONE) as i128;
            (supply, demand)
        };

        supplies[self.category.sell_asset as usize] += supply_raw;
        demands[self.category.buy_asset as usize] += demand_raw;
        trace!(
            category = ?self.category,
            supply_raw,
            demand_raw,
            "integrated demand/supply"
        );
    }

    /// The largest `smooth_mult` for which the supply-activation lower
    /// bound is still `<= amount`. Ported from the original's binary search
    /// over the cumulative-endow index keyed on `amount` (not on a price),
    /// compared against the raw (unsmoothed) exchange rate.
    pub fn max_feasible_smooth_mult(&self, amount: i64, prices: &[Price]) -> u8 {
        let (_, exact_exchange_rate) = self.get_execution_prices(prices, 0);
        let index = self.index.read().unwrap();
        let Some(entry) = index.first_entry_exceeding(amount) else {
            return u8::MAX;
        };
        let max_activated_price = entry.price_prefix;
        if exact_exchange_rate.0 <= max_activated_price {
            return u8::MAX;
        }
        let raw_difference = exact_exchange_rate.0 - max_activated_price;
        let mut out: u32 = 0;
        while out < 63 && raw_difference <= (exact_exchange_rate.0 >> out) {
            out += 1;
        }
        if out > 0 {
            (out - 1) as u8
        } else {
            0
        }
    }

    // ---- clearing ----------------------------------------------------

    /// Split the committed trie at `supply_activated.floor()`, executing
    /// everything below the split fully and (if any endowment remains in
    /// the leading offer of the remainder) partially executing that one
    /// offer against the provided prices.
    pub fn process_clear_offers(
        &self,
        prices: &[Price],
        tax_rate: u8,
        supply_activated: i64,
        mut on_execute: impl FnMut(&Offer, i64),
        stats: &mut ClearingStats,
    ) -> EngineResult<SingleOrderbookStateCommitment> {
        let mut committed = self.committed.write().unwrap();
        let cleared = committed.endow_split(supply_activated);

        let mut total_cleared = 0i64;
        for offer in cleared.values_in_order() {
            on_execute(&offer, offer.amount);
            total_cleared += offer.amount;
            stats.offers_fully_cleared += 1;
        }
        stats.total_supply_activated += total_cleared;

        let remainder_endow = supply_activated - total_cleared;
        let mut threshold_key = OrderbookKey::null_threshold();
        let mut threshold_is_null = true;
        let mut partial_amount: i64 = 0;

        if remainder_endow > 0 {
            // the leading offer of the remaining trie straddles the split.
            if let Some(leading) = committed.values_in_order().into_iter().next() {
                let execute_amount = remainder_endow.min(leading.amount);
                on_execute(&leading, execute_amount);
                partial_amount = execute_amount;
                threshold_key = OrderbookKey {
                    price: leading.min_price,
                    owner: leading.owner,
                    offer_id: leading.offer_id,
                };
                threshold_is_null = false;
                stats.offers_partially_cleared += 1;

                let remaining_amount = leading.amount - execute_amount;
                if remaining_amount <= 0 {
                    committed.delete(&threshold_key.to_bytes());
                } else {
                    let key_bytes = threshold_key.to_bytes();
                    committed.delete(&key_bytes);
                    let mut updated = leading.clone();
                    updated.amount = remaining_amount;
                    committed.insert(key_bytes, updated, |_, _| Ok(()))?;
                }
            }
        }

        let mut thunks = self.thunks.lock().unwrap();
        if let Some(thunk) = thunks.last_mut() {
            thunk.cleared_offers = cleared;
            if threshold_is_null {
                thunk.set_no_partial_exec();
            } else if let Some(leading) = thunk
                .uncommitted_offers
                .iter()
                .find(|o| o.offer_id == threshold_key.offer_id)
                .cloned()
            {
                thunk.set_partial_exec(threshold_key, partial_amount, leading);
            }
        }
        drop(thunks);

        let traversal = committed.metadata_traversal(INDEX_TRAVERSAL_DEPTH_BITS);
        *self.index.write().unwrap() = CumulativeEndowIndex::build(traversal);

        let _ = tax_rate;
        let _ = prices;

        Ok(SingleOrderbookStateCommitment {
            root_hash: committed.hash(),
            fractional_supply_activated: supply_activated as u128,
            partial_exec_offer_activation_amount: partial_amount as u128,
            partial_exec_threshold_key: threshold_key,
            threshold_key_is_null: threshold_is_null,
        })
    }

    /// Validation-side counterpart: split at exactly the claimed
    /// threshold, verify the split weight matches the claimed activation,
    /// then apply the same executions. Returns `false` (no mutation is
    /// left uncommitted — caller's autorollback guard handles that) if any
    /// check fails.
    pub fn tentative_clear_offers_for_validation(
        &self,
        commitment: &SingleOrderbookStateCommitment,
        mut on_execute: impl FnMut(&Offer, i64),
        stats: &mut ClearingStats,
    ) -> EngineResult<bool> {
        let mut committed = self.committed.write().unwrap();
        let activation = commitment.fractional_supply_activated as i64;
        let cleared = committed.endow_split(activation);

        let split_weight: i64 = cleared.metadata().extra.endow;
        if !commitment.threshold_key_is_null {
            // the claimed threshold offer must still be present and its
            // partial-execution amount consistent.
            let key_bytes = commitment.partial_exec_threshold_key.to_bytes();
            let Some(offer) = committed.get(&key_bytes) else {
                warn!("validation: partial-exec offer missing from committed trie");
                return Ok(false);
            };
            let exec_amount = commitment.partial_exec_offer_activation_amount as i64;
            if exec_amount > offer.amount {
                return Ok(false);
            }
            for o in cleared.values_in_order() {
                on_execute(&o, o.amount);
                stats.offers_fully_cleared += 1;
            }
            on_execute(&offer, exec_amount);
            stats.offers_partially_cleared += 1;
            let remaining = offer.amount - exec_amount;
            committed.delete(&key_bytes);
            if remaining > 0 {
                let mut updated = offer.clone();
                updated.amount = remaining;
                committed.insert(key_bytes, updated, |_, _| Ok(()))?;
            }
            stats.total_supply_activated += split_weight + exec_amount;
        } else {
            for o in cleared.values_in_order() {
                on_execute(&o, o.amount);
                stats.offers_fully_cleared += 1;
            }
            stats.total_supply_activated += split_weight;
        }

        let traversal = committed.metadata_traversal(INDEX_TRAVERSAL_DEPTH_BITS);
        *self.index.write().unwrap() = CumulativeEndowIndex::build(traversal);
        Ok(true)
    }

    pub fn root_hash(&self) -> crate::trie::Hash {
        self.committed.read().unwrap().hash()
    }

    pub fn num_open_offers(&self) -> i64 {
        self.committed.read().unwrap().size() + self.uncommitted.lock().unwrap().size()
    }

    /// Undo every thunk with `block_number > b` that has not yet been
    /// persisted: reinsert deleted keys, reattach the cleared-offers trie,
    /// remove newly-added offers, and restore the partial-exec offer.
    pub fn rollback_thunks(&self, b: u64) -> EngineResult<()> {
        let mut thunks = self.thunks.lock().unwrap();
        let mut committed = self.committed.write().unwrap();

        while let Some(thunk) = thunks.last() {
            if thunk.block_number <= b {
                break;
            }
            let thunk = thunks.pop().unwrap();

            for offer in &thunk.uncommitted_offers {
                let key = OrderbookKey {
                    price: offer.min_price,
                    owner: offer.owner,
                    offer_id: offer.offer_id,
                }
                .to_bytes();
                committed.delete(&key);
            }

            committed.merge_in(thunk.cleared_offers, |_, _| Ok(()))?;

            for (key, offer) in thunk.deleted_keys {
                committed.insert(key.to_bytes(), offer, |_, _| Ok(()))?;
            }

            if let Some(record) = &thunk.partial_exec {
                committed.delete(&record.key.to_bytes());
                committed.insert(
                    record.key.to_bytes(),
                    record.preexecute_offer.clone(),
                    |_, _| Ok(()),
                )?;
            }
        }

        let traversal = committed.metadata_traversal(INDEX_TRAVERSAL_DEPTH_BITS);
        *self.index.write().unwrap() = CumulativeEndowIndex::build(traversal);
        Ok(())
    }

    pub fn drain_thunks_older_than(&self, b: u64) -> Vec<PersistenceThunk> {
        let mut thunks = self.thunks.lock().unwrap();
        let (keep, drain): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *thunks).into_iter().partition(|t| t.block_number > b);
        *thunks = keep;
        drain
    }

    // ---- persistence -------------------------------------------------

    /// Drain every not-yet-persisted thunk with `block_number <= up_to_block`
    /// and replay them against `kv` within a single write transaction,
    /// oldest-to-newest. `SPEC_FULL.md` §4.8's four-step algorithm reasons
    /// about a maximum partial-exec-key threshold because it is scanning
    /// the KV store with range cursors; here the same net effect falls out
    /// of replaying `del`/`put` for each thunk's own recorded keys in
    /// chronological order — a later thunk's delete of a key a prior
    /// thunk inserted simply overwrites it within the same transaction.
    pub fn persist(
        &self,
        kv: &dyn KvEnvironment,
        up_to_block: u64,
    ) -> EngineResult<()> {
        let thunks = {
            let mut thunks = self.thunks.lock().unwrap();
            let (persist, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut *thunks)
                .into_iter()
                .partition(|t| t.block_number <= up_to_block);
            *thunks = keep;
            persist
        };
        if thunks.is_empty() {
            return Ok(());
        }

        let mut txn = kv.begin_write();
        for thunk in &thunks {
            for offer in thunk.cleared_offers.values_in_order() {
                let key = OrderbookKey {
                    price: offer.min_price,
                    owner: offer.owner,
                    offer_id: offer.offer_id,
                }
                .to_bytes();
                txn.del(&key);
            }
            for (key, _offer) in &thunk.deleted_keys {
                txn.del(&key.to_bytes());
            }
            for offer in &thunk.uncommitted_offers {
                let key = OrderbookKey {
                    price: offer.min_price,
                    owner: offer.owner,
                    offer_id: offer.offer_id,
                }
                .to_bytes();
                let mut buf = Vec::new();
                crate::trie::TrieValue::serialize(offer, &mut buf);
                txn.put(&key, buf);
            }
            if let Some(record) = &thunk.partial_exec {
                let key_bytes = record.key.to_bytes();
                let base_amount = match txn.get(&key_bytes) {
                    Some(bytes) => Offer::deserialize(&bytes)?.amount,
                    None => record.preexecute_offer.amount,
                };
                let remaining = base_amount - record.amount;
                if remaining <= 0 {
                    txn.del(&key_bytes);
                } else {
                    let mut updated = record.preexecute_offer.clone();
                    updated.amount = remaining;
                    let mut buf = Vec::new();
                    crate::trie::TrieValue::serialize(&updated, &mut buf);
                    txn.put(&key_bytes, buf);
                }
            }
        }
        txn.commit(up_to_block)?;
        debug!(block_number = up_to_block, category = ?self.category, "orderbook persisted");
        Ok(())
    }

    /// Rebuild the committed trie and cumulative-endow index from a KV
    /// environment's full snapshot. Used on cold start / replay.
    pub fn load_from_disk(&self, kv: &dyn KvEnvironment) -> EngineResult<()> {
        let mut fresh = MerkleTrie::new();
        for (key, bytes) in kv.snapshot() {
            let offer = Offer::deserialize(&bytes)?;
            let key_arr: [u8; ORDERBOOK_KEY_BYTES] =
                key.as_slice()
                    .try_into()
                    .map_err(|_| EngineError::MetadataIntegrity {
                        message: "malformed persisted orderbook key".to_string(),
                    })?;
            fresh.insert(key_arr, offer, |_, _| Ok(()))?;
        }
        let traversal = fresh.metadata_traversal(INDEX_TRAVERSAL_DEPTH_BITS);
        *self.index.write().unwrap() = CumulativeEndowIndex::build(traversal);
        *self.committed.write().unwrap() = fresh;
        Ok(())
    }
}
