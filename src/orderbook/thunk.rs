//! Persistence thunks: a deferred record of one block's mutations to one
//! orderbook, sufficient to either replay them into the KV store or undo
//! them entirely. Grounded on `orderbook/thunk.h`.

use super::key::OrderbookKey;
use super::offer::Offer;
use crate::trie::MerkleTrie;

/// A thunk's partial-exec record, if the book had a straddling offer that
/// block.
#[derive(Debug, Clone)]
pub struct PartialExecRecord {
    pub key: OrderbookKey,
    pub amount: i64,
    pub preexecute_offer: Offer,
}

/// One block's worth of deferred mutation to an orderbook, accumulated
/// during `commit_for_production`/`process_clear_offers` and replayed
/// against the KV store at persist time (or discarded on rollback).
pub struct PersistenceThunk {
    pub block_number: u64,
    pub partial_exec: Option<PartialExecRecord>,
    /// Offers newly added to the committed trie this block (pre-clearing
    /// snapshot of what was merged from uncommitted).
    pub uncommitted_offers: Vec<Offer>,
    /// Offers physically removed this block, carried as (key, offer) pairs
    /// so the thunk can restore them on rollback.
    pub deleted_keys: Vec<(OrderbookKey, Offer)>,
    /// The subtrie of offers this block cleared wholesale — kept only for
    /// rollback; not replayed to the KV store (cleared offers are deletes,
    /// not inserts).
    pub cleared_offers: MerkleTrie<{ crate::trie::ORDERBOOK_KEY_BYTES }, Offer>,
}

impl PersistenceThunk {
    pub fn new(block_number: u64) -> Self {
        PersistenceThunk {
            block_number,
            partial_exec: None,
            uncommitted_offers: Vec::new(),
            deleted_keys: Vec::new(),
            cleared_offers: MerkleTrie::new(),
        }
    }

    pub fn set_no_partial_exec(&mut self) {
        self.partial_exec = None;
    }

    pub fn set_partial_exec(&mut self, key: OrderbookKey, amount: i64, preexecute_offer: Offer) {
        self.partial_exec = Some(PartialExecRecord {
            key,
            amount,
            preexecute_offer,
        });
    }

    pub fn exists_partial_exec(&self) -> bool {
        self.partial_exec.is_some()
    }

    pub fn partial_exec_key(&self) -> OrderbookKey {
        self.partial_exec
            .as_ref()
            .map(|p| p.key)
            .unwrap_or_else(OrderbookKey::null_threshold)
    }
}
