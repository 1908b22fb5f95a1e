//! The block header wire shape (`SPEC_FULL.md` §6) and its canonical
//! BLAKE2b-256 hash.

use blake2::Digest;

use crate::orderbook::SingleOrderbookStateCommitment;
use crate::price::{Price, PRICE_BYTES};
use crate::trie::{Blake2b256, Hash};

/// The four state commitments a block header aggregates, in the order
/// they're hashed.
#[derive(Debug, Clone)]
pub struct BlockInternalHashes {
    /// Root hash of the account database at this block (out of scope for
    /// this crate beyond the hash itself — see [`super::database::AccountDatabase`]).
    pub db_hash: Hash,
    /// Per-orderbook clearing commitment, indexed the same way as
    /// [`crate::orderbook::OrderbookManager::books`].
    pub clearing_details: Vec<SingleOrderbookStateCommitment>,
    /// Root hash of this block's account modification log.
    pub modification_log_hash: Hash,
    /// Root hash of the block-header hash map *before* this block's own
    /// entry is inserted — the map at block `N` is defined to hold
    /// entries `[1, N]`, so the header for block `N` commits to the map
    /// as it stood after block `N-1`.
    pub block_map_hash: Hash,
}

/// A finalized (or candidate, pre-validation) block header.
#[derive(Debug, Clone)]
pub struct Block {
    pub prev_block_hash: Hash,
    pub block_number: u64,
    pub prices: Vec<Price>,
    pub fee_rate: u8,
    pub internal_hashes: BlockInternalHashes,
}

impl Block {
    /// Canonical serialization: `prev_block_hash(32) ‖ block_number(8) ‖
    /// len(prices)(4) ‖ prices(6 each) ‖ fee_rate(1) ‖ db_hash(32) ‖
    /// len(clearing_details)(4) ‖ clearing_details ‖
    /// modification_log_hash(32) ‖ block_map_hash(32)`, all big-endian.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.prev_block_hash);
        out.extend_from_slice(&self.block_number.to_be_bytes());
        out.extend_from_slice(&(self.prices.len() as u32).to_be_bytes());
        for p in &self.prices {
            let mut buf = [0u8; PRICE_BYTES];
            p.write_big_endian(&mut buf);
            out.extend_from_slice(&buf);
        }
        out.push(self.fee_rate);

        out.extend_from_slice(&self.internal_hashes.db_hash);
        out.extend_from_slice(&(self.internal_hashes.clearing_details.len() as u32).to_be_bytes());
        for c in &self.internal_hashes.clearing_details {
            out.extend_from_slice(&c.root_hash);
            out.extend_from_slice(&c.fractional_supply_activated.to_be_bytes());
            out.extend_from_slice(&c.partial_exec_offer_activation_amount.to_be_bytes());
            out.extend_from_slice(&c.partial_exec_threshold_key.to_bytes());
            out.extend_from_slice(&(c.threshold_key_is_null as u32).to_be_bytes());
        }
        out.extend_from_slice(&self.internal_hashes.modification_log_hash);
        out.extend_from_slice(&self.internal_hashes.block_map_hash);
    }

    /// BLAKE2b-256 of the canonical serialization — the value inserted
    /// into the block-header hash map and compared during validation.
    pub fn block_hash(&self) -> Hash {
        let mut buf = Vec::new();
        self.serialize(&mut buf);
        let mut hasher = Blake2b256::new();
        hasher.update(&buf);
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::OrderbookKey;

    fn sample_commitment() -> SingleOrderbookStateCommitment {
        SingleOrderbookStateCommitment {
            root_hash: [1u8; 32],
            fractional_supply_activated: 100,
            partial_exec_offer_activation_amount: 0,
            partial_exec_threshold_key: OrderbookKey::null_threshold(),
            threshold_key_is_null: true,
        }
    }

    fn sample_block() -> Block {
        Block {
            prev_block_hash: [0u8; 32],
            block_number: 1,
            prices: vec![Price::ONE, Price::ONE],
            fee_rate: 10,
            internal_hashes: BlockInternalHashes {
                db_hash: [2u8; 32],
                clearing_details: vec![sample_commitment()],
                modification_log_hash: [3u8; 32],
                block_map_hash: [4u8; 32],
            },
        }
    }

    #[test]
    fn hash_is_deterministic() {
        let a = sample_block();
        let b = sample_block();
        assert_eq!(a.block_hash(), b.block_hash());
    }

    #[test]
    fn hash_changes_with_block_number() {
        let a = sample_block();
        let mut b = sample_block();
        b.block_number = 2;
        assert_ne!(a.block_hash(), b.block_hash());
    }
}
