//! Block header hash map (§3, §6): a trie from block number (8-byte
//! big-endian) to block hash, KV-persisted. Invariant: a committed map at
//! block `N` contains entries for every round in `[1, N]`.

use std::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::kv::{KvEnvironment, KvReadTxn, KvWriteTxn};
use crate::trie::{ACCOUNT_KEY_BYTES, EndowMetadata, HasEndow, Hash, MerkleTrie, TrieValue};

/// Trie value wrapper around a raw block hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHash(pub Hash);

impl HasEndow for BlockHash {
    fn endow(&self) -> i64 {
        0
    }
}

impl TrieValue for BlockHash {
    type Extra = EndowMetadata;

    fn extra_metadata(&self) -> EndowMetadata {
        EndowMetadata { endow: 0 }
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl BlockHash {
    pub fn deserialize(bytes: &[u8]) -> EngineResult<Self> {
        let arr: Hash = bytes
            .try_into()
            .map_err(|_| EngineError::MetadataIntegrity {
                message: format!("block hash record has wrong length: {}", bytes.len()),
            })?;
        Ok(BlockHash(arr))
    }
}

fn block_key(block_number: u64) -> [u8; ACCOUNT_KEY_BYTES] {
    block_number.to_be_bytes()
}

/// The committed `block_number -> block_hash` trie plus its KV-backed
/// persistence.
pub struct BlockHeaderHashMap {
    trie: RwLock<MerkleTrie<ACCOUNT_KEY_BYTES, BlockHash>>,
}

impl Default for BlockHeaderHashMap {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockHeaderHashMap {
    pub fn new() -> Self {
        BlockHeaderHashMap {
            trie: RwLock::new(MerkleTrie::new()),
        }
    }

    /// Record block `B`'s hash. Errors if `B` was already recorded — each
    /// block number is finalized exactly once.
    pub fn insert(&self, block_number: u64, hash: Hash) -> EngineResult<()> {
        let mut trie = self.trie.write().unwrap();
        trie.insert(block_key(block_number), BlockHash(hash), |_, _| {
            Err(EngineError::MetadataIntegrity {
                message: format!("block {block_number} hash already recorded"),
            })
        })
    }

    pub fn get(&self, block_number: u64) -> Option<Hash> {
        self.trie
            .read()
            .unwrap()
            .get(&block_key(block_number))
            .map(|b| b.0)
    }

    pub fn root_hash(&self) -> Hash {
        self.trie.read().unwrap().hash()
    }

    /// Persist every entry in `[from_block, up_to_block]` to `kv` in one
    /// write transaction.
    pub fn persist(&self, kv: &dyn KvEnvironment, from_block: u64, up_to_block: u64) -> EngineResult<()> {
        if up_to_block < from_block {
            return Ok(());
        }
        let trie = self.trie.read().unwrap();
        let mut txn = kv.begin_write();
        for block_number in from_block..=up_to_block {
            if let Some(hash) = trie.get(&block_key(block_number)) {
                let mut buf = Vec::new();
                hash.serialize(&mut buf);
                txn.put(&block_key(block_number), buf);
            }
        }
        drop(trie);
        txn.commit(up_to_block)
    }

    /// Rebuild the trie from `kv`'s full snapshot. Used on cold start.
    pub fn load_from_disk(&self, kv: &dyn KvEnvironment) -> EngineResult<()> {
        let mut fresh = MerkleTrie::new();
        for (key, bytes) in kv.snapshot() {
            let block_number_bytes: [u8; ACCOUNT_KEY_BYTES] =
                key.as_slice()
                    .try_into()
                    .map_err(|_| EngineError::MetadataIntegrity {
                        message: "malformed persisted block-number key".to_string(),
                    })?;
            let hash = BlockHash::deserialize(&bytes)?;
            fresh.insert(block_number_bytes, hash, |_, _| Ok(()))?;
        }
        *self.trie.write().unwrap() = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let map = BlockHeaderHashMap::new();
        let hash = [7u8; 32];
        map.insert(1, hash).unwrap();
        assert_eq!(map.get(1), Some(hash));
        assert_eq!(map.get(2), None);
    }

    #[test]
    fn duplicate_block_number_is_an_error() {
        let map = BlockHeaderHashMap::new();
        map.insert(1, [1u8; 32]).unwrap();
        assert!(map.insert(1, [2u8; 32]).is_err());
    }
}
