//! The account database boundary. `SPEC_FULL.md` §1 excludes "user-account
//! balance arithmetic details beyond what's needed to report transfers"
//! from scope; this crate only needs a root hash and a per-block commit
//! point to assemble and check block headers, so that's all the trait
//! asks for.

use crate::trie::Hash;

/// A point-in-time-snapshottable account store. The real implementation
/// (balances, sequence numbers, signature checks) lives outside this
/// crate; block production and validation only ever touch it through
/// this boundary.
pub trait AccountDatabase: Send + Sync {
    /// Snapshot newly-created accounts as of `block_number`, matching the
    /// original's `commit_new_accounts` call in the production pipeline's
    /// step 2.
    fn commit_new_accounts(&self, block_number: u64) -> crate::error::EngineResult<()>;

    /// The database's current Merkle root, contributed to the block
    /// header as `db_hash`.
    fn root_hash(&self) -> Hash;
}

/// A fixed-hash stand-in for [`AccountDatabase`], useful for exercising
/// the block lifecycle without a real balance ledger.
#[derive(Debug, Clone, Copy)]
pub struct FixedHashDatabase(pub Hash);

impl AccountDatabase for FixedHashDatabase {
    fn commit_new_accounts(&self, _block_number: u64) -> crate::error::EngineResult<()> {
        Ok(())
    }

    fn root_hash(&self) -> Hash {
        self.0
    }
}
