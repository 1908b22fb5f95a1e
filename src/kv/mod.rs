//! The KV persistence layer (`SPEC_FULL.md` §6, §10.4).
//!
//! The settlement engine treats its on-disk store as opaque: one
//! [`KvEnvironment`] per subsystem (the account database, the block-header
//! hash map, and one per orderbook). This module defines that trait boundary
//! plus one concrete implementation, [`journal::JournalKv`], grounded on the
//! teacher's append-only, CRC32-checked, memory-mapped journal machinery —
//! reused here for key/value persistence instead of order-intake sequencing.

pub mod error;
pub mod journal;

pub use error::KvError;
pub use journal::JournalKv;

/// A read-only view of a [`KvEnvironment`] at a point in time.
pub trait KvReadTxn {
    /// Fetch the current value for `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// A buffered write transaction. Mutations are only visible to readers
/// (including this transaction's own `get`) after [`KvWriteTxn::commit`]
/// durably appends them and advances the environment's persisted round.
pub trait KvWriteTxn: KvReadTxn {
    /// Stage a `put`. Visible to this transaction's own `get` immediately,
    /// to the rest of the environment only after `commit`.
    fn put(&mut self, key: &[u8], value: Vec<u8>);

    /// Stage a `del`.
    fn del(&mut self, key: &[u8]);

    /// Durably append every staged mutation plus a commit marker carrying
    /// `round_number`, then make the mutations visible to the environment.
    /// `round_number` must be strictly greater than the environment's
    /// current persisted round.
    fn commit(self: Box<Self>, round_number: u64) -> Result<(), KvError>;
}

/// One persistence environment, providing "begin_read / begin_write / put
/// / get / del / commit_wtxn, with a retrievable persisted-round number"
/// per `SPEC_FULL.md` §6.
pub trait KvEnvironment: Send + Sync {
    /// Open a read-only transaction over the environment's committed state.
    fn begin_read(&self) -> Box<dyn KvReadTxn + '_>;

    /// Open a write transaction. Mutations buffer until `commit`.
    fn begin_write(&self) -> Box<dyn KvWriteTxn + '_>;

    /// The round number of the most recent durably committed write
    /// transaction, or `0` if the environment has never been committed to.
    fn persisted_round(&self) -> u64;

    /// A full dump of the environment's committed key/value pairs.
    ///
    /// The spec treats the on-disk store as an opaque B-tree that the real
    /// backend (LMDB/MDBX-like) exposes via range cursors; this crate's
    /// trait otherwise mirrors §6's literal method list exactly
    /// (`begin_read`/`begin_write`/`put`/`get`/`del`/`commit_wtxn`). Cold
    /// start (`load_from_disk`) needs to reconstruct a whole trie from
    /// scratch, which point lookups alone cannot do — `snapshot` is the
    /// minimal bulk-read affordance standing in for a cursor scan.
    fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>)>;
}
