//! Node metadata: a commutative sum aggregated up the trie.
//!
//! Every node carries `{size, num_deleted_subnodes, num_rollback_subnodes,
//! extra}`, where `extra` is a pluggable per-use-case payload (offer
//! endowment for orderbooks; `()` for the header-hash map and account log).
//! All four fields are commutative under `+=`/`-=`, which is what lets
//! metadata be maintained incrementally as leaves are inserted, deleted,
//! and merged rather than recomputed from scratch.

/// A pluggable metadata payload merged alongside the structural
/// `size`/`num_deleted`/`num_rollback` fields every node already carries.
pub trait ExtraMetadata: Copy + Default + Send + Sync + std::fmt::Debug {
    fn combine(&mut self, other: &Self);
    fn uncombine(&mut self, other: &Self);
}

/// The trivial extra-metadata payload: tries that only need size/deletion
/// bookkeeping (the block-header-hash map, the account modification log)
/// use this.
impl ExtraMetadata for () {
    fn combine(&mut self, _other: &Self) {}
    fn uncombine(&mut self, _other: &Self) {}
}

/// Per-offer endowment, summed across a subtrie. This is the orderbook
/// use case's extra metadata (`OrderbookMetadata` in the original source).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndowMetadata {
    /// Sum of `amount` across all live offers in the subtrie.
    pub endow: i64,
}

impl ExtraMetadata for EndowMetadata {
    fn combine(&mut self, other: &Self) {
        self.endow += other.endow;
    }
    fn uncombine(&mut self, other: &Self) {
        self.endow -= other.endow;
    }
}

/// Anything that can report its own endowment contribution (a single
/// offer, or a value type used as a trie leaf).
pub trait HasEndow {
    fn endow(&self) -> i64;
}

/// Combined node metadata: size + deletion/rollback mixins + a pluggable
/// extra payload. Mirrors `CombinedMetadata<DeletableMixin, SizeMixin,
/// RollbackMixin, X>` from the original source, flattened into one struct
/// because Rust's trait system makes a literal mixin chain more ceremony
/// than value here.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrieMetadata<X: ExtraMetadata> {
    /// Number of live leaves in the subtrie.
    pub size: i64,
    /// Number of leaves marked for deletion but not yet removed.
    pub num_deleted: i64,
    /// Number of leaves inserted with a rollback marker still set.
    pub num_rollback: i64,
    /// Use-case-specific payload (e.g. summed endowment).
    pub extra: X,
}

impl<X: ExtraMetadata> TrieMetadata<X> {
    pub fn leaf(extra: X) -> Self {
        TrieMetadata {
            size: 1,
            num_deleted: 0,
            num_rollback: 0,
            extra,
        }
    }

    pub fn combine(&mut self, other: &Self) {
        self.size += other.size;
        self.num_deleted += other.num_deleted;
        self.num_rollback += other.num_rollback;
        self.extra.combine(&other.extra);
    }

    pub fn uncombine(&mut self, other: &Self) {
        self.size -= other.size;
        self.num_deleted -= other.num_deleted;
        self.num_rollback -= other.num_rollback;
        self.extra.uncombine(&other.extra);
    }

    /// Number of leaves that are live (not marked for deletion). Used to
    /// decide whether a subtrie contributes anything to the root hash.
    pub fn live_size(&self) -> i64 {
        self.size - self.num_deleted
    }

    /// Basic integrity check: none of the counters may be negative, and
    /// the deleted/rollback counts may not exceed size. Call after any
    /// combine/uncombine sequence that should restore a consistent state
    /// (e.g. post-merge, post-split).
    pub fn check_integrity(&self) -> Result<(), crate::error::EngineError> {
        if self.size < 0 || self.num_deleted < 0 || self.num_rollback < 0 {
            return Err(crate::error::EngineError::MetadataIntegrity {
                message: format!(
                    "negative metadata counter: size={}, deleted={}, rollback={}",
                    self.size, self.num_deleted, self.num_rollback
                ),
            });
        }
        if self.num_deleted > self.size {
            return Err(crate::error::EngineError::MetadataIntegrity {
                message: format!(
                    "deleted count {} exceeds size {}",
                    self.num_deleted, self.size
                ),
            });
        }
        Ok(())
    }
}
