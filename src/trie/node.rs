//! Trie node representation and canonical hashing.

use super::metadata::{ExtraMetadata, TrieMetadata};
use super::prefix::KeyPrefix;
use blake2::{Blake2b, Digest, digest::consts::U32};
use crossbeam::atomic::AtomicCell;

/// BLAKE2b with a 32-byte (256-bit) digest — the hash function this trie
/// uses throughout, per `SPEC_FULL.md` §4.1.
pub type Blake2b256 = Blake2b<U32>;

pub type Hash = [u8; 32];

/// Anything storable as a trie leaf value: cloneable, serializable into
/// the canonical hash preimage, and carrying a use-case-specific metadata
/// contribution (`Extra`).
pub trait TrieValue: Clone + Send + Sync + std::fmt::Debug {
    type Extra: ExtraMetadata;

    /// Metadata this value contributes when inserted as a fresh leaf.
    fn extra_metadata(&self) -> Self::Extra;

    /// Canonical serialization, appended to `out`, used as the leaf body
    /// in the hash preimage.
    fn serialize(&self, out: &mut Vec<u8>);
}

pub(super) enum NodeKind<const N: usize, V: TrieValue> {
    Leaf {
        value: V,
        deleted: bool,
        rollback: bool,
    },
    Internal {
        // 16 child slots, indexed by nibble value.
        children: Box<[Option<Box<TrieNode<N, V>>>; 16]>,
    },
}

pub struct TrieNode<const N: usize, V: TrieValue> {
    pub(super) prefix: KeyPrefix<N>,
    pub(super) kind: NodeKind<N, V>,
    pub(super) metadata: TrieMetadata<V::Extra>,
    /// Lock-free cache for this node's hash: cleared (`None`) on every
    /// structural mutation along the path from root, recomputed lazily by
    /// [`TrieNode::hash`]. `AtomicCell` rather than an `RwLock` because the
    /// invalidate/read/store traffic here is pure single-word bookkeeping,
    /// not a multi-field snapshot — the same distinction §5 draws between
    /// metadata updates (relaxed, lock-free) and full-struct reads
    /// (exclusive lock).
    cached_hash: AtomicCell<Option<Hash>>,
}

impl<const N: usize, V: TrieValue> TrieNode<N, V> {
    pub fn new_leaf(prefix: KeyPrefix<N>, value: V) -> Self {
        let metadata = TrieMetadata::leaf(value.extra_metadata());
        TrieNode {
            prefix,
            kind: NodeKind::Leaf {
                value,
                deleted: false,
                rollback: false,
            },
            metadata,
            cached_hash: AtomicCell::new(None),
        }
    }

    pub fn new_internal(prefix: KeyPrefix<N>) -> Self {
        TrieNode {
            prefix,
            kind: NodeKind::Internal {
                children: Box::new(Default::default()),
            },
            metadata: TrieMetadata::default(),
            cached_hash: AtomicCell::new(None),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    /// Invalidate the cached hash. Must be called on every node along the
    /// path from root to any structural mutation.
    pub fn invalidate_hash(&self) {
        self.cached_hash.store(None);
    }

    fn cached(&self) -> Option<Hash> {
        self.cached_hash.load()
    }

    fn set_cached(&self, hash: Hash) {
        self.cached_hash.store(Some(hash));
    }

    /// Recompute (or return the cached) hash of this node, applying the
    /// lazy-delete single-live-child passthrough rule: when deletable
    /// bookkeeping shows exactly one live child remains under an internal
    /// node, that child's hash is passed through unchanged, preserving
    /// canonicality across mark/perform-delete cycles.
    pub fn hash(&self) -> Hash {
        if let Some(h) = self.cached() {
            return h;
        }
        let h = match &self.kind {
            NodeKind::Leaf {
                value, deleted: _, ..
            } => {
                let mut preimage = Vec::new();
                self.prefix.write_node_header(&mut preimage);
                value.serialize(&mut preimage);
                let mut hasher = Blake2b256::new();
                hasher.update(&preimage);
                let out: Hash = hasher.finalize().into();
                out
            }
            NodeKind::Internal { children } => {
                let live: Vec<&Box<TrieNode<N, V>>> = children
                    .iter()
                    .filter_map(|c| c.as_ref())
                    .filter(|c| c.metadata.live_size() > 0)
                    .collect();

                if live.len() == 1 {
                    // Pass-through: the single live child's hash represents
                    // this node, keeping the root hash stable regardless of
                    // how many dead siblings are pruned around it.
                    return live[0].hash();
                }

                let mut bitvector: u16 = 0;
                for (i, c) in children.iter().enumerate() {
                    if let Some(c) = c {
                        if c.metadata.live_size() > 0 {
                            bitvector |= 1 << i;
                        }
                    }
                }

                let mut preimage = Vec::new();
                self.prefix.write_node_header(&mut preimage);
                preimage.extend_from_slice(&bitvector.to_be_bytes());
                for c in live {
                    preimage.extend_from_slice(&c.hash());
                }
                let mut hasher = Blake2b256::new();
                hasher.update(&preimage);
                let out: Hash = hasher.finalize().into();
                out
            }
        };
        self.set_cached(h);
        h
    }
}
