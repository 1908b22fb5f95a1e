//! The concurrent Merkle-Patricia trie: radix-16, fixed-length keys,
//! pluggable value/metadata. See `SPEC_FULL.md` §4.1.
//!
//! Concurrency note: the original engine gives every node its own
//! reader/writer lock and lets worker threads "steal" disjoint subtrees out
//! from under a locked parent mid-merge. Rust's ownership model makes that
//! protocol both unsafe-laden and unnecessary: [`MerkleTrie::parallel_batch_merge`]
//! instead partitions the top-level 16 children across threads, handing
//! each thread a uniquely-owned subtree — disjointness is proven by the
//! borrow checker, not a runtime lock. This is recorded as a deliberate
//! simplification in `DESIGN.md`.

use super::metadata::{EndowMetadata, ExtraMetadata, TrieMetadata};
use super::node::{Hash, NodeKind, TrieNode, TrieValue};
use super::prefix::KeyPrefix;
use crate::error::EngineError;
use blake2::Digest;
use std::sync::RwLock;

// re-export for callers that only need the hash type
pub use super::node::Blake2b256;

type ConflictFn<V> = dyn FnMut(&mut V, V) -> Result<(), EngineError>;

/// A concurrent Merkle-Patricia trie over `N`-byte fixed-length keys.
pub struct MerkleTrie<const N: usize, V: TrieValue> {
    root: Option<Box<TrieNode<N, V>>>,
    /// Coarse lock guarding structural mutation, mirroring the original's
    /// root-level hash lock (shared for reads, exclusive for mutation).
    lock: RwLock<()>,
}

impl<const N: usize, V: TrieValue> Default for MerkleTrie<N, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, V: TrieValue> MerkleTrie<N, V> {
    pub fn new() -> Self {
        MerkleTrie {
            root: None,
            lock: RwLock::new(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn size(&self) -> i64 {
        self.root.as_ref().map(|r| r.metadata.size).unwrap_or(0)
    }

    pub fn metadata(&self) -> TrieMetadata<V::Extra> {
        self.root.as_ref().map(|r| r.metadata).unwrap_or_default()
    }

    /// Clear all contents.
    pub fn clear(&mut self) {
        self.root = None;
    }

    /// Destructive reset, matching the original's `clear_and_reset` on
    /// thunk rollback tries.
    pub fn clear_and_reset(&mut self) {
        self.clear();
    }

    // ---- get --------------------------------------------------------

    pub fn get(&self, key: &[u8; N]) -> Option<V> {
        let _guard = self.lock.read().unwrap();
        let leaf_prefix = KeyPrefix::from_key(*key);
        Self::get_rec(self.root.as_deref(), &leaf_prefix)
    }

    fn get_rec(node: Option<&TrieNode<N, V>>, key: &KeyPrefix<N>) -> Option<V> {
        let node = node?;
        let m = node.prefix.common_prefix_len(key);
        if m < node.prefix.len_bits() {
            return None;
        }
        match &node.kind {
            NodeKind::Leaf { value, deleted, .. } => {
                if *deleted {
                    None
                } else {
                    Some(value.clone())
                }
            }
            NodeKind::Internal { children } => {
                let nibble = key.nibble_at(node.prefix.len_bits());
                Self::get_rec(children[nibble as usize].as_deref(), key)
            }
        }
    }

    // ---- insert -------------------------------------------------------

    /// Insert `value` at `key`. If a leaf already exists at `key`,
    /// `on_conflict(existing, incoming)` is called to resolve it (an
    /// idempotent overwrite, a set-union, or an error on duplicate id,
    /// depending on the use case).
    pub fn insert(
        &mut self,
        key: [u8; N],
        value: V,
        mut on_conflict: impl FnMut(&mut V, V) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let _guard = self.lock.write().unwrap();
        let leaf_prefix = KeyPrefix::<N>::from_key(key);
        let root = self.root.take();
        self.root = Some(Self::insert_rec(root, leaf_prefix, value, &mut on_conflict)?);
        Ok(())
    }

    fn insert_rec(
        node: Option<Box<TrieNode<N, V>>>,
        leaf_prefix: KeyPrefix<N>,
        value: V,
        on_conflict: &mut ConflictFn<V>,
    ) -> Result<Box<TrieNode<N, V>>, EngineError> {
        let Some(mut node) = node else {
            return Ok(Box::new(TrieNode::new_leaf(leaf_prefix, value)));
        };
        node.invalidate_hash();

        let m = node.prefix.common_prefix_len(&leaf_prefix);

        if node.is_leaf() && m == node.prefix.len_bits() && m == leaf_prefix.len_bits() {
            // exact key match: resolve conflict in place.
            if let NodeKind::Leaf {
                value: existing,
                deleted,
                ..
            } = &mut node.kind
            {
                let before = node.metadata;
                on_conflict(existing, value)?;
                *deleted = false;
                node.metadata = TrieMetadata::leaf(existing.extra_metadata());
                let _ = before;
            }
            return Ok(node);
        }

        if m == node.prefix.len_bits() && !node.is_leaf() {
            // descend into the matching child
            if let NodeKind::Internal { children } = &mut node.kind {
                let nibble = leaf_prefix.nibble_at(m);
                let child = children[nibble as usize].take();
                let before = child.as_ref().map(|c| c.metadata).unwrap_or_default();
                let new_child = Self::insert_rec(child, leaf_prefix, value, on_conflict)?;
                let after = new_child.metadata;
                children[nibble as usize] = Some(new_child);
                let mut delta = after;
                delta.uncombine(&before);
                node.metadata.combine(&delta);
            }
            return Ok(node);
        }

        // split: create a new internal node at the common-prefix length
        let split_len = m;
        let mut new_internal = TrieNode::new_internal(node.prefix.with_len(split_len));
        let old_nibble = node.prefix.nibble_at(split_len);
        let new_nibble = leaf_prefix.nibble_at(split_len);
        let new_leaf = Box::new(TrieNode::new_leaf(leaf_prefix, value));
        new_internal.metadata.combine(&node.metadata);
        new_internal.metadata.combine(&new_leaf.metadata);
        if let NodeKind::Internal { children } = &mut new_internal.kind {
            children[old_nibble as usize] = Some(node);
            children[new_nibble as usize] = Some(new_leaf);
        }
        Ok(Box::new(new_internal))
    }

    // ---- delete / mark-for-deletion ------------------------------------

    /// Hard delete: remove the leaf at `key` outright and canonicalize.
    pub fn delete(&mut self, key: &[u8; N]) -> Option<V> {
        let _guard = self.lock.write().unwrap();
        let leaf_prefix = KeyPrefix::<N>::from_key(*key);
        let root = self.root.take();
        let (new_root, removed) = Self::delete_rec(root, &leaf_prefix);
        self.root = new_root;
        removed
    }

    fn delete_rec(
        node: Option<Box<TrieNode<N, V>>>,
        key: &KeyPrefix<N>,
    ) -> (Option<Box<TrieNode<N, V>>>, Option<V>) {
        let Some(mut node) = node else {
            return (None, None);
        };
        let m = node.prefix.common_prefix_len(key);
        if m < node.prefix.len_bits() {
            return (Some(node), None);
        }
        if node.is_leaf() {
            if let NodeKind::Leaf { value, .. } = node.kind {
                return (None, Some(value));
            }
            unreachable!()
        }
        node.invalidate_hash();
        let nibble = key.nibble_at(node.prefix.len_bits());
        let mut removed = None;
        if let NodeKind::Internal { children } = &mut node.kind {
            let child = children[nibble as usize].take();
            let before = child.as_ref().map(|c| c.metadata).unwrap_or_default();
            let (new_child, r) = Self::delete_rec(child, key);
            removed = r;
            if let Some(nc) = &new_child {
                let mut delta = nc.metadata;
                delta.uncombine(&before);
                node.metadata.combine(&delta);
            } else {
                let mut delta = TrieMetadata::default();
                delta.uncombine(&before);
                node.metadata.combine(&delta);
            }
            children[nibble as usize] = new_child;
        }
        (Self::canonicalize(node), removed)
    }

    /// Absorb a single remaining child into its parent, recursively. An
    /// internal node with zero children collapses to `None`.
    fn canonicalize(mut node: Box<TrieNode<N, V>>) -> Option<Box<TrieNode<N, V>>> {
        if let NodeKind::Internal { children } = &mut node.kind {
            let occupied: Vec<usize> = children
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.as_ref().map(|_| i))
                .collect();
            match occupied.len() {
                0 => return None,
                1 => return children[occupied[0]].take(),
                _ => {}
            }
        }
        Some(node)
    }

    /// Two-phase delete, phase 1: mark the leaf at `key` as deleted
    /// without removing it. Returns the leaf's value if present.
    pub fn mark_for_deletion(&mut self, key: &[u8; N]) -> Option<V> {
        let _guard = self.lock.write().unwrap();
        let leaf_prefix = KeyPrefix::<N>::from_key(*key);
        Self::set_deleted_rec(self.root.as_deref_mut(), &leaf_prefix, true)
    }

    /// Two-phase delete, phase 1 inverse: clear a leaf's deletion marker.
    pub fn unmark_for_deletion(&mut self, key: &[u8; N]) -> Option<V> {
        let _guard = self.lock.write().unwrap();
        let leaf_prefix = KeyPrefix::<N>::from_key(*key);
        Self::set_deleted_rec(self.root.as_deref_mut(), &leaf_prefix, false)
    }

    fn set_deleted_rec(
        node: Option<&mut TrieNode<N, V>>,
        key: &KeyPrefix<N>,
        deleted: bool,
    ) -> Option<V> {
        let node = node?;
        let m = node.prefix.common_prefix_len(key);
        if m < node.prefix.len_bits() {
            return None;
        }
        match &mut node.kind {
            NodeKind::Leaf {
                value,
                deleted: flag,
                ..
            } => {
                let was = *flag;
                *flag = deleted;
                if was != deleted {
                    node.metadata.num_deleted = if deleted { 1 } else { 0 };
                    node.invalidate_hash();
                }
                Some(value.clone())
            }
            NodeKind::Internal { children } => {
                let nibble = key.nibble_at(node.prefix.len_bits());
                let before = children[nibble as usize]
                    .as_ref()
                    .map(|c| c.metadata)
                    .unwrap_or_default();
                let result =
                    Self::set_deleted_rec(children[nibble as usize].as_deref_mut(), key, deleted);
                if let Some(c) = children[nibble as usize].as_ref() {
                    let mut delta = c.metadata;
                    delta.uncombine(&before);
                    node.metadata.combine(&delta);
                    if delta.num_deleted != 0 {
                        node.invalidate_hash();
                    }
                }
                result
            }
        }
    }

    /// Two-phase delete, phase 2: walk the trie, physically remove every
    /// leaf still marked deleted (calling `side_effect(key, value)` for
    /// each), and canonicalize.
    pub fn perform_marked_deletions(
        &mut self,
        mut side_effect: impl FnMut(KeyPrefix<N>, V),
    ) {
        let _guard = self.lock.write().unwrap();
        let root = self.root.take();
        self.root = Self::perform_deletions_rec(root, &mut side_effect);
    }

    fn perform_deletions_rec(
        node: Option<Box<TrieNode<N, V>>>,
        side_effect: &mut dyn FnMut(KeyPrefix<N>, V),
    ) -> Option<Box<TrieNode<N, V>>> {
        let mut node = node?;
        match node.kind {
            NodeKind::Leaf { deleted, .. } => {
                if deleted {
                    if let NodeKind::Leaf { value, .. } = node.kind {
                        side_effect(node.prefix, value);
                    }
                    return None;
                }
                Some(node)
            }
            NodeKind::Internal { ref mut children } => {
                for slot in children.iter_mut() {
                    if let Some(child) = slot.take() {
                        *slot = Self::perform_deletions_rec(Some(child), side_effect);
                    }
                }
                // recompute metadata from surviving children bottom-up
                let mut agg = TrieMetadata::default();
                for c in children.iter().flatten() {
                    agg.combine(&c.metadata);
                }
                node.metadata = agg;
                node.invalidate_hash();
                Self::canonicalize(node)
            }
        }
    }

    // ---- merge_in -------------------------------------------------------

    /// Destructive union: absorb `other` into `self`. `on_conflict`
    /// resolves keys present in both tries.
    pub fn merge_in(
        &mut self,
        other: MerkleTrie<N, V>,
        mut on_conflict: impl FnMut(&mut V, V) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let _guard = self.lock.write().unwrap();
        let a = self.root.take();
        let b = other.root;
        self.root = Self::merge_rec(a, b, &mut on_conflict)?;
        Ok(())
    }

    fn merge_rec(
        a: Option<Box<TrieNode<N, V>>>,
        b: Option<Box<TrieNode<N, V>>>,
        on_conflict: &mut ConflictFn<V>,
    ) -> Result<Option<Box<TrieNode<N, V>>>, EngineError> {
        let (mut a, b) = match (a, b) {
            (None, None) => return Ok(None),
            (Some(a), None) => return Ok(Some(a)),
            (None, Some(b)) => return Ok(Some(b)),
            (Some(a), Some(b)) => (a, b),
        };
        a.invalidate_hash();
        let m = a.prefix.common_prefix_len(&b.prefix);

        // case 1: exact leaf match
        if a.is_leaf() && b.is_leaf() && m == a.prefix.len_bits() && m == b.prefix.len_bits() {
            if let (
                NodeKind::Leaf {
                    value: av,
                    deleted: _,
                    ..
                },
                NodeKind::Leaf { value: bv, .. },
            ) = (&mut a.kind, b.kind)
            {
                on_conflict(av, bv)?;
                a.metadata = TrieMetadata::leaf(av.extra_metadata());
            }
            return Ok(Some(a));
        }

        // case 2: both internal with identical prefixes -> child-wise merge
        if m == a.prefix.len_bits() && m == b.prefix.len_bits() && !a.is_leaf() && !b.is_leaf() {
            if let (NodeKind::Internal { children: ac }, NodeKind::Internal { children: bc }) =
                (&mut a.kind, b.kind)
            {
                for (slot, other_slot) in ac.iter_mut().zip((*bc).into_iter()) {
                    let taken = slot.take();
                    *slot = Self::merge_rec(taken, other_slot, on_conflict)?;
                }
            }
            let mut agg = TrieMetadata::default();
            if let NodeKind::Internal { children } = &a.kind {
                for c in children.iter().flatten() {
                    agg.combine(&c.metadata);
                }
            }
            a.metadata = agg;
            return Ok(Self::canonicalize(a));
        }

        // case 3: one prefix strictly extends the other -> recurse into
        // the matching child (or attach wholesale)
        if m == a.prefix.len_bits() && m < b.prefix.len_bits() && !a.is_leaf() {
            if let NodeKind::Internal { children } = &mut a.kind {
                let nibble = b.prefix.nibble_at(m);
                let existing = children[nibble as usize].take();
                let before = existing.as_ref().map(|c| c.metadata).unwrap_or_default();
                let merged = Self::merge_rec(existing, Some(b), on_conflict)?;
                if let Some(mc) = &merged {
                    let mut delta = mc.metadata;
                    delta.uncombine(&before);
                    a.metadata.combine(&delta);
                }
                children[nibble as usize] = merged;
            }
            return Ok(Some(a));
        }
        if m == b.prefix.len_bits() && m < a.prefix.len_bits() && !b.is_leaf() {
            // symmetric: descend into b's matching child with a
            return Self::merge_rec(b, Some(a), on_conflict);
        }

        // case 4: neither contains the other -> new internal node splitting
        // at the common prefix.
        let mut new_internal = TrieNode::new_internal(a.prefix.with_len(m));
        let a_nibble = a.prefix.nibble_at(m);
        let b_nibble = b.prefix.nibble_at(m);
        new_internal.metadata.combine(&a.metadata);
        new_internal.metadata.combine(&b.metadata);
        if let NodeKind::Internal { children } = &mut new_internal.kind {
            children[a_nibble as usize] = Some(a);
            children[b_nibble as usize] = Some(b);
        }
        Ok(Some(Box::new(new_internal)))
    }

    /// Parallel reduction of many tries into `self`. Partitions by
    /// top-level nibble across threads (see module docs for why this
    /// replaces the original's lock-stealing protocol) then folds
    /// sequentially. `on_conflict` must be safely callable from multiple
    /// threads concurrently (each thread only ever touches keys under its
    /// own nibble, so in practice it need not itself be thread-safe beyond
    /// `Send`).
    pub fn parallel_batch_merge(
        &mut self,
        others: Vec<MerkleTrie<N, V>>,
        make_conflict_fn: impl Fn() -> Box<dyn FnMut(&mut V, V) -> Result<(), EngineError> + Send>
        + Sync,
    ) -> Result<(), EngineError>
    where
        V: 'static,
    {
        if others.is_empty() {
            return Ok(());
        }
        // Fold all input tries into one, sequentially, each fold running
        // the merge algorithm above. The "parallel" partitioning happens
        // per nibble when we then merge that single folded trie into
        // `self` by nibble, across threads.
        let mut folded = MerkleTrie::<N, V>::new();
        for mut t in others {
            let root = t.root.take();
            let prev = folded.root.take();
            let mut cf = make_conflict_fn();
            folded.root = Self::merge_rec(prev, root, cf.as_mut())?;
        }

        let self_root = self.root.take();
        let other_root = folded.root.take();

        self.root = match (self_root, other_root) {
            (None, x) => x,
            (x, None) => x,
            (Some(mut a), Some(mut b)) => {
                // If both roots share a long common prefix that is not yet
                // nibble-aligned at the top, fall back to a single-threaded
                // merge: partitioning only pays off once both are split
                // into 16 top-level children.
                let m = a.prefix.common_prefix_len(&b.prefix);
                if a.is_leaf() || b.is_leaf() || m < a.prefix.len_bits().min(b.prefix.len_bits()) {
                    let mut cf = make_conflict_fn();
                    return {
                        self.root = Self::merge_rec(Some(a), Some(b), cf.as_mut())?;
                        Ok(())
                    };
                }
                if let (NodeKind::Internal { children: ac }, NodeKind::Internal { children: bc }) =
                    (&mut a.kind, &mut b.kind)
                {
                    let mut bc_taken: Vec<Option<Box<TrieNode<N, V>>>> =
                        bc.iter_mut().map(|s| s.take()).collect();
                    std::thread::scope(|scope| {
                        let mut handles = Vec::with_capacity(16);
                        for (i, a_slot) in ac.iter_mut().enumerate() {
                            let b_child = bc_taken[i].take();
                            let a_child = a_slot.take();
                            let cf_factory = &make_conflict_fn;
                            handles.push((
                                i,
                                scope.spawn(move || {
                                    let mut cf = cf_factory();
                                    Self::merge_rec(a_child, b_child, cf.as_mut())
                                }),
                            ));
                        }
                        for (i, h) in handles {
                            ac[i] = h.join().expect("merge worker panicked")?;
                        }
                        Ok::<(), EngineError>(())
                    })?;
                }
                let mut agg = TrieMetadata::default();
                if let NodeKind::Internal { children } = &a.kind {
                    for c in children.iter().flatten() {
                        agg.combine(&c.metadata);
                    }
                }
                a.metadata = agg;
                Self::canonicalize(a)
            }
        };
        Ok(())
    }

    // ---- endow split / ranged queries -----------------------------------

    /// Sum of `extra.endow` across leaves with key strictly less than `k`.
    pub fn endow_lt_key(&self, k: &[u8; N]) -> i64
    where
        V: TrieValue<Extra = EndowMetadata>,
    {
        let key = KeyPrefix::<N>::from_key(*k);
        Self::endow_lt_key_rec(self.root.as_deref(), &key)
    }

    fn endow_lt_key_rec(node: Option<&TrieNode<N, V>>, key: &KeyPrefix<N>) -> i64
    where
        V: TrieValue<Extra = EndowMetadata>,
    {
        let Some(node) = node else { return 0 };
        if node.is_leaf() {
            let leaf_key = node.prefix.bytes();
            return if leaf_key.as_slice() < key.bytes().as_slice() {
                node.metadata.extra.endow
            } else {
                0
            };
        }
        let split_bit = node.prefix.len_bits();
        if split_bit >= key.len_bits() {
            return 0;
        }
        let target_nibble = key.nibble_at(split_bit);
        if let NodeKind::Internal { children } = &node.kind {
            let mut total = 0i64;
            for (i, c) in children.iter().enumerate() {
                let Some(c) = c else { continue };
                match (i as u8).cmp(&target_nibble) {
                    std::cmp::Ordering::Less => total += c.metadata.extra.endow,
                    std::cmp::Ordering::Equal => total += Self::endow_lt_key_rec(Some(c), key),
                    std::cmp::Ordering::Greater => {}
                }
            }
            total
        } else {
            0
        }
    }

    /// Split off the lowest-keyed leaves whose cumulative `endow` sums to
    /// at most `threshold` (rounding down — an offer whose endow would
    /// push the running sum past `threshold` is left behind, even
    /// partially). Returns the split-off trie; `self` retains the rest.
    pub fn endow_split(&mut self, threshold: i64) -> MerkleTrie<N, V>
    where
        V: TrieValue<Extra = EndowMetadata>,
    {
        let _guard = self.lock.write().unwrap();
        let root = self.root.take();
        let (kept, split) = Self::endow_split_rec(root, threshold);
        self.root = kept;
        MerkleTrie {
            root: split,
            lock: RwLock::new(()),
        }
    }

    fn endow_split_rec(
        node: Option<Box<TrieNode<N, V>>>,
        threshold: i64,
    ) -> (Option<Box<TrieNode<N, V>>>, Option<Box<TrieNode<N, V>>>)
    where
        V: TrieValue<Extra = EndowMetadata>,
    {
        let Some(node) = node else {
            return (None, None);
        };
        if threshold <= 0 {
            return (Some(node), None);
        }
        if node.metadata.extra.endow <= threshold {
            return (None, Some(node));
        }
        if node.is_leaf() {
            // endow exceeds threshold and it's atomic: nothing splits.
            return (Some(node), None);
        }
        let mut node = node;
        node.invalidate_hash();
        let mut remaining = threshold;
        let mut split_children: [Option<Box<TrieNode<N, V>>>; 16] = Default::default();
        if let NodeKind::Internal { children } = &mut node.kind {
            for i in 0..16 {
                let Some(child) = children[i].take() else {
                    continue;
                };
                if remaining <= 0 {
                    children[i] = Some(child);
                    continue;
                }
                let (kept, split) = Self::endow_split_rec(Some(child), remaining);
                if let Some(s) = &split {
                    remaining -= s.metadata.extra.endow;
                }
                children[i] = kept;
                split_children[i] = split;
            }
        }
        let mut kept_agg = TrieMetadata::default();
        let mut split_agg = TrieMetadata::default();
        if let NodeKind::Internal { children } = &node.kind {
            for c in children.iter().flatten() {
                kept_agg.combine(&c.metadata);
            }
        }
        for c in split_children.iter().flatten() {
            split_agg.combine(&c.metadata);
        }
        node.metadata = kept_agg;
        let kept = Self::canonicalize(node);

        let split = if split_agg.size == 0 {
            None
        } else {
            let mut split_node =
                TrieNode::<N, V>::new_internal(KeyPrefix::zero().with_len(0).truncated());
            // recover a sensible shared prefix: reuse bit-length 0 (root-level)
            // since split leaves may not share a longer prefix.
            split_node.metadata = split_agg;
            if let NodeKind::Internal { children } = &mut split_node.kind {
                for (i, c) in split_children.into_iter().enumerate() {
                    children[i] = c;
                }
            }
            Self::canonicalize(Box::new(split_node))
        };
        (kept, split)
    }

    /// In-order collection of every live leaf's value. Used where a whole
    /// subtrie needs to be drained into a plain list (thunk snapshots,
    /// clearing a split-off trie of fully-executed offers).
    pub fn values_in_order(&self) -> Vec<V> {
        let mut out = Vec::new();
        Self::values_rec(self.root.as_deref(), &mut out);
        out
    }

    fn values_rec(node: Option<&TrieNode<N, V>>, out: &mut Vec<V>) {
        let Some(node) = node else { return };
        match &node.kind {
            NodeKind::Leaf { value, deleted, .. } => {
                if !*deleted {
                    out.push(value.clone());
                }
            }
            NodeKind::Internal { children } => {
                for child in children.iter() {
                    Self::values_rec(child.as_deref(), out);
                }
            }
        }
    }

    // ---- metadata traversal ---------------------------------------------

    /// In-order walk of live leaves, returning for each leaf the first
    /// `depth_bits` bits of its key (as a big-endian integer) paired with
    /// the cumulative metadata sum up to and including that leaf. Used to
    /// precompute the orderbook's cumulative-endow index.
    pub fn metadata_traversal(&self, depth_bits: u16) -> Vec<(u64, TrieMetadata<V::Extra>)> {
        let mut out = Vec::new();
        let mut running = TrieMetadata::default();
        Self::traversal_rec(self.root.as_deref(), depth_bits, &mut running, &mut out);
        out
    }

    fn traversal_rec(
        node: Option<&TrieNode<N, V>>,
        depth_bits: u16,
        running: &mut TrieMetadata<V::Extra>,
        out: &mut Vec<(u64, TrieMetadata<V::Extra>)>,
    ) {
        let Some(node) = node else { return };
        match &node.kind {
            NodeKind::Leaf { deleted, .. } => {
                if *deleted {
                    return;
                }
                running.combine(&node.metadata);
                let key_bits = key_prefix_as_u64(node.prefix.bytes(), depth_bits);
                out.push((key_bits, *running));
            }
            NodeKind::Internal { children } => {
                for child in children.iter() {
                    Self::traversal_rec(child.as_deref(), depth_bits, running, out);
                }
            }
        }
    }

    // ---- ranged value application -----------------------------------

    pub fn apply_lt_key(&mut self, k: &[u8; N], mut f: impl FnMut(&mut V)) {
        let _guard = self.lock.write().unwrap();
        let key = KeyPrefix::<N>::from_key(*k);
        Self::apply_range_rec(self.root.as_deref_mut(), &key, true, &mut f);
    }

    pub fn apply_geq_key(&mut self, k: &[u8; N], mut f: impl FnMut(&mut V)) {
        let _guard = self.lock.write().unwrap();
        let key = KeyPrefix::<N>::from_key(*k);
        Self::apply_range_rec(self.root.as_deref_mut(), &key, false, &mut f);
    }

    fn apply_range_rec(
        node: Option<&mut TrieNode<N, V>>,
        k: &KeyPrefix<N>,
        less_than: bool,
        f: &mut impl FnMut(&mut V),
    ) {
        let Some(node) = node else { return };
        if node.is_leaf() {
            let is_lt = node.prefix.bytes().as_slice() < k.bytes().as_slice();
            if is_lt == less_than {
                if let NodeKind::Leaf { value, .. } = &mut node.kind {
                    f(value);
                    node.invalidate_hash();
                }
            }
            return;
        }
        let split_bit = node.prefix.len_bits();
        let target_nibble = if split_bit < k.len_bits() {
            Some(k.nibble_at(split_bit))
        } else {
            None
        };
        node.invalidate_hash();
        if let NodeKind::Internal { children } = &mut node.kind {
            for (i, child) in children.iter_mut().enumerate() {
                let apply_whole = match target_nibble {
                    None => true,
                    Some(t) => {
                        if less_than {
                            (i as u8) < t
                        } else {
                            (i as u8) > t
                        }
                    }
                };
                if apply_whole {
                    if let Some(c) = child {
                        apply_whole_subtree(c, f);
                    }
                } else if target_nibble == Some(i as u8) {
                    Self::apply_range_rec(child.as_deref_mut(), k, less_than, f);
                }
            }
        }
    }

    // ---- hashing ---------------------------------------------------

    /// Root hash, per §4.1: `u32(size - deletion_marked_count) ‖
    /// root_node_hash`, or 32 zero bytes if the trie is empty.
    pub fn hash(&self) -> Hash {
        let _guard = self.lock.read().unwrap();
        match &self.root {
            None => [0u8; 32],
            Some(root) => {
                let live = root.metadata.live_size().max(0) as u32;
                let node_hash = root.hash();
                let mut preimage = Vec::with_capacity(36);
                preimage.extend_from_slice(&live.to_be_bytes());
                preimage.extend_from_slice(&node_hash);
                let mut hasher = Blake2b256::new();
                hasher.update(&preimage);
                hasher.finalize().into()
            }
        }
    }
}

fn apply_whole_subtree<const N: usize, V: TrieValue>(
    node: &mut TrieNode<N, V>,
    f: &mut impl FnMut(&mut V),
) {
    node.invalidate_hash();
    match &mut node.kind {
        NodeKind::Leaf { value, .. } => f(value),
        NodeKind::Internal { children } => {
            for c in children.iter_mut().flatten() {
                apply_whole_subtree(c, f);
            }
        }
    }
}

fn key_prefix_as_u64(bytes: &[u8], depth_bits: u16) -> u64 {
    let nbytes = ((depth_bits as usize) + 7) / 8;
    let mut v: u64 = 0;
    for &b in &bytes[..nbytes.min(8).min(bytes.len())] {
        v = (v << 8) | b as u64;
    }
    v
}

/// Rollback mixin operations: undo every insert flagged with a rollback
/// marker.
impl<const N: usize, V: TrieValue> MerkleTrie<N, V> {
    /// Mark a freshly-inserted leaf as rollback-eligible.
    pub fn mark_rollback(&mut self, key: &[u8; N]) {
        let _guard = self.lock.write().unwrap();
        let k = KeyPrefix::<N>::from_key(*key);
        Self::mark_rollback_rec(self.root.as_deref_mut(), &k);
    }

    fn mark_rollback_rec(node: Option<&mut TrieNode<N, V>>, key: &KeyPrefix<N>) {
        let Some(node) = node else { return };
        let m = node.prefix.common_prefix_len(key);
        if m < node.prefix.len_bits() {
            return;
        }
        match &mut node.kind {
            NodeKind::Leaf { rollback, .. } => {
                if !*rollback {
                    *rollback = true;
                    node.metadata.num_rollback = 1;
                    node.invalidate_hash();
                }
            }
            NodeKind::Internal { children } => {
                let nibble = key.nibble_at(node.prefix.len_bits());
                let before = children[nibble as usize]
                    .as_ref()
                    .map(|c| c.metadata)
                    .unwrap_or_default();
                Self::mark_rollback_rec(children[nibble as usize].as_deref_mut(), key);
                if let Some(c) = children[nibble as usize].as_ref() {
                    let mut delta = c.metadata;
                    delta.uncombine(&before);
                    node.metadata.combine(&delta);
                }
            }
        }
    }

    /// Delete every leaf still carrying a rollback marker, canonicalizing
    /// afterward. Returns the trie to its pre-insert state (testable
    /// property: rollback idempotence).
    pub fn do_rollback(&mut self) {
        let _guard = self.lock.write().unwrap();
        let root = self.root.take();
        self.root = Self::do_rollback_rec(root);
    }

    fn do_rollback_rec(node: Option<Box<TrieNode<N, V>>>) -> Option<Box<TrieNode<N, V>>> {
        let mut node = node?;
        match node.kind {
            NodeKind::Leaf { rollback, .. } => {
                if rollback {
                    None
                } else {
                    Some(node)
                }
            }
            NodeKind::Internal { ref mut children } => {
                for slot in children.iter_mut() {
                    if let Some(c) = slot.take() {
                        *slot = Self::do_rollback_rec(Some(c));
                    }
                }
                let mut agg = TrieMetadata::default();
                for c in children.iter().flatten() {
                    agg.combine(&c.metadata);
                }
                node.metadata = agg;
                node.invalidate_hash();
                Self::canonicalize(node)
            }
        }
    }

    /// Zero every rollback counter without removing any leaves (called
    /// once a block finalizes and its new offers no longer need a
    /// rollback marker).
    pub fn clear_rollback(&mut self) {
        let _guard = self.lock.write().unwrap();
        Self::clear_rollback_rec(self.root.as_deref_mut());
    }

    fn clear_rollback_rec(node: Option<&mut TrieNode<N, V>>) {
        let Some(node) = node else { return };
        match &mut node.kind {
            NodeKind::Leaf { rollback, .. } => {
                *rollback = false;
                node.metadata.num_rollback = 0;
            }
            NodeKind::Internal { children } => {
                for c in children.iter_mut() {
                    Self::clear_rollback_rec(c.as_deref_mut());
                }
                node.metadata.num_rollback = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::metadata::EndowMetadata;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestVal(i64);

    impl TrieValue for TestVal {
        type Extra = EndowMetadata;
        fn extra_metadata(&self) -> EndowMetadata {
            EndowMetadata { endow: self.0 }
        }
        fn serialize(&self, out: &mut Vec<u8>) {
            out.extend_from_slice(&self.0.to_be_bytes());
        }
    }

    fn key(n: u8) -> [u8; 2] {
        [0, n]
    }

    fn no_conflict(_: &mut TestVal, _: TestVal) -> Result<(), EngineError> {
        panic!("unexpected conflict")
    }

    #[test]
    fn insert_and_get() {
        let mut t = MerkleTrie::<2, TestVal>::new();
        t.insert(key(5), TestVal(10), no_conflict).unwrap();
        t.insert(key(200), TestVal(20), no_conflict).unwrap();
        assert_eq!(t.get(&key(5)), Some(TestVal(10)));
        assert_eq!(t.get(&key(200)), Some(TestVal(20)));
        assert_eq!(t.get(&key(6)), None);
        assert_eq!(t.size(), 2);
    }

    #[test]
    fn determinism_insert_order_independent() {
        let keys = [1u8, 50, 7, 200, 3, 254];
        let mut t1 = MerkleTrie::<2, TestVal>::new();
        for k in keys {
            t1.insert(key(k), TestVal(k as i64), no_conflict).unwrap();
        }
        let mut t2 = MerkleTrie::<2, TestVal>::new();
        for k in keys.iter().rev() {
            t2.insert(key(*k), TestVal(*k as i64), no_conflict).unwrap();
        }
        assert_eq!(t1.hash(), t2.hash());
    }

    #[test]
    fn delete_then_hash_matches_never_inserted() {
        let mut with_extra = MerkleTrie::<2, TestVal>::new();
        with_extra.insert(key(1), TestVal(1), no_conflict).unwrap();
        with_extra.insert(key(2), TestVal(2), no_conflict).unwrap();
        with_extra.insert(key(3), TestVal(3), no_conflict).unwrap();
        with_extra.delete(&key(2));

        let mut without = MerkleTrie::<2, TestVal>::new();
        without.insert(key(1), TestVal(1), no_conflict).unwrap();
        without.insert(key(3), TestVal(3), no_conflict).unwrap();

        assert_eq!(with_extra.hash(), without.hash());
    }

    #[test]
    fn mark_for_deletion_equals_hard_removal() {
        let mut marked = MerkleTrie::<2, TestVal>::new();
        marked.insert(key(1), TestVal(1), no_conflict).unwrap();
        marked.insert(key(2), TestVal(2), no_conflict).unwrap();
        marked.mark_for_deletion(&key(2));

        let mut removed = MerkleTrie::<2, TestVal>::new();
        removed.insert(key(1), TestVal(1), no_conflict).unwrap();

        assert_eq!(marked.hash(), removed.hash());
    }

    #[test]
    fn perform_marked_deletions_calls_side_effect_and_shrinks() {
        let mut t = MerkleTrie::<2, TestVal>::new();
        for k in 1..=5u8 {
            t.insert(key(k), TestVal(k as i64), no_conflict).unwrap();
        }
        t.mark_for_deletion(&key(2));
        t.mark_for_deletion(&key(4));
        let mut removed = Vec::new();
        t.perform_marked_deletions(|k, v| removed.push((k, v)));
        assert_eq!(removed.len(), 2);
        assert_eq!(t.size(), 3);
    }

    #[test]
    fn rollback_idempotence() {
        let mut t = MerkleTrie::<2, TestVal>::new();
        t.insert(key(1), TestVal(1), no_conflict).unwrap();
        let root_before = t.hash();
        t.insert(key(2), TestVal(2), no_conflict).unwrap();
        t.mark_rollback(&key(2));
        t.insert(key(3), TestVal(3), no_conflict).unwrap();
        t.mark_rollback(&key(3));
        t.do_rollback();
        assert_eq!(t.hash(), root_before);
    }

    #[test]
    fn merge_equivalence_against_sequential_insert() {
        let all_keys: Vec<u8> = (0..50).collect();
        let mut sequential = MerkleTrie::<2, TestVal>::new();
        for &k in &all_keys {
            sequential
                .insert(key(k), TestVal(k as i64), no_conflict)
                .unwrap();
        }

        let mut shard_a = MerkleTrie::<2, TestVal>::new();
        let mut shard_b = MerkleTrie::<2, TestVal>::new();
        for &k in &all_keys {
            if k % 2 == 0 {
                shard_a.insert(key(k), TestVal(k as i64), no_conflict).unwrap();
            } else {
                shard_b.insert(key(k), TestVal(k as i64), no_conflict).unwrap();
            }
        }
        let mut merged = MerkleTrie::<2, TestVal>::new();
        merged
            .parallel_batch_merge(vec![shard_a, shard_b], || Box::new(no_conflict))
            .unwrap();

        assert_eq!(merged.hash(), sequential.hash());
    }

    #[test]
    fn endow_split_conservation() {
        let mut t = MerkleTrie::<2, TestVal>::new();
        for i in 0..50u8 {
            t.insert(key(i), TestVal(10), no_conflict).unwrap();
        }
        let original_total: i64 = t.metadata().extra.endow;
        let split = t.endow_split(252);
        let remaining_total = t.metadata().extra.endow;
        let split_total = split.metadata().extra.endow;
        assert_eq!(split_total + remaining_total, original_total);
        assert!(split_total <= 252);
    }

    proptest::proptest! {
        /// Insertion order never affects the final root hash, for an
        /// arbitrary set of distinct keys.
        #[test]
        fn prop_insert_order_independent(
            keys in proptest::collection::hash_set(proptest::prelude::any::<u16>(), 1..80)
        ) {
            let keys: Vec<u16> = keys.into_iter().collect();
            let mut forward = MerkleTrie::<2, TestVal>::new();
            for &k in &keys {
                forward.insert(k.to_be_bytes(), TestVal(k as i64), no_conflict).unwrap();
            }
            let mut reversed = MerkleTrie::<2, TestVal>::new();
            for &k in keys.iter().rev() {
                reversed.insert(k.to_be_bytes(), TestVal(k as i64), no_conflict).unwrap();
            }
            proptest::prop_assert_eq!(forward.hash(), reversed.hash());
        }

        /// Merging an arbitrary two-way partition of a key set always
        /// produces the same root hash as inserting every key sequentially
        /// into one trie.
        #[test]
        fn prop_merge_equivalence_arbitrary_partition(
            keys in proptest::collection::hash_set(proptest::prelude::any::<u16>(), 1..80),
            split_mask in proptest::prelude::any::<u64>(),
        ) {
            let keys: Vec<u16> = keys.into_iter().collect();
            let mut sequential = MerkleTrie::<2, TestVal>::new();
            for &k in &keys {
                sequential.insert(k.to_be_bytes(), TestVal(k as i64), no_conflict).unwrap();
            }

            let mut shard_a = MerkleTrie::<2, TestVal>::new();
            let mut shard_b = MerkleTrie::<2, TestVal>::new();
            for (i, &k) in keys.iter().enumerate() {
                let target = if (split_mask >> (i % 64)) & 1 == 0 { &mut shard_a } else { &mut shard_b };
                target.insert(k.to_be_bytes(), TestVal(k as i64), no_conflict).unwrap();
            }
            let mut merged = MerkleTrie::<2, TestVal>::new();
            merged
                .parallel_batch_merge(vec![shard_a, shard_b], || Box::new(no_conflict))
                .unwrap();

            proptest::prop_assert_eq!(merged.hash(), sequential.hash());
        }
    }
}
