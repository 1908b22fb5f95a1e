//! The cumulative-endow index: a sorted supply curve built once per block
//! from a linear trie traversal (`metadata_traversal`), then
//! binary-searched during tâtonnement instead of re-walking the trie on
//! every round. See `SPEC_FULL.md` §9 ("materialized cumulative-endow
//! index, no coroutine-style lazy iteration").

use crate::price::{Price, PRICE_BIT_LEN};

#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    /// The first `PRICE_BIT_LEN` bits of the key, i.e. the offer's minimum
    /// price, as a plain integer.
    pub price_prefix: u64,
    /// Cumulative `endow` (amount) of all live offers with key ≤ this entry.
    pub cumulative_endow: i64,
    /// `cumulative_endow * price_prefix`, precomputed to avoid recomputing
    /// a wide multiply on every query.
    pub cumulative_endow_times_price: i128,
}

#[derive(Debug, Clone, Default)]
pub struct CumulativeEndowIndex {
    entries: Vec<IndexEntry>,
}

impl CumulativeEndowIndex {
    pub fn build(traversal: Vec<(u64, crate::trie::TrieMetadata<crate::trie::EndowMetadata>)>) -> Self {
        let mut entries = Vec::with_capacity(traversal.len());
        for (price_prefix, metadata) in traversal {
            debug_assert!(
                price_prefix < (1u64 << PRICE_BIT_LEN),
                "index price_prefix {price_prefix} does not fit in {PRICE_BIT_LEN} bits"
            );
            let cumulative_endow = metadata.extra.endow;
            entries.push(IndexEntry {
                price_prefix,
                cumulative_endow,
                cumulative_endow_times_price: cumulative_endow as i128 * price_prefix as i128,
            });
        }
        CumulativeEndowIndex { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary search for the entry with the largest `price_prefix <= p`.
    /// Returns `(cumulative_endow, cumulative_endow * price)` — zero if `p`
    /// is below every offer's minimum price.
    pub fn get_metadata(&self, p: Price) -> (i64, i128) {
        let target = p.0;
        match self
            .entries
            .binary_search_by(|e| e.price_prefix.cmp(&target))
        {
            Ok(idx) => (
                self.entries[idx].cumulative_endow,
                self.entries[idx].cumulative_endow_times_price,
            ),
            Err(0) => (0, 0),
            Err(idx) => (
                self.entries[idx - 1].cumulative_endow,
                self.entries[idx - 1].cumulative_endow_times_price,
            ),
        }
    }

    /// First entry whose `cumulative_endow` strictly exceeds `amount`, if
    /// any. Used by `max_feasible_smooth_mult` to find the breakpoint at
    /// which the requested amount would spill into the next price level.
    pub fn first_entry_exceeding(&self, amount: i64) -> Option<&IndexEntry> {
        let idx = self.entries.partition_point(|e| e.cumulative_endow <= amount);
        self.entries.get(idx)
    }

    pub fn total_endow(&self) -> i64 {
        self.entries.last().map(|e| e.cumulative_endow).unwrap_or(0)
    }

    /// Entries with `price_prefix` in `(lower, upper]`, paired with the
    /// incremental amount newly added at that price breakpoint (i.e. the
    /// amount of offers tied at exactly that minimum price), used by the
    /// smooth-mult partial-activation band.
    pub fn entries_in_band(&self, lower: u64, upper: u64) -> Vec<(u64, i64)> {
        let mut out = Vec::new();
        let mut prev_cumulative = 0i64;
        for e in &self.entries {
            let incremental = e.cumulative_endow - prev_cumulative;
            prev_cumulative = e.cumulative_endow;
            if e.price_prefix > lower && e.price_prefix <= upper {
                out.push((e.price_prefix, incremental));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::{EndowMetadata, TrieMetadata};

    fn meta(endow: i64) -> TrieMetadata<EndowMetadata> {
        TrieMetadata {
            size: 1,
            num_deleted: 0,
            num_rollback: 0,
            extra: EndowMetadata { endow },
        }
    }

    #[test]
    fn get_metadata_finds_largest_leq() {
        let idx = CumulativeEndowIndex::build(vec![(10, meta(5)), (20, meta(15)), (30, meta(30))]);
        assert_eq!(idx.get_metadata(Price(25)), (15, 15 * 20));
        assert_eq!(idx.get_metadata(Price(30)), (30, 30 * 30));
        assert_eq!(idx.get_metadata(Price(5)), (0, 0));
    }

    #[test]
    fn first_entry_exceeding_skips_equal() {
        let idx = CumulativeEndowIndex::build(vec![(10, meta(5)), (20, meta(15))]);
        assert_eq!(idx.first_entry_exceeding(5).unwrap().price_prefix, 20);
        assert!(idx.first_entry_exceeding(15).is_none());
    }
}
