//! The account modification log (§10.6 supplement, grounded on
//! `modlog/account_modification_entry.h`): one entry per account touched
//! during a block, merged thread-locally and folded into a
//! block-scoped trie keyed by account id.
//!
//! Full transaction contents (signatures, operation bodies) are out of
//! scope for this crate — accounts and transfers beyond what's needed to
//! report clearing activity aren't modeled here. `new_transactions_self`
//! therefore tracks submitted sequence numbers rather than whole signed
//! transactions; everything else (self/other identifier sets, merge
//! semantics, canonical serialization shape) follows the original.

use std::collections::BTreeSet;

use crate::error::{EngineError, EngineResult};
use crate::trie::{EndowMetadata, HasEndow, TrieValue, ACCOUNT_KEY_BYTES, MerkleTrie};

/// Cross-reference to another account's transaction that touched this
/// account (e.g. as the counterparty of a transfer), ordered by
/// `(owner, sequence_number)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TxIdentifier {
    pub owner: u64,
    pub sequence_number: u64,
}

/// One account's activity within a single block: transactions it
/// submitted, plus back-references to transactions elsewhere that
/// mentioned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountModificationEntry {
    pub owner: u64,
    identifiers_self: BTreeSet<u64>,
    identifiers_other: BTreeSet<TxIdentifier>,
    new_transactions_self: BTreeSet<u64>,
}

impl AccountModificationEntry {
    pub fn new(owner: u64) -> Self {
        AccountModificationEntry {
            owner,
            identifiers_self: BTreeSet::new(),
            identifiers_other: BTreeSet::new(),
            new_transactions_self: BTreeSet::new(),
        }
    }

    pub fn add_identifier_self(&mut self, sequence_number: u64) {
        self.identifiers_self.insert(sequence_number);
    }

    pub fn add_identifier_other(&mut self, id: TxIdentifier) {
        self.identifiers_other.insert(id);
    }

    /// Record a transaction this account itself submitted this block.
    /// Errors if the sequence number was already recorded — two
    /// transactions from the same account sharing a sequence number in
    /// one block's log is a protocol violation.
    pub fn add_tx_self(&mut self, sequence_number: u64) -> EngineResult<()> {
        if !self.new_transactions_self.insert(sequence_number) {
            return Err(EngineError::MetadataIntegrity {
                message: format!(
                    "account {} logged sequence number {sequence_number} twice",
                    self.owner
                ),
            });
        }
        Ok(())
    }

    /// Merge another thread-local entry for the same account into this
    /// one. Errors on owner mismatch or a self-transaction sequence
    /// collision (the same tx reaching the log from two sub-logs).
    pub fn merge(&mut self, other: AccountModificationEntry) -> EngineResult<()> {
        if self.owner != other.owner {
            return Err(EngineError::MetadataIntegrity {
                message: format!(
                    "modlog merge owner mismatch: {} vs {}",
                    self.owner, other.owner
                ),
            });
        }
        self.identifiers_self.extend(other.identifiers_self);
        self.identifiers_other.extend(other.identifiers_other);
        for seq in other.new_transactions_self {
            self.add_tx_self(seq)?;
        }
        Ok(())
    }
}

impl HasEndow for AccountModificationEntry {
    fn endow(&self) -> i64 {
        0
    }
}

impl TrieValue for AccountModificationEntry {
    type Extra = EndowMetadata;

    fn extra_metadata(&self) -> EndowMetadata {
        EndowMetadata { endow: 0 }
    }

    /// Canonical shape: `owner(8) ‖ count‖seqs(self txs) ‖
    /// count‖seqs(other identifiers) ‖ count‖(owner‖seq)(other
    /// identifiers)`, all big-endian, matching the original's XDR field
    /// order.
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.owner.to_be_bytes());

        out.extend_from_slice(&(self.new_transactions_self.len() as u32).to_be_bytes());
        for seq in &self.new_transactions_self {
            out.extend_from_slice(&seq.to_be_bytes());
        }

        out.extend_from_slice(&(self.identifiers_self.len() as u32).to_be_bytes());
        for id in &self.identifiers_self {
            out.extend_from_slice(&id.to_be_bytes());
        }

        out.extend_from_slice(&(self.identifiers_other.len() as u32).to_be_bytes());
        for id in &self.identifiers_other {
            out.extend_from_slice(&id.owner.to_be_bytes());
            out.extend_from_slice(&id.sequence_number.to_be_bytes());
        }
    }
}

/// A block-scoped account modification log: one
/// [`AccountModificationEntry`] per touched account, keyed by account id
/// (big-endian `u64`) the same width as [`ACCOUNT_KEY_BYTES`].
pub type ModificationLog = MerkleTrie<ACCOUNT_KEY_BYTES, AccountModificationEntry>;

pub fn account_key(owner: u64) -> [u8; ACCOUNT_KEY_BYTES] {
    owner.to_be_bytes()
}

/// Fold a thread-local sub-log into the master log, merging entries for
/// accounts both logs already touched. Mirrors the original's
/// "thread-local sub-logs merged into the master log at round end;
/// concurrent inserts to the master forbidden" contract — call this only
/// from the single thread owning `master` at merge time.
pub fn merge_sublog(master: &mut ModificationLog, sublog: ModificationLog) -> EngineResult<()> {
    master.merge_in(sublog, |existing, incoming| existing.merge(incoming))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_combines_identifier_sets() {
        let mut a = AccountModificationEntry::new(7);
        a.add_identifier_self(1);
        a.add_tx_self(100).unwrap();

        let mut b = AccountModificationEntry::new(7);
        b.add_identifier_self(2);
        b.add_identifier_other(TxIdentifier {
            owner: 9,
            sequence_number: 3,
        });

        a.merge(b).unwrap();
        assert_eq!(a.identifiers_self.len(), 2);
        assert_eq!(a.identifiers_other.len(), 1);
        assert_eq!(a.new_transactions_self.len(), 1);
    }

    #[test]
    fn merge_rejects_owner_mismatch() {
        let mut a = AccountModificationEntry::new(1);
        let b = AccountModificationEntry::new(2);
        assert!(a.merge(b).is_err());
    }

    #[test]
    fn duplicate_self_sequence_number_errors() {
        let mut a = AccountModificationEntry::new(1);
        a.add_tx_self(5).unwrap();
        assert!(a.add_tx_self(5).is_err());
    }

    #[test]
    fn serialize_roundtrips_through_length_prefixes() {
        let mut entry = AccountModificationEntry::new(42);
        entry.add_tx_self(1).unwrap();
        entry.add_identifier_self(2);
        entry.add_identifier_other(TxIdentifier {
            owner: 5,
            sequence_number: 6,
        });
        let mut buf = Vec::new();
        entry.serialize(&mut buf);
        assert_eq!(buf.len(), 8 + 4 + 8 + 4 + 8 + 4 + 16);
    }
}
