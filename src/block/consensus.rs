//! The trait boundary a consensus collaborator (e.g. a HotStuff
//! integration) drives against — out of scope per `SPEC_FULL.md` §1, but
//! the seam itself is part of this crate (§9's "dynamic dispatch" note).

use super::header::Block;

/// Runtime-polymorphic seam between this engine and whatever delivers and
/// accepts ordered blocks. This crate defines the trait and a no-op test
/// double; an actual consensus integration is someone else's concern.
pub trait ConsensusCollaborator: Send + Sync {
    /// Propose the next block for consensus to order.
    fn propose(&self, block: &Block);

    /// Parse consensus-delivered bytes into a candidate block, if they
    /// decode as one.
    fn try_parse(&self, bytes: &[u8]) -> Option<Block>;

    /// Hand a consensus-ordered block to the engine for execution.
    fn exec_block(&self, block: &Block);

    /// Record that `block_number` has been durably committed.
    fn log_commitment(&self, block_number: u64);

    /// Roll local state back to the last commitment consensus
    /// acknowledged. Called by [`super::guard::AutorollbackGuard`] on an
    /// uncommitted drop.
    fn rewind_to_last_commit(&self);

    /// Cold-start initialization with no prior state.
    fn init_clean(&self);

    /// Initialization by replaying persisted state from disk.
    fn init_from_disk(&self);
}

/// A [`ConsensusCollaborator`] that does nothing — useful for exercising
/// the block production/validation pipelines without a real consensus
/// integration wired in.
#[derive(Debug, Default)]
pub struct NullConsensusCollaborator;

impl ConsensusCollaborator for NullConsensusCollaborator {
    fn propose(&self, _block: &Block) {}
    fn try_parse(&self, _bytes: &[u8]) -> Option<Block> {
        None
    }
    fn exec_block(&self, _block: &Block) {}
    fn log_commitment(&self, _block_number: u64) {}
    fn rewind_to_last_commit(&self) {}
    fn init_clean(&self) {}
    fn init_from_disk(&self) {}
}
