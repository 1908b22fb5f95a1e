//! Autorollback discipline (`SPEC_FULL.md` §4.7): guarantee that a block
//! under production or validation either fully commits or fully undoes.
//!
//! The original composes this from several independent RAII guards (one
//! per resource — orderbook thunks, the account modification log, the
//! consensus collaborator's own undo point), deliberately ordered so the
//! account-modification-log guard is constructed last and destroyed
//! first (DB rollback needs to consult the still-live log). This crate
//! flattens that chain into a single [`AutorollbackGuard`] whose `Drop`
//! impl runs the same steps in the same order — one `Drop` body gives us
//! the identical ordering guarantee without a multi-guard chain, and
//! there is exactly one call site (this module) that needs it. Noted in
//! `DESIGN.md`.

use std::sync::Mutex;

use tracing::warn;

use crate::error::EngineResult;
use crate::header_map::BlockHeaderHashMap;
use crate::modlog::ModificationLog;
use crate::orderbook::OrderbookManager;
use crate::trie::Hash;

use super::consensus::ConsensusCollaborator;

/// Guards one block's worth of tentative state. Drop undoes everything
/// unless [`AutorollbackGuard::finalize_commit`] was called first.
pub struct AutorollbackGuard<'a> {
    orderbook_manager: &'a OrderbookManager,
    modification_log: &'a Mutex<ModificationLog>,
    consensus: Option<&'a dyn ConsensusCollaborator>,
    /// Rollback point: the last block number known fully committed.
    prev_block_number: u64,
    committed: bool,
}

impl<'a> AutorollbackGuard<'a> {
    pub fn new(
        orderbook_manager: &'a OrderbookManager,
        modification_log: &'a Mutex<ModificationLog>,
        consensus: Option<&'a dyn ConsensusCollaborator>,
        prev_block_number: u64,
    ) -> Self {
        AutorollbackGuard {
            orderbook_manager,
            modification_log,
            consensus,
            prev_block_number,
            committed: false,
        }
    }

    /// Flip every inner resource to "committed" and record `block_number
    /// -> block_hash` in `header_map`. Consumes the guard, so its `Drop`
    /// runs immediately afterward as a no-op.
    pub fn finalize_commit(
        mut self,
        header_map: &BlockHeaderHashMap,
        block_number: u64,
        block_hash: Hash,
    ) -> EngineResult<()> {
        header_map.insert(block_number, block_hash)?;
        if let Some(consensus) = self.consensus {
            consensus.log_commitment(block_number);
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for AutorollbackGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        warn!(
            prev_block_number = self.prev_block_number,
            "autorollback guard dropped uncommitted; rolling back tentative block state"
        );
        // account-modification-log rollback first: DB/orderbook rollback
        // below is allowed to consult it while it's still the block's log.
        *self.modification_log.lock().unwrap() = ModificationLog::new();
        if let Err(err) = self.orderbook_manager.rollback_thunks(self.prev_block_number) {
            tracing::error!(?err, "orderbook rollback failed during autorollback");
        }
        if let Some(consensus) = self.consensus {
            consensus.rewind_to_last_commit();
        }
    }
}
