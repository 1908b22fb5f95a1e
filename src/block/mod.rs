//! Block lifecycle (`SPEC_FULL.md` §4.7): the production and validation
//! pipelines that tie every other module together into one block's
//! worth of work, plus the autorollback discipline that makes each
//! pipeline all-or-nothing.

pub mod consensus;
pub mod database;
pub mod guard;
pub mod header;

pub use consensus::{ConsensusCollaborator, NullConsensusCollaborator};
pub use database::{AccountDatabase, FixedHashDatabase};
pub use guard::AutorollbackGuard;
pub use header::{Block, BlockInternalHashes};

use std::sync::{Mutex, RwLock};

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::header_map::BlockHeaderHashMap;
use crate::lp::LpSolver;
use crate::modlog::ModificationLog;
use crate::orderbook::{Offer, OrderbookManager};
use crate::price::Price;
use crate::price_computation::VolumeRelativizer;
use crate::tatonnement::{TatonnementOracle, TatonnementOutcome};

/// Everything one running node needs to produce and validate blocks: the
/// orderbook set, the account-modification-log slot for the block
/// currently in flight, the block-header hash map, the tâtonnement
/// oracle, and the rolling volume-relativizer state tâtonnement
/// preconditions on.
pub struct Engine {
    config: EngineConfig,
    orderbooks: OrderbookManager,
    modification_log: Mutex<ModificationLog>,
    header_map: BlockHeaderHashMap,
    tatonnement: TatonnementOracle,
    relativizer: RwLock<VolumeRelativizer>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let num_assets = config.num_assets;
        Engine {
            tatonnement: TatonnementOracle::new(config.clone()),
            orderbooks: OrderbookManager::new(num_assets),
            modification_log: Mutex::new(ModificationLog::new()),
            header_map: BlockHeaderHashMap::new(),
            relativizer: RwLock::new(VolumeRelativizer::new(num_assets as usize)),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn orderbooks(&self) -> &OrderbookManager {
        &self.orderbooks
    }

    pub fn header_map(&self) -> &BlockHeaderHashMap {
        &self.header_map
    }

    /// Replace the block-scoped account modification log, e.g. with the
    /// merged result of `modlog::merge_sublog` calls the (out-of-scope)
    /// transaction-intake path produced for the block being assembled.
    pub fn set_modification_log(&self, log: ModificationLog) {
        *self.modification_log.lock().unwrap() = log;
    }

    /// Run the 8-step production pipeline for block `block_number`,
    /// whose offers/cancellations have already been merged into the
    /// orderbook manager's uncommitted sets and whose account
    /// modification log has already been installed via
    /// [`Engine::set_modification_log`].
    #[allow(clippy::too_many_arguments)]
    pub fn produce_block(
        &self,
        prev_block_hash: crate::trie::Hash,
        block_number: u64,
        fee_rate: u8,
        db: &dyn AccountDatabase,
        consensus: Option<&dyn ConsensusCollaborator>,
        initial_prices: &[Price],
        mut on_execute: impl FnMut(&Offer, i64) + Send + Sync,
    ) -> EngineResult<Block> {
        // step 1: allocate the block's account-modification-log file
        // descriptor. Out of scope here — no on-disk per-block log file
        // is opened by this crate (see `modlog` module docs).
        let guard = AutorollbackGuard::new(
            &self.orderbooks,
            &self.modification_log,
            consensus,
            block_number.saturating_sub(1),
        );

        // step 2: point-in-time account snapshot.
        db.commit_new_accounts(block_number)?;

        // step 3: merge pending offers, start this block's thunks.
        self.orderbooks.commit_for_production(block_number)?;

        // step 4: tâtonnement, falling back to an unconstrained LP solve
        // on timeout.
        let outcome = self
            .tatonnement
            .run_query(&self.orderbooks, initial_prices, &self.relativizer);
        let target_tax_rate = self.config.approximation_parameters.tax_rate;
        let (prices, use_lower_bounds, rounds_run) = match &outcome {
            TatonnementOutcome::Converged { prices, rounds_run } => {
                (prices.clone(), true, *rounds_run)
            }
            TatonnementOutcome::TimedOut { rounds_run } => {
                warn!(rounds_run, "tatonnement timed out; falling back to unconstrained LP solve");
                (initial_prices.to_vec(), false, *rounds_run)
            }
        };
        let bounds = TatonnementOracle::lp_bounds(&self.orderbooks, &prices);
        let num_assets = self.orderbooks.num_assets() as usize;

        // step 5: sanity-check the LP solution and fold this block's
        // traded volume into next block's preconditioner.
        let solution = self
            .tatonnement
            .lp_solver()
            .solve(&bounds, &prices, target_tax_rate, num_assets, use_lower_bounds)?;
        let (_demand, supply) = self.orderbooks.calculate_demands_and_supplies(&prices, 0);
        let sell_volume: Vec<crate::price::FractionalAsset> = supply
            .iter()
            .map(|&s| crate::price::FractionalAsset::from_raw((s.max(0) as u128) >> (crate::price::PRICE_RADIX - 10)))
            .collect();
        self.relativizer.write().unwrap().update_averages(&sell_volume);

        // step 6: clear offers against the solved supply activation.
        let (commitments, stats) = self.orderbooks.clear_offers_for_production(
            &prices,
            solution.tax_rate,
            &solution.supply_activated,
            |offer, amount| on_execute(offer, amount),
        )?;
        info!(
            block_number,
            rounds_run,
            offers_fully_cleared = stats.offers_fully_cleared,
            offers_partially_cleared = stats.offers_partially_cleared,
            "block cleared"
        );

        // step 7: state commitments and block header assembly.
        let modification_log_hash = self.modification_log.lock().unwrap().hash();
        let block_map_hash = self.header_map.root_hash();
        let block = Block {
            prev_block_hash,
            block_number,
            prices,
            fee_rate,
            internal_hashes: BlockInternalHashes {
                db_hash: db.root_hash(),
                clearing_details: commitments,
                modification_log_hash,
                block_map_hash,
            },
        };
        let block_hash = block.block_hash();

        // step 8: timeout/tâtonnement threads already joined inside
        // `run_query`; record the finalized block hash.
        guard.finalize_commit(&self.header_map, block_number, block_hash)?;
        Ok(block)
    }

    /// Run the validation pipeline against a candidate block produced by
    /// (supposedly) another replica's `produce_block`. Returns `Ok(false)`
    /// — not an error — for any check that fails; the caller rejects the
    /// block and all tentative state is rolled back automatically when
    /// the guard drops.
    pub fn validate_block(
        &self,
        block: &Block,
        prev_block_hash: crate::trie::Hash,
        expected_block_number: u64,
        target_tax_rate: u8,
        db: &dyn AccountDatabase,
        consensus: Option<&dyn ConsensusCollaborator>,
        mut on_execute: impl FnMut(&Offer, i64) + Send + Sync,
    ) -> EngineResult<bool> {
        if block.block_number != expected_block_number
            || block.prev_block_hash != prev_block_hash
            || block.prices.len() != self.orderbooks.num_assets() as usize
        {
            return Ok(false);
        }
        if target_tax_rate > 0 && block.fee_rate + 1 < target_tax_rate {
            return Ok(false);
        }

        let guard = AutorollbackGuard::new(
            &self.orderbooks,
            &self.modification_log,
            consensus,
            expected_block_number.saturating_sub(1),
        );

        // every orderbook's claimed supply activation must be globally
        // clearing at the block's prices.
        let bounds = TatonnementOracle::lp_bounds(&self.orderbooks, &block.prices);
        let num_assets = block.prices.len();
        if !self.tatonnement.lp_solver().check_feasible(
            &bounds,
            &block.prices,
            target_tax_rate,
            num_assets,
        ) {
            return Ok(false);
        }

        self.orderbooks.tentative_commit_for_validation(block.block_number)?;
        let (ok, _stats) = self
            .orderbooks
            .tentative_clear_offers_for_validation(&block.internal_hashes.clearing_details, |offer, amount| {
                on_execute(offer, amount)
            })?;
        if !ok {
            return Ok(false);
        }

        let recomputed = Block {
            prev_block_hash: block.prev_block_hash,
            block_number: block.block_number,
            prices: block.prices.clone(),
            fee_rate: block.fee_rate,
            internal_hashes: BlockInternalHashes {
                db_hash: db.root_hash(),
                clearing_details: block.internal_hashes.clearing_details.clone(),
                modification_log_hash: self.modification_log.lock().unwrap().hash(),
                block_map_hash: self.header_map.root_hash(),
            },
        };
        if recomputed.block_hash() != block.block_hash() {
            warn!(block_number = block.block_number, "block hash mismatch during validation");
            return Ok(false);
        }

        guard.finalize_commit(&self.header_map, block.block_number, block.block_hash())?;
        Ok(true)
    }

    /// Replay every persisted block in `[from_block, to_block]` against
    /// `kv_envs`/`header_kv` on cold start, per §4.8's reconciliation
    /// contract. Reconstructs in-memory tries; the deterministic clearing
    /// replay itself is the caller's responsibility (it has the
    /// transaction/offer intake this crate doesn't model).
    pub fn load_from_disk(
        &self,
        kv_envs: &[&dyn crate::kv::KvEnvironment],
        header_kv: &dyn crate::kv::KvEnvironment,
    ) -> EngineResult<()> {
        self.orderbooks.load_from_disk(kv_envs)?;
        self.header_map.load_from_disk(header_kv)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_block_produces_and_validates() {
        let config = EngineConfig::new(2);
        let engine = Engine::new(config);
        let db = FixedHashDatabase([0u8; 32]);
        let prices = vec![Price::ONE, Price::ONE];

        let block = engine
            .produce_block([0u8; 32], 1, 10, &db, None, &prices, |_, _| {})
            .unwrap();
        assert_eq!(block.block_number, 1);
        assert_eq!(engine.header_map().get(1), Some(block.block_hash()));

        let ok = engine
            .validate_block(&block, [0u8; 32], 1, 10, &db, None, |_, _| {})
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn validation_rejects_wrong_block_number() {
        let config = EngineConfig::new(2);
        let engine = Engine::new(config);
        let db = FixedHashDatabase([0u8; 32]);
        let prices = vec![Price::ONE, Price::ONE];
        let block = engine
            .produce_block([0u8; 32], 1, 10, &db, None, &prices, |_, _| {})
            .unwrap();

        let ok = engine
            .validate_block(&block, [0u8; 32], 2, 10, &db, None, |_, _| {})
            .unwrap();
        assert!(!ok);
    }
}
