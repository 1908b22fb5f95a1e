//! Runtime configuration (`SPEC_FULL.md` §10.3).
//!
//! This crate does not parse CLI arguments or config files — a caller
//! builds an [`EngineConfig`] however it likes (literal, `serde_json`,
//! environment) and passes it in. The `Default` impls below match the
//! original engine's literal constants.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Which optional relativizer preconditioners a tâtonnement worker
    /// applies to its price-delta formula. Modeled as flags rather than two
    /// separate bools because the original's `TatonnementControlParameters`
    /// toggles them together as one configuration choice per worker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RelativizerFeatures: u8 {
        /// Use the rolling volume-relativizer preconditioner from
        /// `price_computation::normalization`.
        const VOLUME = 0b01;
        /// Use the per-round dynamic relativizer (inversely proportional to
        /// `min(demand, supply)`), recomputed every 10 rounds.
        const DYNAMIC = 0b10;
    }
}

impl Default for RelativizerFeatures {
    fn default() -> Self {
        RelativizerFeatures::VOLUME | RelativizerFeatures::DYNAMIC
    }
}

/// Tolerances tâtonnement and the LP solver share for one block, bundled
/// the way the original's call sites pass them together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApproximationParameters {
    /// Ceiling on `smooth_mult` tried while searching for a feasible
    /// partial-activation band.
    pub max_smooth_mult: u8,
    /// Target tax rate (as a right-shift amount, `2^-tax_rate`) clearing
    /// aims for; the realized rate may be relaxed by exactly one unit of
    /// slack if the LP solution requires it.
    pub tax_rate: u8,
    /// Maximum tâtonnement rounds a single worker runs before yielding to
    /// the timeout thread's done_flag.
    pub max_rounds: u64,
}

impl Default for ApproximationParameters {
    fn default() -> Self {
        ApproximationParameters {
            max_smooth_mult: 255,
            tax_rate: 10,
            max_rounds: 1_000_000,
        }
    }
}

/// Per-worker tâtonnement search parameters (`TatonnementControlParameters`
/// in the original): each of the ~6 workers in the pool is seeded with a
/// distinct instance so the pool as a whole explores a spread of step
/// behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TatonnementControlParameters {
    /// `step` is interpreted as `step_raw >> step_radix` fixed-point.
    pub step_radix: u8,
    /// Smallest step magnitude a worker will shrink to before giving up
    /// on further refinement this round.
    pub min_step: u64,
    /// Largest step magnitude growth is capped at.
    pub max_step: u64,
    /// Which relativizer preconditioners this worker applies.
    pub relativizers: RelativizerFeatures,
}

impl Default for TatonnementControlParameters {
    fn default() -> Self {
        TatonnementControlParameters {
            step_radix: 55,
            min_step: 1 << 7,
            max_step: 1 << 50,
            relativizers: RelativizerFeatures::default(),
        }
    }
}

/// Top-level engine configuration: worker-pool sizes, LP check cadence,
/// and the tâtonnement/LP tolerance bundles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub num_assets: u32,
    /// Number of tâtonnement worker threads in the pool.
    pub num_tatonnement_workers: usize,
    /// Number of demand-computation child workers each tâtonnement worker
    /// owns.
    pub num_demand_workers: usize,
    /// Run the LP feasibility probe every this many tâtonnement rounds.
    pub lp_check_frequency: u64,
    /// Renormalize prices (headroom against overflow) every this many
    /// rounds.
    pub renormalize_frequency: u64,
    /// Recompute the dynamic relativizer every this many rounds.
    pub relativizer_frequency: u64,
    /// Check for a sibling worker's success every this many rounds.
    pub sibling_check_frequency: u64,
    /// Wall-clock budget for one block's tâtonnement search.
    pub tatonnement_timeout: std::time::Duration,
    pub approximation_parameters: ApproximationParameters,
    pub worker_control_parameters: Vec<TatonnementControlParameters>,
}

impl EngineConfig {
    /// A config for `num_assets` assets with every tâtonnement worker
    /// seeded from the same default control parameters.
    pub fn new(num_assets: u32) -> Self {
        let defaults = EngineConfig::default();
        let num_workers = defaults.num_tatonnement_workers;
        EngineConfig {
            num_assets,
            worker_control_parameters: vec![TatonnementControlParameters::default(); num_workers],
            ..defaults
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let num_workers = 6;
        EngineConfig {
            num_assets: 0,
            num_tatonnement_workers: num_workers,
            num_demand_workers: 5,
            lp_check_frequency: 1000,
            renormalize_frequency: 1000,
            relativizer_frequency: 10,
            sibling_check_frequency: 10_000,
            tatonnement_timeout: std::time::Duration::from_millis(500),
            approximation_parameters: ApproximationParameters::default(),
            worker_control_parameters: vec![TatonnementControlParameters::default(); num_workers],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_original_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.num_tatonnement_workers, 6);
        assert_eq!(cfg.num_demand_workers, 5);
        assert_eq!(cfg.lp_check_frequency, 1000);
        assert_eq!(cfg.worker_control_parameters[0].step_radix, 55);
        assert_eq!(cfg.worker_control_parameters[0].min_step, 1 << 7);
    }

    #[test]
    fn new_seeds_one_control_block_per_worker() {
        let cfg = EngineConfig::new(4);
        assert_eq!(cfg.num_assets, 4);
        assert_eq!(cfg.worker_control_parameters.len(), cfg.num_tatonnement_workers);
    }
}
