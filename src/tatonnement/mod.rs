//! The tâtonnement price oracle (§4.6): a fixed pool of worker threads
//! racing an LP feasibility check and a timeout, each running its own
//! step-controlled grid search from the same starting price vector.
//!
//! Per-worker demand/supply integration is `ParallelDemandOracle` in the
//! original — its own 5-child-thread fan-out over the orderbooks. This
//! crate flattens that into a single call to
//! [`crate::orderbook::OrderbookManager::calculate_demands_and_supplies`],
//! which already fans out across every orderbook with the manager's own
//! work-stealing-grain helper; nesting a second thread pool inside each of
//! the ~6 tâtonnement workers would only subdivide the same fixed set of
//! orderbooks more finely; see `DESIGN.md`.
//!
//! Price deltas are computed in floating point rather than the original's
//! fixed-point bit-shift formula — acceptable because tâtonnement's
//! trajectory never needs cross-node bit-exact reproduction (floating-point
//! determinism is explicitly out of scope); the only value that must be
//! exact is the winning price vector's LP feasibility, which is checked
//! with the same fixed-point `Price`/LP machinery every other path uses.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::{EngineConfig, TatonnementControlParameters};
use crate::lp::{LpSolver, OrderbookLpBounds};
use crate::orderbook::OrderbookManager;
use crate::price::Price;
use crate::price_computation::VolumeRelativizer;

/// Outcome of one tâtonnement query.
#[derive(Debug, Clone)]
pub enum TatonnementOutcome {
    /// A worker found prices that pass the LP feasibility probe.
    Converged { prices: Vec<Price>, rounds_run: u64 },
    /// No worker converged before the timeout. Callers fall back to an
    /// unconstrained (no lower bounds) final LP solve.
    TimedOut { rounds_run: u64 },
}

struct SharedWorkspace {
    prices: Vec<Price>,
    winner_rounds: u64,
}

/// Coordinates one query across the worker pool. Constructed fresh per
/// block; `done_flag`/`workspace` are the only state shared across worker
/// threads.
pub struct TatonnementOracle {
    config: EngineConfig,
    lp_solver: LpSolver,
}

impl TatonnementOracle {
    pub fn new(config: EngineConfig) -> Self {
        TatonnementOracle {
            config,
            lp_solver: LpSolver::new(),
        }
    }

    /// The pooled LP solver the oracle uses for its own feasibility
    /// probes — reused by the block pipeline for the final clearing
    /// solve so both paths share one set of pooled row buffers.
    pub fn lp_solver(&self) -> &LpSolver {
        &self.lp_solver
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one tâtonnement query to find a clearing price vector for
    /// `manager`'s current demand/supply curves, starting from
    /// `initial_prices`.
    pub fn run_query(
        &self,
        manager: &OrderbookManager,
        initial_prices: &[Price],
        relativizer: &RwLock<VolumeRelativizer>,
    ) -> TatonnementOutcome {
        let num_assets = manager.num_assets() as usize;
        let done = AtomicBool::new(false);
        let timeout_flag = AtomicBool::new(false);
        let cancel_timeout = AtomicBool::new(false);
        let workspace = Mutex::new(SharedWorkspace {
            prices: initial_prices.to_vec(),
            winner_rounds: 0,
        });
        let total_rounds = AtomicU64::new(0);

        std::thread::scope(|scope| {
            let timeout = self.config.tatonnement_timeout;
            scope.spawn(|| Self::run_timeout(timeout, &timeout_flag, &cancel_timeout));

            for worker_id in 0..self.config.num_tatonnement_workers {
                let params = self
                    .config
                    .worker_control_parameters
                    .get(worker_id)
                    .copied()
                    .unwrap_or_default();
                scope.spawn(|| {
                    self.run_worker(
                        worker_id,
                        params,
                        manager,
                        num_assets,
                        initial_prices,
                        relativizer,
                        &done,
                        &timeout_flag,
                        &workspace,
                        &total_rounds,
                    );
                });
            }
        });
        cancel_timeout.store(true, Ordering::SeqCst);

        let rounds_run = total_rounds.load(Ordering::Relaxed);
        if done.load(Ordering::SeqCst) {
            let ws = workspace.into_inner().unwrap();
            info!(rounds_run = ws.winner_rounds, "tatonnement converged");
            TatonnementOutcome::Converged {
                prices: ws.prices,
                rounds_run: ws.winner_rounds,
            }
        } else {
            warn!(rounds_run, "tatonnement timed out");
            TatonnementOutcome::TimedOut { rounds_run }
        }
    }

    fn run_timeout(timeout: Duration, timeout_flag: &AtomicBool, cancel: &AtomicBool) {
        let start = Instant::now();
        let slice = Duration::from_millis(5).min(timeout);
        while start.elapsed() < timeout {
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(slice);
        }
        if !cancel.load(Ordering::SeqCst) {
            timeout_flag.store(true, Ordering::SeqCst);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_worker(
        &self,
        worker_id: usize,
        params: TatonnementControlParameters,
        manager: &OrderbookManager,
        num_assets: usize,
        initial_prices: &[Price],
        relativizer: &RwLock<VolumeRelativizer>,
        done: &AtomicBool,
        timeout_flag: &AtomicBool,
        workspace: &Mutex<SharedWorkspace>,
        total_rounds: &AtomicU64,
    ) {
        let mut prices: Vec<f64> = initial_prices.iter().map(|p| p.to_double()).collect();
        let mut step = 1.0f64;
        let mut best_objective = f64::INFINITY;
        let mut round: u64 = 0;
        // per-asset weight inversely proportional to min(demand, supply),
        // recomputed every `relativizer_frequency` rounds (§4.6 step 5).
        let mut dynamic_relativizer = vec![1.0f64; num_assets];

        loop {
            if done.load(Ordering::SeqCst) || timeout_flag.load(Ordering::SeqCst) {
                break;
            }
            if round >= self.config.approximation_parameters.max_rounds {
                break;
            }

            let price_vec = Self::to_prices(&prices);
            let (demand, supply) = manager.calculate_demands_and_supplies(&price_vec, 0);

            if round % self.config.lp_check_frequency == 0 {
                if self.probe_feasible(manager, &price_vec) {
                    if done
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let mut ws = workspace.lock().unwrap();
                        ws.prices = price_vec;
                        ws.winner_rounds = round;
                        debug!(worker_id, round, "worker won tatonnement race");
                    }
                    break;
                }
            } else {
                let relativizer_snapshot: Vec<u16> = if params
                    .relativizers
                    .contains(crate::config::RelativizerFeatures::VOLUME)
                {
                    relativizer.read().unwrap().formatted_avgs().to_vec()
                } else {
                    vec![16u16; num_assets]
                };
                if params
                    .relativizers
                    .contains(crate::config::RelativizerFeatures::DYNAMIC)
                    && round % self.config.relativizer_frequency == 0
                {
                    Self::recompute_dynamic_relativizer(&demand, &supply, &mut dynamic_relativizer);
                }
                let mut new_prices = prices.clone();
                for asset in 0..num_assets {
                    let diff = demand[asset] - supply[asset];
                    if diff == 0 {
                        continue;
                    }
                    let rel = (relativizer_snapshot[asset] as f64 / 16.0) * dynamic_relativizer[asset];
                    let magnitude = step * prices[asset] * (diff.unsigned_abs() as f64 / (1u128 << 24) as f64) * rel;
                    let delta = magnitude.max(0.0);
                    let price_epsilon = 1.0 / (1u64 << 24) as f64;
                    if diff > 0 {
                        new_prices[asset] += delta;
                    } else {
                        new_prices[asset] = (new_prices[asset] - delta).max(price_epsilon);
                    }
                }

                let new_price_vec = Self::to_prices(&new_prices);
                let (new_demand, new_supply) = manager.calculate_demands_and_supplies(&new_price_vec, 0);
                let objective = Self::objective(&new_demand, &new_supply);
                let prev_objective = Self::objective(&demand, &supply);
                let reference = if best_objective.is_finite() {
                    best_objective
                } else {
                    prev_objective
                };

                if objective <= reference * 1.01 {
                    prices = new_prices;
                    step *= 1.4;
                    best_objective = objective.min(reference);
                } else {
                    step *= 0.8;
                }
                step = step.clamp(
                    params.min_step as f64 / (1u64 << params.step_radix.min(63)) as f64,
                    params.max_step as f64,
                );
            }

            if round % self.config.renormalize_frequency == 0 && round > 0 {
                Self::renormalize(&mut prices);
            }

            round += 1;
            total_rounds.fetch_add(1, Ordering::Relaxed);
        }

        trace!(worker_id, rounds = round, "tatonnement worker exiting");
    }

    /// Recompute the per-asset dynamic relativizer: weight inversely
    /// proportional to `min(demand, supply)` for that asset, normalized so
    /// the average weight stays near 1.0 (pure scale factors on the step
    /// formula, not absolute magnitudes).
    fn recompute_dynamic_relativizer(demand: &[i128], supply: &[i128], out: &mut [f64]) {
        let mins: Vec<f64> = demand
            .iter()
            .zip(supply)
            .map(|(&d, &s)| d.abs().min(s.abs()) as f64)
            .collect();
        let floor = 1.0f64;
        let raw: Vec<f64> = mins.iter().map(|&m| 1.0 / m.max(floor)).collect();
        let mean = raw.iter().sum::<f64>() / raw.len().max(1) as f64;
        if mean <= 0.0 || !mean.is_finite() {
            out.iter_mut().for_each(|w| *w = 1.0);
            return;
        }
        for (o, r) in out.iter_mut().zip(raw) {
            *o = r / mean;
        }
    }

    fn probe_feasible(&self, manager: &OrderbookManager, prices: &[Price]) -> bool {
        let bounds = Self::lp_bounds(manager, prices);
        self.lp_solver.check_feasible(
            &bounds,
            prices,
            self.config.approximation_parameters.tax_rate,
            prices.len(),
        )
    }

    /// Build the LP bounds for every orderbook in `manager` at `prices`.
    /// Shared with the block pipeline's final clearing solve so both
    /// paths express the same variables/constraints.
    pub fn lp_bounds(manager: &OrderbookManager, prices: &[Price]) -> Vec<OrderbookLpBounds> {
        manager
            .books()
            .iter()
            .map(|book| {
                let (lower, upper) = book.get_execution_prices(prices, 0);
                let (upper_endow, _) = book.get_metadata(upper);
                let (lower_endow, _) = book.get_metadata(lower);
                OrderbookLpBounds {
                    category: book.category,
                    lower_bound: lower_endow,
                    upper_bound: upper_endow,
                }
            })
            .collect()
    }

    fn objective(demand: &[i128], supply: &[i128]) -> f64 {
        demand
            .iter()
            .zip(supply)
            .map(|(&d, &s)| {
                let diff = (d - s) as f64;
                diff * diff
            })
            .sum::<f64>()
            .sqrt()
    }

    fn renormalize(prices: &mut [f64]) {
        let max = prices.iter().cloned().fold(0.0f64, f64::max);
        if max <= 0.0 {
            return;
        }
        // keep headroom against MAX_PRICE overflow in the fixed-point domain.
        let ceiling = crate::price::MAX_PRICE as f64 / (1u64 << 24) as f64 / 1024.0;
        if max > ceiling {
            let scale = ceiling / max;
            for p in prices.iter_mut() {
                *p *= scale;
            }
        }
    }

    fn to_prices(doubles: &[f64]) -> Vec<Price> {
        doubles.iter().map(|&d| Price::from_double(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_manager_converges_immediately() {
        let manager = OrderbookManager::new(2);
        let oracle = TatonnementOracle::new(EngineConfig::new(2));
        let relativizer = RwLock::new(VolumeRelativizer::new(2));
        let prices = vec![Price::ONE, Price::ONE];
        match oracle.run_query(&manager, &prices, &relativizer) {
            TatonnementOutcome::Converged { rounds_run, .. } => {
                assert_eq!(rounds_run, 0);
            }
            TatonnementOutcome::TimedOut { .. } => panic!("expected immediate convergence with no offers"),
        }
    }
}
