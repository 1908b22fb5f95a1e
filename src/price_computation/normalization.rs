//! Rolling volume average: a tâtonnement step-size preconditioner.
//!
//! None of these numbers are sent to consensus, so floating-point drift is
//! not a soundness concern — it's a heuristic for picking better starting
//! step sizes next block, grounded on the original's
//! `NormalizationRollingAverage`.

use crate::price::FractionalAsset;

/// The "1" in relative-volume space: if every asset traded at the same
/// volume, every rolling average would format to this value.
const RELATIVE_VOLUME_BASEPT: u16 = 16;

/// Largest ratio representable in a `u16` formatted average.
fn max_relative_volume() -> f64 {
    u16::MAX as f64 / RELATIVE_VOLUME_BASEPT as f64
}

/// Weight of the previous rolling-average value in the geometric-mean
/// update; the new sample gets `1.0 - KEEP_AMT`.
const KEEP_AMT: f64 = 0.5;

/// Tracks each asset's traded volume relative to the block's
/// highest-volume asset, smoothed block-over-block by a geometric rolling
/// average, and exposes it pre-scaled to `u16` for the tâtonnement step
/// calculation.
pub struct VolumeRelativizer {
    num_assets: usize,
    rolling_averages: Vec<f64>,
    formatted: Vec<u16>,
}

impl VolumeRelativizer {
    pub fn new(num_assets: usize) -> Self {
        VolumeRelativizer {
            num_assets,
            rolling_averages: vec![1.0; num_assets],
            formatted: vec![RELATIVE_VOLUME_BASEPT; num_assets],
        }
    }

    /// Preconditioning weights for use as tâtonnement's per-asset
    /// relativizer array.
    pub fn formatted_avgs(&self) -> &[u16] {
        &self.formatted
    }

    fn relative_volume(max: FractionalAsset, supply: FractionalAsset) -> f64 {
        let candidate = max.to_double() / supply.to_double();
        candidate.min(max_relative_volume())
    }

    /// Feed in this block's per-asset sell-side volume (`supply_activated *
    /// price`, summed over every orderbook selling that asset) and fold it
    /// into the rolling average.
    pub fn update_averages(&mut self, per_asset_sell_volume: &[FractionalAsset]) {
        assert_eq!(per_asset_sell_volume.len(), self.num_assets);

        let max = per_asset_sell_volume
            .iter()
            .copied()
            .fold(FractionalAsset::ZERO, |a, b| if b > a { b } else { a });
        let total = per_asset_sell_volume
            .iter()
            .fold(FractionalAsset::ZERO, |a, &b| a + b);
        let avg = FractionalAsset::from_raw(total.raw() / self.num_assets as u128);

        for (i, &supply) in per_asset_sell_volume.iter().enumerate() {
            let new_factor = if supply.raw() > 0 {
                Self::relative_volume(max, supply)
            } else {
                Self::relative_volume(max, avg)
            };
            self.rolling_averages[i] = self.rolling_averages[i].powf(KEEP_AMT)
                * new_factor.powf(1.0 - KEEP_AMT);
        }
        self.update_formatted();
    }

    fn update_formatted(&mut self) {
        let ceiling = u16::MAX as f64 / RELATIVE_VOLUME_BASEPT as f64;
        for (i, &avg) in self.rolling_averages.iter().enumerate() {
            self.formatted[i] = if avg >= ceiling {
                u16::MAX
            } else {
                let scaled = (RELATIVE_VOLUME_BASEPT as f64 * avg) as u16;
                scaled.max(1)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uniform() {
        let r = VolumeRelativizer::new(3);
        assert_eq!(r.formatted_avgs(), &[16, 16, 16]);
    }

    #[test]
    fn skewed_volume_pulls_relativizer_down_for_quiet_asset() {
        let mut r = VolumeRelativizer::new(2);
        let volumes = vec![
            FractionalAsset::from_integral(1000),
            FractionalAsset::from_integral(10),
        ];
        r.update_averages(&volumes);
        let avgs = r.formatted_avgs();
        // the busy asset (index 0) stays near baseline; the quiet one
        // (index 1) should have a noticeably higher relative-volume
        // weight since it traded far below the block max.
        assert!(avgs[1] > avgs[0]);
    }

    #[test]
    fn zero_volume_asset_falls_back_to_block_average() {
        let mut r = VolumeRelativizer::new(2);
        let volumes = vec![FractionalAsset::from_integral(100), FractionalAsset::ZERO];
        r.update_averages(&volumes);
        // must not panic/NaN when an asset sees zero volume in a block.
        assert!(r.formatted_avgs()[1] > 0);
    }
}
