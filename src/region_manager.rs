//! Region manager: versioned container around a region exposing refit and
//! rollback, with an append-only fit-history (§4.6).

use tracing::{debug, info};

use crate::error::{PeakFitError, Result};
use crate::fit_eval::FitEvaluation;
use crate::kon::{find_calibrated, find_naive};
use crate::optimizer::{CancelFlag, Optimizer};
use crate::region::Region;
use crate::settings::FitSettings;
use crate::sum4::{Sum4Area, Sum4Background, Sum4Edge};
use crate::weighted_data::WeightedData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Empty,
    Seeded,
    Fit,
    Failed,
}

#[derive(Debug, Clone)]
pub struct FitSnapshot {
    pub region: Region,
    pub description: String,
    pub peak_count: usize,
    pub chi_sq_norm: f64,
    pub sum4_error: f64,
    pub sane: bool,
}

pub struct RegionManager {
    history: Vec<FitSnapshot>,
    current: usize,
    state: RegionState,
}

impl RegionManager {
    /// `create`: construct the initial region from a weighted-data slice.
    pub fn create(data: WeightedData, settings: &FitSettings) -> Result<Self> {
        let mut region = Region::create(data, settings.background_edge_samples)?;
        // Seed the region's default peak from the settings template so new
        // peaks inherit its tail/step enable flags (§4.6: "default_peak").
        let width = region.default_peak.width.clone();
        region.default_peak = settings.default_peak.clone();
        region.default_peak.width = width;
        let snapshot = FitSnapshot {
            peak_count: 0,
            chi_sq_norm: 0.0,
            sum4_error: 0.0,
            sane: true,
            description: "Created".into(),
            region,
        };
        Ok(Self {
            history: vec![snapshot],
            current: 0,
            state: RegionState::Empty,
        })
    }

    pub fn current_region(&self) -> &Region {
        &self.history[self.current].region
    }

    pub fn current_region_mut(&mut self) -> &mut Region {
        self.history[self.current].region.dirty = true;
        &mut self.history[self.current].region
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn history(&self) -> &[FitSnapshot] {
        &self.history
    }

    /// `add peak`.
    pub fn add_peak(&mut self, left: f64, right: f64, amplitude_hint: f64) -> Result<u64> {
        let id = self.current_region_mut().add_peak(left, right, amplitude_hint)?;
        self.state = RegionState::Seeded;
        Ok(id)
    }

    /// `replace`.
    pub fn replace_peak(&mut self, id: u64, peak: crate::peak::Peak) -> Result<()> {
        self.current_region_mut().replace_peak(id, peak)?;
        self.state = RegionState::Seeded;
        Ok(())
    }

    /// `remove`.
    pub fn remove_peaks(&mut self, ids: &[u64]) {
        self.current_region_mut().remove_peaks(ids);
        self.state = RegionState::Seeded;
    }

    /// `refit`: re-index, pack variables, call the optimizer, write results
    /// back, recompute SUM4 areas, save a "Refit" snapshot.
    pub fn refit(
        &mut self,
        optimizer: &dyn Optimizer,
        cancel: &CancelFlag,
        settings: &FitSettings,
    ) -> Result<()> {
        info!("refit: reindexing and invoking optimizer");
        let region = self.current_region_mut();
        region.reindex();

        let result = optimizer.minimize(region, cancel);
        region.write_back(result.variables.as_slice());
        let chi_sq_norm = region.chi_sq_norm();
        let diag: Vec<f64> = (0..result.inv_hessian.nrows())
            .map(|i| result.inv_hessian[(i, i)])
            .collect();
        region.write_uncertainties(&diag, chi_sq_norm);

        let sanity = region.sanity_check(
            settings.sanity.min_epsilon,
            settings.sanity.max_epsilon,
            settings.sanity.slope_epsilon,
        );
        if !sanity.sane {
            debug!(reason = sanity.reasons, "refit produced a non-sane result");
        }

        self.recompute_sum4_all(settings)?;

        let region = self.current_region();
        let snapshot = FitSnapshot {
            region: region.clone(),
            description: "Refit".into(),
            peak_count: region.peaks.len(),
            chi_sq_norm,
            sum4_error: self.aggregate_sum4_error(),
            sane: sanity.sane,
        };
        self.push_snapshot(snapshot);
        self.state = if sanity.sane {
            RegionState::Fit
        } else {
            RegionState::Failed
        };
        Ok(())
    }

    /// `refit`, and if the result comes back "not sane", perturb the region
    /// and retry up to `sanity.perturb_attempts` times (§4.4).
    pub fn refit_with_perturb(
        &mut self,
        optimizer: &dyn Optimizer,
        cancel: &CancelFlag,
        settings: &FitSettings,
        rng: &mut impl rand::Rng,
    ) -> Result<()> {
        self.refit(optimizer, cancel, settings)?;
        let mut attempts = 0;
        while self.state == RegionState::Failed
            && attempts < settings.sanity.perturb_attempts
            && !cancel.is_set()
        {
            info!(attempt = attempts, "perturbing and retrying after sanity-check rejection");
            self.current_region_mut().perturb_all(rng);
            self.refit(optimizer, cancel, settings)?;
            attempts += 1;
        }
        Ok(())
    }

    fn push_snapshot(&mut self, snapshot: FitSnapshot) {
        self.history.truncate(self.current + 1);
        self.history.push(snapshot);
        self.current = self.history.len() - 1;
    }

    /// Recompute each peak's cached SUM4 area from the region's current
    /// edges and fit results.
    fn recompute_sum4_all(&mut self, settings: &FitSettings) -> Result<()> {
        let region = self.current_region_mut();
        region.left_edge = Sum4Edge::from_data(&region.data.left_prefix(settings.background_edge_samples));
        region.right_edge = Sum4Edge::from_data(&region.data.right_prefix(settings.background_edge_samples));
        let background = Sum4Background::from_edges(&region.left_edge, &region.right_edge)?;
        let left_edge = region.left_edge.clone();
        let right_edge = region.right_edge.clone();
        let default_width = region.default_peak.width.clone();
        let data = region.data.clone();
        for peak in region.peaks.values_mut() {
            let w = peak.effective_width(&default_width);
            let left = peak.position.val() - 2.0 * w;
            let right = peak.position.val() + 2.0 * w;
            let sample = data.subset_range(left, right);
            peak.sum4 = if sample.is_empty() {
                None
            } else {
                Sum4Area::compute(&sample, &background, &left_edge, &right_edge).ok()
            };
        }
        Ok(())
    }

    fn aggregate_sum4_error(&self) -> f64 {
        self.current_region()
            .peaks
            .values()
            .filter_map(|peak| peak.sum4.as_ref())
            .map(|area| area.peak.sigma)
            .sum()
    }

    /// `adjust sum4 / edges`: recompute a SUM4 edge without refitting.
    pub fn adjust_edge(&mut self, left: bool, samples: usize) {
        let region = self.current_region_mut();
        if left {
            region.left_edge = Sum4Edge::from_data(&region.data.left_prefix(samples));
        } else {
            region.right_edge = Sum4Edge::from_data(&region.data.right_prefix(samples));
        }
    }

    /// `add from residual`: run KON on the current residual, take the
    /// tallest detection, delegate to `add_peak`, then refit. No-op if no
    /// detection.
    pub fn add_from_residual(
        &mut self,
        optimizer: &dyn Optimizer,
        cancel: &CancelFlag,
        settings: &FitSettings,
    ) -> Result<bool> {
        let region = self.current_region();
        let eval = FitEvaluation::compute(region);
        let detections = if settings.calibrations_valid() {
            find_calibrated(
                &eval.channel,
                &eval.residual,
                &settings.energy_calibration,
                &settings.fwhm_calibration,
                settings.kon.sigma_resid,
                settings.kon.edge_width_factor,
            )
        } else {
            find_naive(&eval.channel, &eval.residual, settings.kon.width, settings.kon.sigma_resid)
        };

        let tallest = detections
            .into_iter()
            .max_by(|a, b| a.highest_y.partial_cmp(&b.highest_y).unwrap());

        let Some(detection) = tallest else {
            return Ok(false);
        };
        if detection.highest_y < settings.resid_min_amplitude {
            return Ok(false);
        }

        self.add_peak(detection.left, detection.right, detection.highest_y)?;
        self.refit(optimizer, cancel, settings)?;
        Ok(true)
    }

    /// `iterative fit`: bounded loop alternating "add from residual" and
    /// refit.
    pub fn iterative_fit(
        &mut self,
        optimizer: &dyn Optimizer,
        cancel: &CancelFlag,
        settings: &FitSettings,
    ) -> Result<usize> {
        let mut iterations = 0;
        for _ in 0..settings.resid_max_iterations {
            if cancel.is_set() {
                break;
            }
            let added = self.add_from_residual(optimizer, cancel, settings)?;
            if !added {
                break;
            }
            iterations += 1;
        }
        Ok(iterations)
    }

    /// `rollback`: restore region and current-fit pointer to snapshot `k`.
    pub fn rollback(&mut self, index: usize) -> Result<()> {
        if index >= self.history.len() {
            return Err(PeakFitError::invalid_shape(format!(
                "no snapshot at index {index}"
            )));
        }
        self.current = index;
        self.state = if self.history[index].sane {
            RegionState::Fit
        } else {
            RegionState::Failed
        };
        Ok(())
    }

    /// Apply the small-peak simplification rule: peaks below
    /// `small_max_amplitude` have all tails/step forcibly disabled.
    pub fn apply_small_peak_simplification(&mut self, settings: &FitSettings) {
        if !settings.small_simplify {
            return;
        }
        let threshold = settings.small_max_amplitude;
        let region = self.current_region_mut();
        for peak in region.peaks.values_mut() {
            if peak.amplitude.val() < threshold {
                peak.simplify();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::Bfgs;

    fn gaussian_data(n: usize, center: f64, width: f64, amp: f64, bkg: f64) -> WeightedData {
        let channel: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let count: Vec<f64> = channel
            .iter()
            .map(|&x| {
                let spread = (x - center) / width;
                bkg + amp * (-spread * spread).exp()
            })
            .collect();
        let weight: Vec<f64> = count.iter().map(|&c| c.max(1.0).sqrt()).collect();
        WeightedData::new(channel, count, weight).unwrap()
    }

    #[test]
    fn create_starts_in_empty_state_with_one_snapshot() {
        let data = gaussian_data(100, 50.0, 5.0, 500.0, 10.0);
        let settings = FitSettings::default();
        let manager = RegionManager::create(data, &settings).unwrap();
        assert_eq!(manager.state(), RegionState::Empty);
        assert_eq!(manager.history().len(), 1);
    }

    #[test]
    fn add_peak_transitions_to_seeded() {
        let data = gaussian_data(100, 50.0, 5.0, 500.0, 10.0);
        let settings = FitSettings::default();
        let mut manager = RegionManager::create(data, &settings).unwrap();
        manager.add_peak(45.0, 55.0, 500.0).unwrap();
        assert_eq!(manager.state(), RegionState::Seeded);
    }

    #[test]
    fn refit_produces_a_fit_or_failed_state_and_new_snapshot() {
        let data = gaussian_data(100, 50.0, 5.0, 500.0, 10.0);
        let settings = FitSettings::default();
        let mut manager = RegionManager::create(data, &settings).unwrap();
        manager.add_peak(45.0, 55.0, 500.0).unwrap();
        let optimizer = Bfgs::default();
        let cancel = CancelFlag::new();
        manager.refit(&optimizer, &cancel, &settings).unwrap();
        assert!(matches!(manager.state(), RegionState::Fit | RegionState::Failed));
        assert_eq!(manager.history().len(), 2);
    }

    #[test]
    fn rollback_restores_previous_peak_count() {
        let data = gaussian_data(100, 50.0, 5.0, 500.0, 10.0);
        let settings = FitSettings::default();
        let mut manager = RegionManager::create(data, &settings).unwrap();
        let optimizer = Bfgs::default();
        let cancel = CancelFlag::new();
        manager.add_peak(45.0, 55.0, 500.0).unwrap();
        manager.refit(&optimizer, &cancel, &settings).unwrap();
        let original_count = manager.current_region().peaks.len();
        manager.add_peak(10.0, 20.0, 50.0).unwrap();
        manager.refit(&optimizer, &cancel, &settings).unwrap();
        manager.rollback(1).unwrap();
        assert_eq!(manager.current_region().peaks.len(), original_count);
    }

    #[test]
    fn rollback_rejects_out_of_range_index() {
        let data = gaussian_data(50, 25.0, 5.0, 100.0, 5.0);
        let settings = FitSettings::default();
        let mut manager = RegionManager::create(data, &settings).unwrap();
        assert!(manager.rollback(99).is_err());
    }
}
