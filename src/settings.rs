//! Fit settings: every tunable threshold for the pipeline (§4.6).

use crate::calibration::{Calibration, PolyCalibration};
use crate::peak::Peak;

#[derive(Debug, Clone)]
pub struct KonSettings {
    pub width: usize,
    pub sigma_spectrum: f64,
    pub sigma_resid: f64,
    pub edge_width_factor: f64,
}

impl Default for KonSettings {
    fn default() -> Self {
        Self {
            width: 4,
            sigma_spectrum: 3.0,
            sigma_resid: 3.0,
            edge_width_factor: 3.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SanitySettings {
    pub min_epsilon: f64,
    pub max_epsilon: f64,
    pub slope_epsilon: f64,
    pub perturb_attempts: usize,
}

impl Default for SanitySettings {
    fn default() -> Self {
        Self {
            min_epsilon: 1e-4,
            max_epsilon: 1e-4,
            slope_epsilon: 1e-3,
            perturb_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitSettings {
    pub kon: KonSettings,
    pub sanity: SanitySettings,
    pub roi_max_peaks: usize,
    pub roi_extend_background: bool,
    pub background_edge_samples: usize,

    pub resid_auto: bool,
    pub resid_max_iterations: usize,
    pub resid_min_amplitude: f64,
    pub resid_too_close: f64,

    pub small_simplify: bool,
    pub small_max_amplitude: f64,

    pub width_common: bool,
    pub width_common_min: f64,
    pub width_common_max: f64,
    pub width_at_511_variable: bool,
    pub width_at_511_tolerance_kev: f64,

    pub default_peak: Peak,

    pub fitter_max_iter: usize,

    pub energy_calibration: PolyCalibration,
    pub fwhm_calibration: PolyCalibration,

    pub real_time: f64,
    pub live_time: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            kon: KonSettings::default(),
            sanity: SanitySettings::default(),
            roi_max_peaks: 10,
            roi_extend_background: false,
            background_edge_samples: 7,

            resid_auto: true,
            resid_max_iterations: 5,
            resid_min_amplitude: 10.0,
            resid_too_close: 0.5,

            small_simplify: true,
            small_max_amplitude: 500.0,

            width_common: false,
            width_common_min: 0.5,
            width_common_max: 50.0,
            width_at_511_variable: true,
            width_at_511_tolerance_kev: 2.0,

            default_peak: Peak::new(0, 0.0, 1.0, 1.0, 3.0),

            fitter_max_iter: 200,

            energy_calibration: PolyCalibration::identity(),
            fwhm_calibration: PolyCalibration::identity(),

            real_time: 1.0,
            live_time: 1.0,
        }
    }
}

impl FitSettings {
    pub fn calibrations_valid(&self) -> bool {
        self.energy_calibration.valid() && self.fwhm_calibration.valid()
    }

    /// Whether a peak at `energy` keV falls within tolerance of the 511 keV
    /// annihilation line, where width may vary independently of the shared
    /// width even when `width_common` is on.
    pub fn is_near_511(&self, energy: f64) -> bool {
        (energy - 511.0).abs() <= self.width_at_511_tolerance_kev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = FitSettings::default();
        assert_eq!(s.kon.width, 4);
        assert_eq!(s.roi_max_peaks, 10);
        assert_eq!(s.background_edge_samples, 7);
        assert!((s.kon.edge_width_factor - 3.5).abs() < 1e-9);
    }

    #[test]
    fn near_511_tolerance_is_symmetric() {
        let s = FitSettings::default();
        assert!(s.is_near_511(511.0));
        assert!(s.is_near_511(509.5));
        assert!(!s.is_near_511(500.0));
    }
}
