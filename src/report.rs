//! Per-peak report assembly: position/energy, FWHM, area (analytic + SUM4),
//! and Currie detection-quality indicator (§6 outputs).

use crate::calibration::Calibration;
use crate::region::Region;

#[derive(Debug, Clone, PartialEq)]
pub struct PeakReport {
    pub id: u64,
    pub position: f64,
    pub position_uncert: f64,
    pub energy: f64,
    pub fwhm_channels: f64,
    pub fwhm_energy: f64,
    pub area_analytic: f64,
    pub area_sum4: f64,
    pub area_sum4_uncert: f64,
    pub currie_quality: u8,
}

pub fn build_reports(
    region: &Region,
    energy_cal: &dyn Calibration,
    fwhm_cal: &dyn Calibration,
) -> Vec<PeakReport> {
    region
        .peaks
        .values()
        .map(|peak| {
            let position = peak.position.val();
            let energy = if energy_cal.valid() {
                energy_cal.eval(position)
            } else {
                position
            };
            let fwhm_channels = peak.fwhm(&region.default_peak.width);
            let fwhm_energy = if fwhm_cal.valid() {
                fwhm_cal.eval(energy)
            } else {
                fwhm_channels
            };
            let area_analytic = peak.analytic_area(&region.default_peak.width);

            let (area_sum4, area_sum4_uncert, currie_quality) = match &peak.sum4 {
                Some(area) => (area.peak.value, area.peak.sigma, area.currie_quality()),
                None => (0.0, 0.0, 5),
            };

            PeakReport {
                id: peak.id,
                position,
                position_uncert: peak.position.uncert,
                energy,
                fwhm_channels,
                fwhm_energy,
                area_analytic,
                area_sum4,
                area_sum4_uncert,
                currie_quality,
            }
        })
        .collect()
}
