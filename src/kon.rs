//! KON: a convolution-based peak finder. Naive and calibration-aware
//! variants share one capability set (§4.5).

use rayon::prelude::*;

use crate::calibration::Calibration;

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub center: f64,
    pub left: f64,
    pub right: f64,
    pub highest_y: f64,
}

/// Naive KON: convolve with the finite-difference kernel of half-width `m`,
/// flag contiguous runs of `κ > σ`, extend edges outward.
pub fn find_naive(channel: &[f64], y: &[f64], m: usize, sigma: f64) -> Vec<Detection> {
    let n = y.len();
    if n < 2 * m + 2 {
        return Vec::new();
    }
    let shift = m / 2;
    // Evaluate each convolution window independently (parallel), writing each
    // result to its shifted output index directly.
    let mut kappa = vec![0.0_f64; n];
    let window_results: Vec<(usize, f64)> = (m..=n - 2 * m - 2)
        .into_par_iter()
        .map(|j| {
            let mut sum = 0.0;
            let mut window_sum = 0.0;
            for i in j..=j + m + 1 {
                sum += 2.0 * y[i] - y[i - m] - y[i + m];
                window_sum += y[i];
            }
            let y_bar = window_sum / m as f64;
            let denom = (6.0 * m as f64 * y_bar.max(0.0)).sqrt();
            ((j + shift).min(n - 1), if denom > 0.0 { sum / denom } else { 0.0 })
        })
        .collect();
    for (j, k) in window_results {
        kappa[j] = k;
    }
    detect_runs(channel, y, &kappa, sigma)
}

/// Calibrated KON: per-bin window half-width and edge extension derived from
/// the theoretical FWHM calibration instead of a fixed `m`.
pub fn find_calibrated(
    channel: &[f64],
    y: &[f64],
    energy_cal: &dyn Calibration,
    fwhm_cal: &dyn Calibration,
    sigma: f64,
    edge_width_factor: f64,
) -> Vec<Detection> {
    let n = y.len();
    if n < 5 || !energy_cal.valid() || !fwhm_cal.valid() {
        return Vec::new();
    }
    let mut kappa = vec![0.0_f64; n];
    for j in 0..n {
        let energy = energy_cal.eval(channel[j]);
        let fwhm_energy = fwhm_cal.eval(energy).max(1e-6);
        // Convert FWHM in energy units back to bins via the calibration derivative.
        let denergy_dchannel = energy_cal.derivative(channel[j]).abs().max(1e-9);
        let fwhm_bins = (fwhm_energy / denergy_dchannel).max(1.0);
        let m = (fwhm_bins / 2.0).round().max(1.0) as usize;
        if j < m || j + m + 1 >= n {
            continue;
        }
        let shift = m / 2;
        let mut sum = 0.0;
        let mut window_sum = 0.0;
        for i in j..=j + m + 1 {
            sum += 2.0 * y[i] - y[i - m] - y[i + m];
            window_sum += y[i];
        }
        let y_bar = window_sum / m as f64;
        let denom = (6.0 * m as f64 * y_bar.max(0.0)).sqrt();
        kappa[(j + shift).min(n - 1)] = if denom > 0.0 { sum / denom } else { 0.0 };
    }
    let mut detections = detect_runs(channel, y, &kappa, sigma);
    for det in &mut detections {
        let energy = energy_cal.eval(det.center);
        let fwhm_energy = fwhm_cal.eval(energy).max(1e-6);
        let denergy_dchannel = energy_cal.derivative(det.center).abs().max(1e-9);
        let fwhm_bins = fwhm_energy / denergy_dchannel;
        let goal_left = det.center - 0.5 * fwhm_bins * edge_width_factor;
        let goal_right = det.center + 0.5 * fwhm_bins * edge_width_factor;
        det.left = det.left.min(goal_left).max(channel[0]);
        det.right = det.right.max(goal_right).min(*channel.last().unwrap());
    }
    detections
}

fn detect_runs(channel: &[f64], y: &[f64], kappa: &[f64], sigma: f64) -> Vec<Detection> {
    let n = kappa.len();
    let mut detections = Vec::new();
    let mut i = 0;
    while i < n {
        if kappa[i] > sigma {
            let start = i;
            while i < n && kappa[i] > sigma {
                i += 1;
            }
            let end = i - 1;
            let mid_idx = (start + end) / 2;

            // Edge extension: walk outward past first kappa>=0, skip one,
            // then walk further while kappa < -sigma/2.
            let mut left = start;
            while left > 0 && kappa[left] >= 0.0 {
                left -= 1;
            }
            left = left.saturating_sub(1);
            while left > 0 && kappa[left] < -sigma / 2.0 {
                left -= 1;
            }

            let mut right = end;
            while right < n - 1 && kappa[right] >= 0.0 {
                right += 1;
            }
            right = (right + 1).min(n - 1);
            while right < n - 1 && kappa[right] < -sigma / 2.0 {
                right += 1;
            }

            let highest_y = y[start..=end].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            detections.push(Detection {
                center: channel[mid_idx],
                left: channel[left],
                right: channel[right],
                highest_y,
            });
        } else {
            i += 1;
        }
    }
    detections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::PolyCalibration;

    fn gaussian_spectrum(n: usize, center: f64, width: f64, amp: f64, bkg: f64) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let x = i as f64;
                let spread = (x - center) / width;
                bkg + amp * (-spread * spread).exp()
            })
            .collect()
    }

    #[test]
    fn flat_spectrum_yields_no_detections() {
        let channel: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let y = vec![10.0; 100];
        let detections = find_naive(&channel, &y, 4, 3.0);
        assert!(detections.is_empty());
    }

    #[test]
    fn single_gaussian_yields_one_detection_near_center() {
        let channel: Vec<f64> = (0..200).map(|i| i as f64).collect();
        let y = gaussian_spectrum(200, 100.0, 5.0, 1000.0, 10.0);
        let detections = find_naive(&channel, &y, 4, 3.0);
        assert_eq!(detections.len(), 1);
        assert!((detections[0].center - 100.0).abs() <= 1.0);
    }

    #[test]
    fn calibrated_finder_requires_valid_calibrations() {
        let channel: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let y = vec![1.0; 50];
        let invalid = PolyCalibration::new(vec![]);
        let valid = PolyCalibration::identity();
        let detections = find_calibrated(&channel, &y, &invalid, &valid, 3.0, 3.5);
        assert!(detections.is_empty());
    }
}
