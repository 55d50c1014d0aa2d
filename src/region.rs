//! Region: owns a weighted-data subset, a background, a peak set and two
//! SUM4 edges; implements the objective-function contract fed to the
//! optimizer (§4.4).

use std::collections::BTreeMap;

use nalgebra::DVector;
use rand::Rng;

use crate::background::PolyBackground;
use crate::error::{PeakFitError, Result};
use crate::optimizer::Fittable;
use crate::param::INVALID_INDEX;
use crate::peak::Peak;
use crate::sum4::Sum4Edge;
use crate::weighted_data::WeightedData;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Region {
    pub data: WeightedData,
    pub background: PolyBackground,
    pub default_peak: Peak,
    pub peaks: BTreeMap<u64, Peak>,
    pub left_edge: Sum4Edge,
    pub right_edge: Sum4Edge,
    pub dirty: bool,
    #[serde(skip)]
    pub fit_vector_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SanityReport {
    pub sane: bool,
    pub reasons: &'static str,
}

impl Region {
    /// `create`: construct an initial region from a weighted-data slice,
    /// seeding LB/RB from the outermost `edge_samples` bins (§4.6).
    pub fn create(data: WeightedData, edge_samples: usize) -> Result<Self> {
        if data.is_empty() {
            return Err(PeakFitError::invalid_shape(
                "region requires non-empty data",
            ));
        }
        let left_edge = Sum4Edge::from_data(&data.left_prefix(edge_samples));
        let right_edge = Sum4Edge::from_data(&data.right_prefix(edge_samples));
        if !(left_edge.right < right_edge.left) {
            return Err(PeakFitError::invalid_shape(
                "left and right SUM4 edges must not overlap",
            ));
        }
        let x_offset = data.channel[0];
        let base_guess = left_edge.average.value;
        let scale = data.count.iter().cloned().fold(0.0_f64, f64::max);
        Ok(Self {
            background: PolyBackground::new(x_offset, base_guess, scale),
            default_peak: Peak::new(0, x_offset, 1.0, 1.0, 3.0),
            peaks: BTreeMap::new(),
            left_edge,
            right_edge,
            dirty: false,
            fit_vector_len: 0,
            data,
        })
    }

    pub fn left_channel(&self) -> f64 {
        self.data.channel[0]
    }

    pub fn right_channel(&self) -> f64 {
        *self.data.channel.last().unwrap()
    }

    /// `add peak`: insert a peak bounded to `[left,right]`, amplitude seeded
    /// from the hint.
    pub fn add_peak(&mut self, left: f64, right: f64, amplitude_hint: f64) -> Result<u64> {
        if left < self.left_channel() || right > self.right_channel() || left >= right {
            return Err(PeakFitError::invalid_shape(format!(
                "peak range [{left},{right}] outside region span [{},{}]",
                self.left_channel(),
                self.right_channel()
            )));
        }
        let position = (left + right) / 2.0;
        let width = self.default_peak.width.val().max(1.0);
        let id = Peak::id_from_position(position);
        let mut peak = Peak::new(id, position, amplitude_hint, width, 3.0);
        peak.position.min = left;
        peak.position.max = right;
        peak.short_tail.enabled = self.default_peak.short_tail.enabled;
        peak.right_tail.enabled = self.default_peak.right_tail.enabled;
        peak.long_tail.enabled = self.default_peak.long_tail.enabled;
        peak.step.enabled = self.default_peak.step.enabled;
        self.peaks.insert(id, peak);
        self.dirty = true;
        Ok(id)
    }

    pub fn replace_peak(&mut self, id: u64, peak: Peak) -> Result<()> {
        if !self.peaks.contains_key(&id) {
            return Err(PeakFitError::invalid_shape(format!(
                "no such peak id {id}"
            )));
        }
        self.peaks.insert(id, peak);
        self.dirty = true;
        Ok(())
    }

    pub fn remove_peaks(&mut self, ids: &[u64]) {
        for id in ids {
            self.peaks.remove(id);
        }
        self.dirty = true;
    }

    /// Deterministic index-assignment algorithm per §4.4.
    pub fn reindex(&mut self) {
        let mut counter: i64 = 0;
        let default_width_idx = if self.default_peak.width.to_fit {
            let idx = counter;
            counter += 1;
            idx
        } else {
            INVALID_INDEX
        };
        self.default_peak.width.index = default_width_idx;

        if self.background.base.to_fit {
            self.background.base.index = counter;
            counter += 1;
        } else {
            self.background.base.index = INVALID_INDEX;
        }
        if self.background.slope_enabled && self.background.slope.to_fit {
            self.background.slope.index = counter;
            counter += 1;
        } else {
            self.background.slope.index = INVALID_INDEX;
        }
        if self.background.curve_enabled && self.background.curve.to_fit {
            self.background.curve.index = counter;
            counter += 1;
        } else {
            self.background.curve.index = INVALID_INDEX;
        }

        for peak in self.peaks.values_mut() {
            if peak.position.to_fit {
                peak.position.index = counter;
                counter += 1;
            } else {
                peak.position.index = INVALID_INDEX;
            }
            if peak.amplitude.to_fit {
                peak.amplitude.index = counter;
                counter += 1;
            } else {
                peak.amplitude.index = INVALID_INDEX;
            }
            if peak.width_override {
                if peak.width.to_fit {
                    peak.width.index = counter;
                    counter += 1;
                } else {
                    peak.width.index = INVALID_INDEX;
                }
            } else {
                peak.width.index = default_width_idx;
            }

            for tail in [&mut peak.short_tail, &mut peak.long_tail, &mut peak.right_tail] {
                if !tail.enabled {
                    continue;
                }
                if tail.override_flag {
                    if tail.amplitude.to_fit {
                        tail.amplitude.index = counter;
                        counter += 1;
                    }
                    if tail.slope.to_fit {
                        tail.slope.index = counter;
                        counter += 1;
                    }
                } else {
                    tail.amplitude.index = INVALID_INDEX;
                    tail.slope.index = INVALID_INDEX;
                }
            }
            if peak.step.enabled {
                if peak.step.override_flag {
                    if peak.step.amplitude.to_fit {
                        peak.step.amplitude.index = counter;
                        counter += 1;
                    }
                } else {
                    peak.step.amplitude.index = INVALID_INDEX;
                }
            }
        }

        self.fit_vector_len = counter as usize;
        self.dirty = false;
    }

    pub fn eval_at(&self, x: f64, v: &[f64]) -> f64 {
        let (bg, _) = self.background.eval_grad_at(x, v);
        let mut total = bg;
        for peak in self.peaks.values() {
            total += peak.eval_grad_at(x, v, &self.default_peak.width).value;
        }
        total
    }

    pub fn eval(&self, x: f64) -> f64 {
        let v = self.variables_cached();
        self.eval_at(x, &v)
    }

    /// Current cached proxies in fit-vector order (ignoring live `v` — used
    /// when no optimizer pass is in flight).
    pub fn variables_cached(&self) -> Vec<f64> {
        let mut v = vec![0.0; self.fit_vector_len];
        self.default_peak.width.put(&mut v);
        self.background.base.put(&mut v);
        self.background.slope.put(&mut v);
        self.background.curve.put(&mut v);
        for peak in self.peaks.values() {
            peak.position.put(&mut v);
            peak.amplitude.put(&mut v);
            peak.width.put(&mut v);
            for tail in [&peak.short_tail, &peak.long_tail, &peak.right_tail] {
                tail.amplitude.put(&mut v);
                tail.slope.put(&mut v);
            }
            peak.step.amplitude.put(&mut v);
        }
        v
    }

    pub fn eval_grad_at(&self, x: f64, v: &[f64], g: &mut [f64]) -> f64 {
        let (bg, bg_grads) = self.background.eval_grad_at(x, v);
        let mut total = bg;
        for (idx, grad) in bg_grads {
            if idx >= 0 {
                g[idx as usize] += grad;
            }
        }
        for peak in self.peaks.values() {
            let eval = peak.eval_grad_at(x, v, &self.default_peak.width);
            total += eval.value;
            for (idx, grad) in eval.grads {
                if idx >= 0 {
                    g[idx as usize] += grad;
                }
            }
        }
        total
    }

    /// Sanity check (post-fit), per §4.4.
    pub fn sanity_check(&self, min_epsilon: f64, max_epsilon: f64, slope_epsilon: f64) -> SanityReport {
        let mut reasons: &'static str = "";
        let mut sane = true;

        let check_bounded = |p: &crate::param::Param, reasons: &mut &'static str, sane: &mut bool| {
            if !p.to_fit || p.index < 0 {
                return;
            }
            match p.kind {
                crate::param::ParamKind::BoundedSine | crate::param::ParamKind::BoundedAtan => {
                    let v = p.val();
                    let span = p.max - p.min;
                    if span <= 0.0 {
                        return;
                    }
                    let frac = (v - p.min) / span;
                    if frac < min_epsilon || frac > 1.0 - max_epsilon {
                        *sane = false;
                        *reasons = "bounded parameter near bound";
                    }
                }
                _ => {}
            }
        };

        check_bounded(&self.background.base, &mut reasons, &mut sane);
        check_bounded(&self.background.slope, &mut reasons, &mut sane);
        check_bounded(&self.background.curve, &mut reasons, &mut sane);

        for peak in self.peaks.values() {
            check_bounded(&peak.position, &mut reasons, &mut sane);
            for tail in [&peak.short_tail, &peak.long_tail, &peak.right_tail] {
                if tail.enabled {
                    let span = tail.slope.max - tail.slope.min;
                    if span > 0.0 {
                        let frac = (tail.slope.val() - tail.slope.min) / span;
                        if frac < slope_epsilon || frac > 1.0 - slope_epsilon {
                            sane = false;
                            reasons = "tail slope at bound";
                        }
                    }
                    if !tail.amplitude.val().is_finite() || tail.amplitude.val() <= 0.0 {
                        sane = false;
                        reasons = "tail amplitude non-finite or non-positive";
                    }
                }
            }
            if !peak.amplitude.val().is_finite() || peak.amplitude.val() <= 0.0 {
                sane = false;
                reasons = "peak amplitude non-finite or non-positive";
            }
            let w = if peak.width_override {
                peak.width.val()
            } else {
                self.default_peak.width.val()
            };
            if !w.is_finite() || w <= 0.0 {
                sane = false;
                reasons = "peak width non-finite or non-positive";
            }
        }

        SanityReport { sane, reasons }
    }

    pub fn perturb_all(&mut self, rng: &mut impl Rng) {
        self.default_peak.width.perturb(rng);
        self.background.base.perturb(rng);
        self.background.slope.perturb(rng);
        self.background.curve.perturb(rng);
        for peak in self.peaks.values_mut() {
            peak.position.perturb(rng);
            peak.amplitude.perturb(rng);
            peak.width.perturb(rng);
            for tail in [&mut peak.short_tail, &mut peak.long_tail, &mut peak.right_tail] {
                tail.amplitude.perturb(rng);
                tail.slope.perturb(rng);
            }
            peak.step.amplitude.perturb(rng);
        }
    }

    pub fn degrees_of_freedom(&self) -> usize {
        self.data.len().saturating_sub(self.fit_vector_len)
    }

    pub fn chi_sq_norm(&self) -> f64 {
        let dof = self.degrees_of_freedom().max(1) as f64;
        self.chi_sq_value() / dof
    }

    fn chi_sq_value(&self) -> f64 {
        let v = self.variables_cached();
        let mut total = 0.0;
        for i in 0..self.data.len() {
            let x = self.data.channel[i];
            let y = self.data.count[i];
            let sigma = self.data.weight[i].max(1e-9);
            let f = self.eval_at(x, &v);
            total += ((y - f) / sigma).powi(2);
        }
        total
    }

    /// Write proxies back from a fit vector into every enrolled parameter.
    pub fn write_back(&mut self, v: &[f64]) {
        self.default_peak.width.get(v);
        self.background.base.get(v);
        self.background.slope.get(v);
        self.background.curve.get(v);
        for peak in self.peaks.values_mut() {
            peak.position.get(v);
            peak.amplitude.get(v);
            peak.width.get(v);
            for tail in [&mut peak.short_tail, &mut peak.long_tail, &mut peak.right_tail] {
                tail.amplitude.get(v);
                tail.slope.get(v);
            }
            peak.step.amplitude.get(v);
        }
    }

    /// Write per-parameter uncertainties from the optimizer's inverse
    /// Hessian diagonal (§4.1).
    pub fn write_uncertainties(&mut self, inv_hessian_diag: &[f64], chi_sq_norm: f64) {
        self.default_peak.width.get_uncert(inv_hessian_diag, chi_sq_norm);
        self.background.base.get_uncert(inv_hessian_diag, chi_sq_norm);
        self.background.slope.get_uncert(inv_hessian_diag, chi_sq_norm);
        self.background.curve.get_uncert(inv_hessian_diag, chi_sq_norm);
        for peak in self.peaks.values_mut() {
            peak.position.get_uncert(inv_hessian_diag, chi_sq_norm);
            peak.amplitude.get_uncert(inv_hessian_diag, chi_sq_norm);
            peak.width.get_uncert(inv_hessian_diag, chi_sq_norm);
            for tail in [&mut peak.short_tail, &mut peak.long_tail, &mut peak.right_tail] {
                tail.amplitude.get_uncert(inv_hessian_diag, chi_sq_norm);
                tail.slope.get_uncert(inv_hessian_diag, chi_sq_norm);
            }
            peak.step.amplitude.get_uncert(inv_hessian_diag, chi_sq_norm);
        }
    }

    /// Self-describing tree form required at the external boundary (§6):
    /// one top-level `type` key identifying the component variant.
    pub fn to_tagged_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).expect("region always serializes");
        value["type"] = serde_json::json!("region");
        value
    }

    pub fn from_tagged_json(value: &serde_json::Value) -> Result<Self> {
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| PeakFitError::invalid_shape("region missing `type`"))?;
        if tag != "region" {
            return Err(PeakFitError::serialization("region", tag));
        }
        let mut body = value.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.remove("type");
        }
        serde_json::from_value(body)
            .map_err(|e| PeakFitError::invalid_shape(format!("region deserialize: {e}")))
    }
}

impl Fittable for Region {
    fn variables(&self) -> DVector<f64> {
        DVector::from_vec(self.variables_cached())
    }

    fn chi_sq(&self, v: &DVector<f64>) -> f64 {
        let v: Vec<f64> = v.iter().cloned().collect();
        let mut total = 0.0;
        for i in 0..self.data.len() {
            let x = self.data.channel[i];
            let y = self.data.count[i];
            let sigma = self.data.weight[i].max(1e-9);
            let f = self.eval_at(x, &v);
            total += ((y - f) / sigma).powi(2);
        }
        total
    }

    fn chi_sq_gradient(&self, v: &DVector<f64>, g: &mut DVector<f64>) -> f64 {
        let v: Vec<f64> = v.iter().cloned().collect();
        let mut grad_buf = vec![0.0; self.fit_vector_len];
        let mut total = 0.0;
        for i in 0..self.data.len() {
            let x = self.data.channel[i];
            let y = self.data.count[i];
            let sigma = self.data.weight[i].max(1e-9);
            let mut point_grad = vec![0.0; self.fit_vector_len];
            let f = self.eval_grad_at(x, &v, &mut point_grad);
            let resid = y - f;
            total += (resid / sigma).powi(2);
            let factor = -2.0 * resid / (sigma * sigma);
            for k in 0..self.fit_vector_len {
                grad_buf[k] += factor * point_grad[k];
            }
        }
        for (k, val) in grad_buf.into_iter().enumerate() {
            g[k] = val;
        }
        total
    }

    fn perturb(&mut self, rng: &mut dyn rand::RngCore) -> bool {
        if self.fit_vector_len == 0 {
            return false;
        }
        struct Adapter<'a>(&'a mut dyn rand::RngCore);
        impl<'a> rand::RngCore for Adapter<'a> {
            fn next_u32(&mut self) -> u32 {
                self.0.next_u32()
            }
            fn next_u64(&mut self) -> u64 {
                self.0.next_u64()
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                self.0.fill_bytes(dest)
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
                self.0.try_fill_bytes(dest)
            }
        }
        let mut adapter = Adapter(rng);
        self.perturb_all(&mut adapter);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn flat_region(n: usize, base: f64) -> Region {
        let channel: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let count = vec![base; n];
        let weight = vec![1.0; n];
        let data = WeightedData::new(channel, count, weight).unwrap();
        Region::create(data, 5).unwrap()
    }

    #[test]
    fn create_rejects_overlapping_edges() {
        let channel: Vec<f64> = (0..4).map(|i| i as f64).collect();
        let data = WeightedData::new(channel, vec![1.0; 4], vec![1.0; 4]).unwrap();
        assert!(Region::create(data, 5).is_err());
    }

    #[test]
    fn add_peak_rejects_range_outside_span() {
        let mut region = flat_region(50, 10.0);
        assert!(region.add_peak(-5.0, 10.0, 100.0).is_err());
    }

    #[test]
    fn reindex_assigns_unique_indices() {
        let mut region = flat_region(50, 10.0);
        region.add_peak(20.0, 30.0, 500.0).unwrap();
        region.add_peak(21.0, 31.0, 300.0).unwrap();
        region.reindex();
        let mut seen = std::collections::HashSet::new();
        for peak in region.peaks.values() {
            assert!(seen.insert(peak.position.index));
            assert!(seen.insert(peak.amplitude.index));
        }
    }

    #[test]
    fn width_not_overridden_shares_default_index() {
        let mut region = flat_region(50, 10.0);
        region.add_peak(20.0, 30.0, 500.0).unwrap();
        region.default_peak.width.to_fit = true;
        region.reindex();
        for peak in region.peaks.values() {
            assert_eq!(peak.width.index, region.default_peak.width.index);
        }
    }

    #[test]
    fn gradient_matches_finite_difference_at_random_point() {
        let mut region = flat_region(60, 10.0);
        region.add_peak(25.0, 35.0, 200.0).unwrap();
        region.reindex();
        let v0 = region.variables();
        let n = v0.len();
        let mut g = DVector::zeros(n);
        region.chi_sq_gradient(&v0, &mut g);
        let h = 1e-5;
        for k in 0..n {
            let mut vp = v0.clone();
            vp[k] += h;
            let mut vm = v0.clone();
            vm[k] -= h;
            let fd = (region.chi_sq(&vp) - region.chi_sq(&vm)) / (2.0 * h);
            assert!((fd - g[k]).abs() < 1e-1, "k={k} fd={fd} g={}", g[k]);
        }
    }

    #[test]
    fn degrees_of_freedom_is_nonnegative_and_bounded() {
        let mut region = flat_region(10, 5.0);
        region.add_peak(4.0, 6.0, 10.0).unwrap();
        region.reindex();
        assert!(region.degrees_of_freedom() <= region.data.len());
    }

    #[test]
    fn sanity_check_rejects_background_base_near_its_bound() {
        let mut region = flat_region(30, 10.0);
        region.reindex();
        let span = region.background.base.max - region.background.base.min;
        region.background.base.set_val(region.background.base.min + span * 1e-6);
        let report = region.sanity_check(1e-4, 1e-4, 1e-3);
        assert!(!report.sane);
    }

    #[test]
    fn region_serialization_roundtrips_exactly() {
        let mut region = flat_region(30, 5.0);
        region.add_peak(10.0, 20.0, 100.0).unwrap();
        region.reindex();
        let json = region.to_tagged_json();
        assert_eq!(json["type"], "region");
        let restored = Region::from_tagged_json(&json).unwrap();
        let rejson = restored.to_tagged_json();
        assert_eq!(json, rejson);
    }

    #[test]
    fn region_deserialization_rejects_wrong_type_tag() {
        let region = flat_region(10, 1.0);
        let mut json = region.to_tagged_json();
        json["type"] = serde_json::json!("peak");
        assert!(Region::from_tagged_json(&json).is_err());
    }
}
