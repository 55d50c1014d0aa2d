//! The peak model: a Gaussian plus optional short-tail, right-tail,
//! long-tail and step sub-components (§4.2).
//!
//! `spread = (x - position) / w`, `gaussian = A·exp(-spread²)`,
//! `tail(amp, s, side) = (A/2)·amp·exp(±spread/s)·erfc(1/(2s) ± spread)`,
//! `step(amp, side) = (A/2)·amp·erfc(±spread)`.
//! Left-side tails take `+spread`, right-side take `-spread`.

use crate::error::{PeakFitError, Result};
use crate::param::Param;
use crate::sum4::Sum4Area;

/// Numerically-stable complementary error function. `std` has no `erfc`, so
/// this ports the classical Abramowitz & Stegun 7.1.26 rational
/// approximation (max error ~1.5e-7), guarded against overflow for large
/// arguments the way the model's own exponentials are.
pub fn erfc(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    if x > 30.0 {
        return if sign > 0.0 { 0.0 } else { 2.0 };
    }
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736
                + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let erf = 1.0 - poly * (-x * x).exp();
    1.0 - sign * erf
}

/// A symmetric tail/step sub-component: amplitude (positive, relative to the
/// peak's own amplitude) and slope (bounded, `to_fit` gated).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tail {
    pub enabled: bool,
    pub override_flag: bool,
    pub amplitude: Param,
    pub slope: Param,
}

impl Tail {
    pub fn new(amplitude: f64, slope: f64, slope_min: f64, slope_max: f64) -> Self {
        Self {
            enabled: false,
            override_flag: false,
            amplitude: Param::positive(amplitude),
            slope: Param::bounded_sine(slope, slope_min, slope_max),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0.0, 1.0, 0.01, 100.0)
    }
}

/// A step sub-component: amplitude only.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Step {
    pub enabled: bool,
    pub override_flag: bool,
    pub amplitude: Param,
}

impl Step {
    pub fn new(amplitude: f64) -> Self {
        Self {
            enabled: false,
            override_flag: false,
            amplitude: Param::positive(amplitude),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0.0)
    }
}

/// A single peak: Gaussian core plus up to three tails and one step.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Peak {
    pub id: u64,
    pub position: Param,
    pub amplitude: Param,
    pub width: Param,
    pub width_override: bool,
    pub short_tail: Tail,
    pub right_tail: Tail,
    pub long_tail: Tail,
    pub step: Step,
    /// Cached SUM4 area over this peak's current sample range; recomputed by
    /// the region manager whenever the region's edges or fit results change.
    #[serde(skip)]
    pub sum4: Option<Sum4Area>,
}

/// Which proxy a value/gradient contribution came through, used by `Region`
/// to accumulate into the shared gradient vector at the right shared index.
pub struct PeakEval {
    pub value: f64,
    /// (param index-carrying proxy, d(value)/d(proxy_x)) pairs.
    pub grads: Vec<(i64, f64)>,
}

impl Peak {
    pub fn new(id: u64, position: f64, amplitude: f64, width: f64, lateral_slack: f64) -> Self {
        let half_span = width * lateral_slack;
        Self {
            id,
            position: Param::bounded_sine(position, position - half_span, position + half_span),
            amplitude: Param::positive(amplitude),
            width: Param::positive(width),
            width_override: false,
            short_tail: Tail::disabled(),
            right_tail: Tail::disabled(),
            long_tail: Tail::disabled(),
            step: Step::disabled(),
            sum4: None,
        }
    }

    /// Derive a stable id from the initial position, matching the "keyed by
    /// a stable id derived from its current position at insertion" rule.
    pub fn id_from_position(position: f64) -> u64 {
        (position * 1000.0).round() as i64 as u64
    }

    /// Evaluate the peak (plus enabled sub-components) at `x`, using
    /// whichever proxies are supplied via `v` for enrolled params and cached
    /// values otherwise. `default_width` is used when `width_override` is
    /// false (so several peaks share a single width index/value).
    pub fn eval_grad_at(&self, x: f64, v: &[f64], default_width: &Param) -> PeakEval {
        let pos_x = self.position.get_x(v);
        let pos_val = self.position.val_at(pos_x);
        let pos_grad = self.position.grad_at(pos_x);

        let amp_x = self.amplitude.get_x(v);
        let amp_val = self.amplitude.val_at(amp_x);
        let amp_grad = self.amplitude.grad_at(amp_x);

        let width_param = if self.width_override {
            &self.width
        } else {
            default_width
        };
        let w_x = width_param.get_x(v);
        let w_val = width_param.val_at(w_x).max(1e-9);
        let w_grad = width_param.grad_at(w_x);

        let dx = x - pos_val;
        let spread = dx / w_val;
        let gaussian = amp_val * (-spread * spread).exp();

        // d(gaussian)/d(pos) = gaussian * 2*spread/w ; chain through pos proxy.
        let d_gauss_d_pos = gaussian * 2.0 * spread / w_val * pos_grad;
        let d_gauss_d_amp = if amp_val.abs() > 0.0 {
            gaussian / amp_val * amp_grad
        } else {
            0.0
        };
        let d_gauss_d_w = gaussian * 2.0 * spread * spread / w_val * w_grad;

        let mut value = gaussian;
        let mut grads: Vec<(i64, f64)> = vec![
            (self.position.index, d_gauss_d_pos),
            (self.amplitude.index, d_gauss_d_amp),
            (width_param.index, d_gauss_d_w),
        ];

        let mut add_tail = |tail: &Tail, left_side: bool| {
            if !tail.enabled {
                return;
            }
            let ta_x = tail.amplitude.get_x(v);
            let ta_val = tail.amplitude.val_at(ta_x);
            let ta_grad = tail.amplitude.grad_at(ta_x);
            let ts_x = tail.slope.get_x(v);
            let ts_val = tail.slope.val_at(ts_x).max(1e-9);
            let ts_grad = tail.slope.grad_at(ts_x);

            let signed_spread = if left_side { spread } else { -spread };
            let erfc_arg = 1.0 / (2.0 * ts_val) + signed_spread;
            let exp_arg = signed_spread / ts_val;
            // Guard against overflow the same way the analytic model does:
            // large positive exp_arg combined with erfc underflow to 0 keeps
            // the product finite via `exp_arg.min(700.0)`.
            let exp_term = exp_arg.min(700.0).exp();
            let erfc_term = erfc(erfc_arg);
            let tail_val = 0.5 * amp_val * ta_val * exp_term * erfc_term;
            value += tail_val;

            // Partial w.r.t. amplitude (shared with gaussian's amp index).
            let d_tail_d_amp = if amp_val.abs() > 0.0 {
                tail_val / amp_val * amp_grad
            } else {
                0.0
            };
            // Partial w.r.t. tail amplitude.
            let d_tail_d_ta = if ta_val.abs() > 0.0 {
                tail_val / ta_val * ta_grad
            } else {
                0.0
            };
            // Partial w.r.t. position: d(signed_spread)/d(pos) = ∓1/w.
            let d_signed_spread_d_pos = if left_side { -1.0 / w_val } else { 1.0 / w_val };
            let d_exp_term_d_pos = exp_term * (1.0 / ts_val) * d_signed_spread_d_pos;
            let d_erfc_term_d_pos = -2.0 / std::f64::consts::PI.sqrt()
                * (-erfc_arg * erfc_arg).exp()
                * d_signed_spread_d_pos;
            let d_tail_d_pos = 0.5
                * amp_val
                * ta_val
                * (d_exp_term_d_pos * erfc_term + exp_term * d_erfc_term_d_pos)
                * pos_grad;

            // Partial w.r.t. width: d(signed_spread)/d(w) = ∓dx/w² = -signed_spread/w.
            let d_signed_spread_d_w = -signed_spread / w_val;
            let d_exp_term_d_w = exp_term * (1.0 / ts_val) * d_signed_spread_d_w;
            let d_erfc_term_d_w = -2.0 / std::f64::consts::PI.sqrt()
                * (-erfc_arg * erfc_arg).exp()
                * d_signed_spread_d_w;
            let d_tail_d_w = 0.5
                * amp_val
                * ta_val
                * (d_exp_term_d_w * erfc_term + exp_term * d_erfc_term_d_w)
                * w_grad;

            // Partial w.r.t. slope: exp_arg = signed_spread/s, erfc_arg = 1/(2s)+signed_spread.
            let d_exp_arg_d_s = -signed_spread / (ts_val * ts_val);
            let d_erfc_arg_d_s = -1.0 / (2.0 * ts_val * ts_val);
            let d_exp_term_d_s = exp_term * d_exp_arg_d_s;
            let d_erfc_term_d_s =
                -2.0 / std::f64::consts::PI.sqrt() * (-erfc_arg * erfc_arg).exp() * d_erfc_arg_d_s;
            let d_tail_d_s = 0.5
                * amp_val
                * ta_val
                * (d_exp_term_d_s * erfc_term + exp_term * d_erfc_term_d_s)
                * ts_grad;

            grads.push((self.position.index, d_tail_d_pos));
            grads.push((self.amplitude.index, d_tail_d_amp));
            grads.push((width_param.index, d_tail_d_w));
            grads.push((tail.amplitude.index, d_tail_d_ta));
            grads.push((tail.slope.index, d_tail_d_s));
        };

        add_tail(&self.short_tail, true);
        add_tail(&self.long_tail, true);
        add_tail(&self.right_tail, false);

        if self.step.enabled {
            let sa_x = self.step.amplitude.get_x(v);
            let sa_val = self.step.amplitude.val_at(sa_x);
            let sa_grad = self.step.amplitude.grad_at(sa_x);
            // Step always uses the left-side sign convention (+spread) per §4.2.
            let erfc_arg = spread;
            let erfc_term = erfc(erfc_arg);
            let step_val = 0.5 * amp_val * sa_val * erfc_term;
            value += step_val;

            let d_step_d_amp = if amp_val.abs() > 0.0 {
                step_val / amp_val * amp_grad
            } else {
                0.0
            };
            let d_step_d_sa = if sa_val.abs() > 0.0 {
                step_val / sa_val * sa_grad
            } else {
                0.0
            };
            let d_erfc_d_pos = -2.0 / std::f64::consts::PI.sqrt() * (-erfc_arg * erfc_arg).exp()
                * (-1.0 / w_val);
            let d_step_d_pos = 0.5 * amp_val * sa_val * d_erfc_d_pos * pos_grad;
            let d_erfc_d_w =
                -2.0 / std::f64::consts::PI.sqrt() * (-erfc_arg * erfc_arg).exp() * (-spread / w_val);
            let d_step_d_w = 0.5 * amp_val * sa_val * d_erfc_d_w * w_grad;

            grads.push((self.position.index, d_step_d_pos));
            grads.push((self.amplitude.index, d_step_d_amp));
            grads.push((width_param.index, d_step_d_w));
            grads.push((self.step.amplitude.index, d_step_d_sa));
        }

        PeakEval { value, grads }
    }

    /// Plain value evaluation, ignoring gradients (used by rendering/area).
    pub fn eval_at(&self, x: f64, v: &[f64], default_width: &Param) -> f64 {
        self.eval_grad_at(x, v, default_width).value
    }

    /// Analytic area: Gaussian integral plus first-order short/right-tail
    /// corrections, per §4.2. Long-tail and step contributions are left to
    /// numerical quadrature by the caller (see design notes' open question).
    pub fn analytic_area(&self, default_width: &Param) -> f64 {
        let amp = self.amplitude.val();
        let w = if self.width_override {
            self.width.val()
        } else {
            default_width.val()
        };
        let base = amp * w * std::f64::consts::PI.sqrt();
        let a_l = if self.short_tail.enabled {
            self.short_tail.amplitude.val()
        } else {
            0.0
        };
        let s_l = if self.short_tail.enabled {
            self.short_tail.slope.val()
        } else {
            0.0
        };
        let a_r = if self.right_tail.enabled {
            self.right_tail.amplitude.val()
        } else {
            0.0
        };
        let s_r = if self.right_tail.enabled {
            self.right_tail.slope.val()
        } else {
            0.0
        };
        base * (1.0 + a_l * w * s_l + a_r * w * s_r)
    }

    pub fn effective_width(&self, default_width: &Param) -> f64 {
        if self.width_override {
            self.width.val()
        } else {
            default_width.val()
        }
    }

    pub fn fwhm(&self, default_width: &Param) -> f64 {
        let w = if self.width_override {
            self.width.val()
        } else {
            default_width.val()
        };
        2.0 * w * std::f64::consts::LN_2.sqrt()
    }

    /// Force-disable all tails and step, per the small-peak simplification
    /// rule. Marks each sub-component as not overridden so region-level
    /// defaults can re-propagate later.
    pub fn simplify(&mut self) {
        self.short_tail.enabled = false;
        self.short_tail.override_flag = true;
        self.right_tail.enabled = false;
        self.right_tail.override_flag = true;
        self.long_tail.enabled = false;
        self.long_tail.override_flag = true;
        self.step.enabled = false;
        self.step.override_flag = true;
    }

    pub fn validate_within(&self, left: f64, right: f64) -> Result<()> {
        if self.position.min < left || self.position.max > right {
            return Err(PeakFitError::invalid_shape(format!(
                "peak {} position bounds [{},{}] exceed region span [{},{}]",
                self.id, self.position.min, self.position.max, left, right
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erfc_matches_known_values() {
        assert!((erfc(0.0) - 1.0).abs() < 1e-6);
        assert!(erfc(5.0) < 1e-10);
        assert!((erfc(-5.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn gaussian_only_peak_peaks_at_position() {
        let default_width = Param::positive(5.0);
        let peak = Peak::new(1, 100.0, 1000.0, 5.0, 3.0);
        let v = vec![];
        let at_peak = peak.eval_at(100.0, &v, &default_width);
        let off_peak = peak.eval_at(110.0, &v, &default_width);
        assert!(at_peak > off_peak);
        assert!((at_peak - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn gradient_matches_finite_difference_for_gaussian() {
        let default_width = Param::positive(5.0);
        let mut peak = Peak::new(1, 100.0, 1000.0, 5.0, 3.0);
        peak.position.index = 0;
        peak.amplitude.index = 1;
        let v = vec![peak.position.x, peak.amplitude.x];
        let x = 103.0;
        let eval = peak.eval_grad_at(x, &v, &default_width);
        let mut analytic_pos = 0.0;
        let mut analytic_amp = 0.0;
        for (idx, g) in &eval.grads {
            if *idx == 0 {
                analytic_pos += g;
            } else if *idx == 1 {
                analytic_amp += g;
            }
        }
        let h = 1e-6;
        let mut v_plus = v.clone();
        v_plus[0] += h;
        let mut v_minus = v.clone();
        v_minus[0] -= h;
        let fd_pos = (peak.eval_at(x, &v_plus, &default_width)
            - peak.eval_at(x, &v_minus, &default_width))
            / (2.0 * h);
        assert!((fd_pos - analytic_pos).abs() < 1e-2, "fd={fd_pos} an={analytic_pos}");

        let mut v_plus = v.clone();
        v_plus[1] += h;
        let mut v_minus = v.clone();
        v_minus[1] -= h;
        let fd_amp = (peak.eval_at(x, &v_plus, &default_width)
            - peak.eval_at(x, &v_minus, &default_width))
            / (2.0 * h);
        assert!((fd_amp - analytic_amp).abs() < 1e-2, "fd={fd_amp} an={analytic_amp}");
    }

    #[test]
    fn simplify_disables_all_subcomponents() {
        let mut peak = Peak::new(1, 100.0, 500.0, 5.0, 3.0);
        peak.short_tail.enabled = true;
        peak.step.enabled = true;
        peak.simplify();
        assert!(!peak.short_tail.enabled);
        assert!(!peak.right_tail.enabled);
        assert!(!peak.long_tail.enabled);
        assert!(!peak.step.enabled);
    }

    #[test]
    fn analytic_area_matches_plain_gaussian_integral_when_tails_disabled() {
        let default_width = Param::positive(5.0);
        let peak = Peak::new(1, 100.0, 1000.0, 5.0, 3.0);
        let expected = 1000.0 * 5.0 * std::f64::consts::PI.sqrt();
        assert!((peak.analytic_area(&default_width) - expected).abs() < 1e-6);
    }
}
