//! Polynomial background: base, slope (optional) and curvature (optional)
//! around the region's left channel (§4.3).

use crate::param::Param;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PolyBackground {
    pub x_offset: f64,
    pub base: Param,
    pub slope: Param,
    pub curve: Param,
    pub slope_enabled: bool,
    pub curve_enabled: bool,
}

impl PolyBackground {
    /// `scale` is a representative count magnitude from the region's data
    /// (e.g. the largest observed count), used to bound the slope/curvature
    /// coefficients and the upper end of the base coefficient.
    pub fn new(x_offset: f64, base: f64, scale: f64) -> Self {
        let scale = scale.abs().max(base.abs()).max(1.0);
        Self {
            x_offset,
            base: Param::bounded_sine(base, 0.0, 2.0 * scale),
            slope: Param::bounded_sine(0.0, -scale, scale),
            curve: Param::bounded_sine(0.0, -scale, scale),
            slope_enabled: false,
            curve_enabled: false,
        }
    }

    pub fn eval_at(&self, x: f64, v: &[f64]) -> f64 {
        let dx = x - self.x_offset;
        let base = self.base.val_at(self.base.get_x(v));
        let mut value = base;
        if self.slope_enabled {
            value += self.slope.val_at(self.slope.get_x(v)) * dx;
        }
        if self.curve_enabled {
            value += self.curve.val_at(self.curve.get_x(v)) * dx * dx;
        }
        value
    }

    /// Returns `(value, [(index, d(value)/d(proxy))...])`.
    pub fn eval_grad_at(&self, x: f64, v: &[f64]) -> (f64, Vec<(i64, f64)>) {
        let dx = x - self.x_offset;
        let base_x = self.base.get_x(v);
        let mut value = self.base.val_at(base_x);
        let mut grads = vec![(self.base.index, self.base.grad_at(base_x))];
        if self.slope_enabled {
            let sx = self.slope.get_x(v);
            value += self.slope.val_at(sx) * dx;
            grads.push((self.slope.index, self.slope.grad_at(sx) * dx));
        }
        if self.curve_enabled {
            let cx = self.curve.get_x(v);
            value += self.curve.val_at(cx) * dx * dx;
            grads.push((self.curve.index, self.curve.grad_at(cx) * dx * dx));
        }
        (value, grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_background_evaluates_to_base_everywhere() {
        let bg = PolyBackground::new(10.0, 42.0, 100.0);
        let v = vec![];
        assert!((bg.eval_at(10.0, &v) - 42.0).abs() < 1e-9);
        assert!((bg.eval_at(50.0, &v) - 42.0).abs() < 1e-9);
    }

    #[test]
    fn slope_enabled_adds_linear_term() {
        let mut bg = PolyBackground::new(0.0, 10.0, 100.0);
        bg.slope_enabled = true;
        bg.slope.set_val(2.0);
        let v = vec![];
        assert!((bg.eval_at(5.0, &v) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn base_is_bounded_and_clamps_outside_scale() {
        let mut bg = PolyBackground::new(0.0, 10.0, 50.0);
        bg.base.set_val(1_000_000.0);
        assert!((bg.base.val() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let mut bg = PolyBackground::new(0.0, 10.0, 100.0);
        bg.slope_enabled = true;
        bg.curve_enabled = true;
        bg.base.index = 0;
        bg.slope.index = 1;
        bg.curve.index = 2;
        bg.slope.set_val(1.5);
        bg.curve.set_val(0.1);
        let v = vec![bg.base.x, bg.slope.x, bg.curve.x];
        let x = 7.0;
        let (_, grads) = bg.eval_grad_at(x, &v);
        let h = 1e-6;
        for (idx, analytic) in grads {
            let i = idx as usize;
            let mut vp = v.clone();
            vp[i] += h;
            let mut vm = v.clone();
            vm[i] -= h;
            let fd = (bg.eval_at(x, &vp) - bg.eval_at(x, &vm)) / (2.0 * h);
            assert!((fd - analytic).abs() < 1e-4);
        }
    }
}
