//! The fittable parameter abstraction: the bounded/positive/unbounded proxy
//! transform that lets an unconstrained optimizer respect box constraints.
//!
//! An optimizer only ever sees unconstrained real numbers. Every physical
//! quantity in the engine (a peak position, an amplitude, a tail slope, a
//! background coefficient…) is wrapped in a `Param`, which owns an
//! unconstrained proxy `x` and a transform telling it how to turn `x` into a
//! bounded or positive nominal value. The chain rule for every model
//! derivative passes through exactly one place: `Param::grad_at`.

use std::f64::consts::{FRAC_PI_2, PI};

/// Sentinel fit-vector index meaning "not enrolled".
pub const INVALID_INDEX: i64 = -1;

/// The four parameter kinds sharing one capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ParamKind {
    /// `val_at(x) = x`.
    Unbounded,
    /// `val_at(x) = x²`; always non-negative.
    Positive,
    /// `val_at(x) = (1 + sin(x))·(max-min)/2 + min`.
    BoundedSine,
    /// `val_at(x) = ((π/2 + atan(slope·x))/π)·(max-min) + min`.
    BoundedAtan,
}

/// A scalar fittable parameter.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Param {
    pub kind: ParamKind,
    /// Unconstrained proxy seen by the optimizer.
    pub x: f64,
    pub to_fit: bool,
    /// Uncertainty on the nominal value; NaN until a fit writes it back.
    pub uncert: f64,
    /// Fit-vector index, or `INVALID_INDEX` if not enrolled.
    pub index: i64,
    pub min: f64,
    pub max: f64,
    /// Steepness tuning for the atan-bounded transform.
    pub slope: f64,
}

impl Param {
    pub fn unbounded(value: f64) -> Self {
        let mut p = Self::new(ParamKind::Unbounded, f64::NEG_INFINITY, f64::INFINITY);
        p.set_val(value);
        p
    }

    pub fn positive(value: f64) -> Self {
        let mut p = Self::new(ParamKind::Positive, 0.0, f64::INFINITY);
        p.set_val(value);
        p
    }

    pub fn bounded_sine(value: f64, min: f64, max: f64) -> Self {
        let mut p = Self::new(ParamKind::BoundedSine, min, max);
        p.set_val(value);
        p
    }

    pub fn bounded_atan(value: f64, min: f64, max: f64, slope: f64) -> Self {
        let mut p = Self::new(ParamKind::BoundedAtan, min, max);
        p.slope = slope;
        p.set_val(value);
        p
    }

    fn new(kind: ParamKind, min: f64, max: f64) -> Self {
        Self {
            kind,
            x: 0.0,
            to_fit: true,
            uncert: f64::NAN,
            index: INVALID_INDEX,
            min,
            max,
            slope: 1.0,
        }
    }

    /// Forward transform: proxy -> nominal value.
    pub fn val_at(&self, x: f64) -> f64 {
        match self.kind {
            ParamKind::Unbounded => x,
            ParamKind::Positive => x * x,
            ParamKind::BoundedSine => (1.0 + x.sin()) * (self.max - self.min) / 2.0 + self.min,
            ParamKind::BoundedAtan => {
                ((FRAC_PI_2 + (self.slope * x).atan()) / PI) * (self.max - self.min) + self.min
            }
        }
    }

    /// Analytic derivative of `val_at` w.r.t. the proxy.
    pub fn grad_at(&self, x: f64) -> f64 {
        match self.kind {
            ParamKind::Unbounded => 1.0,
            ParamKind::Positive => 2.0 * x,
            ParamKind::BoundedSine => x.cos() * (self.max - self.min) / 2.0,
            ParamKind::BoundedAtan => {
                let denom = 1.0 + (self.slope * x).powi(2);
                (self.slope / (PI * denom)) * (self.max - self.min)
            }
        }
    }

    /// Current nominal value (reads the cached proxy).
    pub fn val(&self) -> f64 {
        self.val_at(self.x)
    }

    /// Current chain-rule gradient factor (reads the cached proxy).
    pub fn grad(&self) -> f64 {
        self.grad_at(self.x)
    }

    /// Set a new nominal value, inverting the transform to find the proxy.
    /// Out-of-bounds values clamp to the matching extremum.
    pub fn set_val(&mut self, new_val: f64) {
        self.x = match self.kind {
            ParamKind::Unbounded => new_val,
            ParamKind::Positive => new_val.max(0.0).sqrt(),
            ParamKind::BoundedSine => {
                let clamped = new_val.clamp(self.min, self.max);
                let t = if (self.max - self.min).abs() < f64::EPSILON {
                    0.0
                } else {
                    2.0 * (clamped - self.min) / (self.max - self.min) - 1.0
                };
                // asin(±1) is exact; clamp to avoid NaN from fp overshoot.
                t.clamp(-1.0, 1.0).asin()
            }
            ParamKind::BoundedAtan => {
                let clamped = new_val.clamp(self.min, self.max);
                let t = if (self.max - self.min).abs() < f64::EPSILON {
                    0.0
                } else {
                    (clamped - self.min) / (self.max - self.min)
                };
                let arg = (t * PI - FRAC_PI_2).tan();
                if self.slope.abs() < f64::EPSILON {
                    0.0
                } else {
                    arg / self.slope
                }
            }
        };
    }

    /// Write the proxy into a dense fit vector at this parameter's index, if enrolled.
    pub fn put(&self, v: &mut [f64]) {
        if self.to_fit && self.index >= 0 {
            v[self.index as usize] = self.x;
        }
    }

    /// Read the proxy back from a dense fit vector, if enrolled.
    pub fn get(&mut self, v: &[f64]) {
        if self.to_fit && self.index >= 0 {
            self.x = v[self.index as usize];
        }
    }

    /// Proxy value for evaluation purposes: enrolled params read `v`, others
    /// use the cached proxy.
    pub fn get_x(&self, v: &[f64]) -> f64 {
        if self.to_fit && self.index >= 0 {
            v[self.index as usize]
        } else {
            self.x
        }
    }

    /// Uncertainty derived from a Hessian diagonal entry, per §4.1.
    pub fn get_uncert(&mut self, inv_hessian_diag: &[f64], chi_sq_norm: f64) {
        if self.to_fit && self.index >= 0 {
            let diag = inv_hessian_diag[self.index as usize];
            let g = self.grad_at(self.x);
            self.uncert = (diag.abs() * g * g * chi_sq_norm).sqrt();
        }
    }

    /// Reset the proxy to a uniform random point in the sine-bounded domain
    /// `[-π/2, π/2]`, per the region's perturbation contract (§4.4).
    pub fn perturb(&mut self, rng: &mut impl rand::Rng) {
        if self.to_fit {
            self.x = rng.gen_range(-FRAC_PI_2..=FRAC_PI_2);
        }
    }

    fn type_tag(&self) -> &'static str {
        match self.kind {
            ParamKind::Unbounded => "unbounded",
            ParamKind::Positive => "positive",
            ParamKind::BoundedSine => "bounded_sine",
            ParamKind::BoundedAtan => "bounded_atan",
        }
    }

    /// The self-describing tree shape required at the external boundary
    /// (§6): `{type, x, to_fit, uncert, min?, max?}`.
    pub fn to_tagged_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "type": self.type_tag(),
            "x": self.x,
            "to_fit": self.to_fit,
            "uncert": self.uncert,
        });
        if matches!(self.kind, ParamKind::BoundedSine | ParamKind::BoundedAtan) {
            obj["min"] = serde_json::json!(self.min);
            obj["max"] = serde_json::json!(self.max);
            if matches!(self.kind, ParamKind::BoundedAtan) {
                obj["slope"] = serde_json::json!(self.slope);
            }
        }
        obj
    }

    pub fn from_tagged_json(value: &serde_json::Value) -> crate::error::Result<Self> {
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| crate::error::PeakFitError::invalid_shape("param missing `type`"))?;
        let kind = match tag {
            "unbounded" => ParamKind::Unbounded,
            "positive" => ParamKind::Positive,
            "bounded_sine" => ParamKind::BoundedSine,
            "bounded_atan" => ParamKind::BoundedAtan,
            other => {
                return Err(crate::error::PeakFitError::serialization(
                    "unbounded|positive|bounded_sine|bounded_atan",
                    other,
                ))
            }
        };
        let get_f64 = |key: &str, default: f64| {
            value.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
        };
        Ok(Self {
            kind,
            x: get_f64("x", 0.0),
            to_fit: value.get("to_fit").and_then(|v| v.as_bool()).unwrap_or(true),
            uncert: get_f64("uncert", f64::NAN),
            index: INVALID_INDEX,
            min: get_f64("min", f64::NEG_INFINITY),
            max: get_f64("max", f64::INFINITY),
            slope: get_f64("slope", 1.0),
        })
    }
}
