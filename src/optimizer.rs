//! The optimizer interface (§4.7): one pure operation, `minimize`, plus a
//! reference BFGS-with-Brent-line-search backend.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};

/// What a region (or any objective) must supply to be minimized.
pub trait Fittable {
    fn variables(&self) -> DVector<f64>;
    fn chi_sq(&self, v: &DVector<f64>) -> f64;
    fn chi_sq_gradient(&self, v: &DVector<f64>, g: &mut DVector<f64>) -> f64;
    /// Reset proxies to a random perturbation point; `false` if the fittable
    /// has no enrolled parameters to perturb.
    fn perturb(&mut self, rng: &mut dyn rand::RngCore) -> bool {
        let _ = rng;
        false
    }
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub variables: DVector<f64>,
    pub inv_hessian: DMatrix<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Shared, thread-visible cancellation flag (§5: "the only shared mutable
/// state is the optimizer's cancel flag").
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait Optimizer {
    fn minimize(&self, fittable: &dyn Fittable, cancel: &CancelFlag) -> FitResult;
}

/// A Broyden-Fletcher-Goldfarb-Shanno minimizer with Brent-with-bracketing
/// line search, matching the reference backend described in §4.7.
pub struct Bfgs {
    pub max_iterations: usize,
    pub gradient_tol: f64,
    pub objective_tol: f64,
}

impl Default for Bfgs {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            gradient_tol: 1e-6,
            objective_tol: 1e-10,
        }
    }
}

impl Optimizer for Bfgs {
    fn minimize(&self, fittable: &dyn Fittable, cancel: &CancelFlag) -> FitResult {
        let x0 = fittable.variables();
        let n = x0.len();
        if n == 0 {
            return FitResult {
                variables: x0,
                inv_hessian: DMatrix::zeros(0, 0),
                iterations: 0,
                converged: true,
            };
        }

        let mut x = x0;
        let mut h = DMatrix::identity(n, n);
        let mut g = DVector::zeros(n);
        let mut f = fittable.chi_sq_gradient(&x, &mut g);
        let mut converged = false;
        let mut iterations = 0;

        for iter in 0..self.max_iterations {
            iterations = iter + 1;
            if cancel.is_set() {
                break;
            }
            if g.norm() < self.gradient_tol {
                converged = true;
                break;
            }
            let direction = -&h * &g;
            let (step, f_new) = brent_line_search(fittable, &x, &direction, f);

            let x_new = &x + &direction * step;
            let mut g_new = DVector::zeros(n);
            let f_check = fittable.chi_sq_gradient(&x_new, &mut g_new);

            let s = &x_new - &x;
            let y = &g_new - &g;
            let sy = s.dot(&y);
            if sy.abs() > 1e-12 {
                // Standard BFGS inverse-Hessian update.
                let rho = 1.0 / sy;
                let i = DMatrix::<f64>::identity(n, n);
                let sy_t = &s * y.transpose();
                let ys_t = &y * s.transpose();
                let ss_t = &s * s.transpose();
                h = (&i - &sy_t * rho) * &h * (&i - &ys_t * rho) + &ss_t * rho;
            }

            if (f - f_check).abs() < self.objective_tol {
                x = x_new;
                f = f_check;
                converged = true;
                break;
            }

            x = x_new;
            g = g_new;
            f = f_new.min(f_check);
        }

        FitResult {
            variables: x,
            inv_hessian: h,
            iterations,
            converged,
        }
    }
}

/// Golden-ratio bracketing followed by Brent's derivative-free method,
/// restricted to the 1-D line `x + t*direction`.
fn brent_line_search(
    fittable: &dyn Fittable,
    x: &DVector<f64>,
    direction: &DVector<f64>,
    f0: f64,
) -> (f64, f64) {
    let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
    let eval = |t: f64| -> f64 {
        let candidate = x + direction * t;
        fittable.chi_sq(&candidate)
    };

    // Bracket [a, c] containing a minimum, starting from t=0.
    let mut a = 0.0_f64;
    let mut b = 1e-4_f64;
    let mut fa = f0;
    let mut fb = eval(b);
    if fb > fa {
        b = -b;
        fb = eval(b);
    }
    let mut c = b + (b - a) * phi;
    let mut fc = eval(c);
    let mut steps = 0;
    while fc < fb && steps < 100 {
        a = b;
        fa = fb;
        b = c;
        fb = fc;
        c = b + (b - a) * phi;
        fc = eval(c);
        steps += 1;
    }
    if a > c {
        std::mem::swap(&mut a, &mut c);
        std::mem::swap(&mut fa, &mut fc);
    }

    // Brent's method within [a, c].
    let tol = 1e-8;
    let mut x_min = b;
    let mut f_min = fb;
    let mut w = b;
    let mut fw = fb;
    let mut v = b;
    let mut fv = fb;
    let mut lo = a.min(c);
    let mut hi = a.max(c);
    let mut d = 0.0;
    let mut e = 0.0_f64;

    for _ in 0..100 {
        let m = 0.5 * (lo + hi);
        let tol1 = tol * x_min.abs() + 1e-12;
        let tol2 = 2.0 * tol1;
        if (x_min - m).abs() <= tol2 - 0.5 * (hi - lo) {
            break;
        }
        let mut use_golden = true;
        if e.abs() > tol1 {
            let r = (x_min - w) * (f_min - fv);
            let mut q = (x_min - v) * (f_min - fw);
            let mut p = (x_min - v) * q - (x_min - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            let q = q.abs();
            let etemp = e;
            e = d;
            if p.abs() < (0.5 * q * etemp).abs() && p > q * (lo - x_min) && p < q * (hi - x_min) {
                d = p / q;
                let u = x_min + d;
                if u - lo < tol2 || hi - u < tol2 {
                    d = if m >= x_min { tol1 } else { -tol1 };
                }
                use_golden = false;
            }
        }
        if use_golden {
            e = if x_min >= m { lo - x_min } else { hi - x_min };
            d = (2.0 - 1.0 / phi) * e;
        }
        let u = if d.abs() >= tol1 {
            x_min + d
        } else {
            x_min + if d > 0.0 { tol1 } else { -tol1 }
        };
        let fu = eval(u);
        if fu <= f_min {
            if u >= x_min {
                lo = x_min;
            } else {
                hi = x_min;
            }
            v = w;
            fv = fw;
            w = x_min;
            fw = f_min;
            x_min = u;
            f_min = fu;
        } else {
            if u < x_min {
                lo = u;
            } else {
                hi = u;
            }
            if fu <= fw || (w - x_min).abs() < f64::EPSILON {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || (v - x_min).abs() < f64::EPSILON || (v - w).abs() < f64::EPSILON
            {
                v = u;
                fv = fu;
            }
        }
    }

    (x_min, f_min)
}

/// Convenience: perturb-and-refit loop used after a sanity-check rejection
/// (§4.4). Tries up to `attempts` random restarts, returning the first
/// sane+converged result, or the last attempt's result if none qualify.
pub fn perturb_and_refit(
    fittable: &mut dyn Fittable,
    optimizer: &dyn Optimizer,
    cancel: &CancelFlag,
    rng: &mut impl Rng,
    attempts: usize,
    is_sane: impl Fn(&FitResult) -> bool,
) -> FitResult {
    let mut last = optimizer.minimize(fittable, cancel);
    for _ in 0..attempts {
        if is_sane(&last) || cancel.is_set() {
            break;
        }
        if !fittable.perturb(rng) {
            break;
        }
        last = optimizer.minimize(fittable, cancel);
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic {
        target: DVector<f64>,
    }

    impl Fittable for Quadratic {
        fn variables(&self) -> DVector<f64> {
            DVector::zeros(self.target.len())
        }

        fn chi_sq(&self, v: &DVector<f64>) -> f64 {
            (v - &self.target).norm_squared()
        }

        fn chi_sq_gradient(&self, v: &DVector<f64>, g: &mut DVector<f64>) -> f64 {
            let diff = v - &self.target;
            g.copy_from(&(2.0 * &diff));
            diff.norm_squared()
        }
    }

    #[test]
    fn bfgs_minimizes_simple_quadratic() {
        let fittable = Quadratic {
            target: DVector::from_vec(vec![3.0, -2.0]),
        };
        let cancel = CancelFlag::new();
        let bfgs = Bfgs::default();
        let result = bfgs.minimize(&fittable, &cancel);
        assert!(result.converged);
        assert!((result.variables[0] - 3.0).abs() < 1e-3);
        assert!((result.variables[1] + 2.0).abs() < 1e-3);
    }

    #[test]
    fn zero_dimensional_fittable_converges_trivially() {
        let fittable = Quadratic {
            target: DVector::from_vec(vec![]),
        };
        let cancel = CancelFlag::new();
        let bfgs = Bfgs::default();
        let result = bfgs.minimize(&fittable, &cancel);
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn cancel_flag_stops_iteration_early() {
        let fittable = Quadratic {
            target: DVector::from_vec(vec![100.0, 100.0]),
        };
        let cancel = CancelFlag::new();
        cancel.set();
        let bfgs = Bfgs::default();
        let result = bfgs.minimize(&fittable, &cancel);
        assert_eq!(result.iterations, 1);
    }
}
