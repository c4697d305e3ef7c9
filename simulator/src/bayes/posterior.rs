//! Marginal posterior of a mixed model with the lab effects integrated out
//!
//! Unconstrained parameter layout:
//! `[b_Intercept, (b_condition), log_sigma, log_sd_Intercept, (log_sd_condition, atanh_cor)]`.
//! The density includes every normalising constant of likelihood and prior,
//! so its integral over the parameter space is the marginal likelihood.

use std::f64::consts::LN_2;

use serde::{Deserialize, Serialize};

use super::dual::{Dual, Real, MAX_PARAMS};
use crate::lmm::{LabStats, ModelStructure};
use crate::stats::LN_2PI;

/// Prior scales
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    /// SD of the Normal(0, ·) prior on the intercept
    pub intercept_sd: f64,
    /// SD of the Normal(0, ·) prior on the condition effect
    pub effect_sd: f64,
    /// Scale of the half-Normal priors on σ and the lab SDs
    pub scale_sd: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            intercept_sd: 1.0,
            effect_sd: 1.0,
            scale_sd: 1.0,
        }
    }
}

/// Target density for the sampler and the bridge estimator
#[derive(Debug, Clone)]
pub struct MarginalPosterior {
    structure: ModelStructure,
    labs: Vec<LabStats>,
    priors: PriorConfig,
    n_obs: usize,
}

impl MarginalPosterior {
    pub fn new(structure: ModelStructure, labs: Vec<LabStats>, priors: PriorConfig) -> Self {
        let n_obs = labs.iter().map(|lab| lab.n).sum();
        Self {
            structure,
            labs,
            priors,
            n_obs,
        }
    }

    pub fn dim(&self) -> usize {
        self.structure.n_params()
    }

    pub fn param_names(&self) -> Vec<String> {
        let mut names = vec!["b_Intercept"];
        if self.structure.fixed_slope {
            names.push("b_condition");
        }
        names.extend(["log_sigma", "log_sd_Intercept"]);
        if self.structure.random_slope {
            names.extend(["log_sd_condition", "atanh_cor"]);
        }
        names.into_iter().map(String::from).collect()
    }

    /// Log posterior density (unnormalised by the evidence); −∞ on breakdown
    pub fn log_density(&self, x: &[f64]) -> f64 {
        if !self.accepts(x) {
            return f64::NEG_INFINITY;
        }
        let total = self.evaluate(x);
        if total.is_nan() {
            f64::NEG_INFINITY
        } else {
            total
        }
    }

    /// Log density with its exact gradient, by forward-mode differentiation
    pub fn log_density_and_gradient(&self, x: &[f64]) -> (f64, Vec<f64>) {
        let dim = self.dim();
        if !self.accepts(x) || dim > MAX_PARAMS {
            return (f64::NEG_INFINITY, vec![0.0; dim]);
        }
        let params: Vec<Dual> = x
            .iter()
            .enumerate()
            .map(|(i, &v)| Dual::variable(v, i))
            .collect();
        let total = self.evaluate(&params);
        if !total.value.is_finite() {
            return (f64::NEG_INFINITY, vec![0.0; dim]);
        }
        (total.value, total.grad[..dim].to_vec())
    }

    fn accepts(&self, x: &[f64]) -> bool {
        x.len() == self.dim() && x.iter().all(|v| v.is_finite())
    }

    fn evaluate<T: Real>(&self, x: &[T]) -> T {
        let p = self.structure.n_fixed();
        let beta = &x[..p];
        let log_sigma = x[p];
        let log_tau0 = x[p + 1];
        let (log_tau1, z_rho) = if self.structure.random_slope {
            (x[p + 2], x[p + 3])
        } else {
            (T::constant(0.0), T::constant(0.0))
        };

        self.log_likelihood(beta, log_sigma, log_tau0, log_tau1, z_rho)
            + self.log_prior(beta, log_sigma, log_tau0, log_tau1, z_rho)
    }

    fn log_likelihood<T: Real>(
        &self,
        beta: &[T],
        log_sigma: T,
        log_tau0: T,
        log_tau1: T,
        z_rho: T,
    ) -> T {
        let zero = T::constant(0.0);
        let sigma = log_sigma.exp();
        // Λ = chol(D) / σ, lower triangular
        let l00 = log_tau0.exp() / sigma;
        let (l10, l11) = if self.structure.random_slope {
            let scale = log_tau1.exp() / sigma;
            (scale * z_rho.tanh(), scale * sech(z_rho))
        } else {
            (zero, zero)
        };

        let mut log_det_m = zero;
        let mut wvw = [zero; 3];
        let mut wvy = [zero; 2];
        let mut yvy = zero;
        for lab in &self.labs {
            let Some(products) = woodbury(lab, l00, l10, l11) else {
                return T::constant(f64::NEG_INFINITY);
            };
            log_det_m += products.log_det_m;
            for (acc, v) in wvw.iter_mut().zip(products.wvw) {
                *acc += v;
            }
            for (acc, v) in wvy.iter_mut().zip(products.wvy) {
                *acc += v;
            }
            yvy += products.yvy;
        }

        let b0 = beta[0];
        let b1 = if self.structure.fixed_slope {
            beta[1]
        } else {
            zero
        };
        let quad = yvy - (b0 * wvy[0] + b1 * wvy[1]) * 2.0
            + b0 * b0 * wvw[0]
            + b0 * b1 * wvw[1] * 2.0
            + b1 * b1 * wvw[2];

        let n = self.n_obs as f64;
        log_sigma * (-n) - log_det_m * 0.5 - quad / (sigma * sigma) * 0.5 - 0.5 * n * LN_2PI
    }

    fn log_prior<T: Real>(
        &self,
        beta: &[T],
        log_sigma: T,
        log_tau0: T,
        log_tau1: T,
        z_rho: T,
    ) -> T {
        let mut lp = normal_log_prior(beta[0], self.priors.intercept_sd);
        if self.structure.fixed_slope {
            lp += normal_log_prior(beta[1], self.priors.effect_sd);
        }

        lp += half_normal_log_scale(log_sigma, self.priors.scale_sd);
        lp += half_normal_log_scale(log_tau0, self.priors.scale_sd);

        if self.structure.random_slope {
            lp += half_normal_log_scale(log_tau1, self.priors.scale_sd);
            // LKJ(1) on a 2×2 correlation is Uniform(-1, 1); Jacobian of tanh
            lp += log_one_minus_tanh_sq(z_rho) + 0.5f64.ln();
        }

        lp
    }
}

/// Generalised cross-products of one lab; `wvw` holds the upper triangle
struct Products<T> {
    log_det_m: T,
    wvw: [T; 3],
    wvy: [T; 2],
    yvy: T,
}

/// Woodbury products of one lab for Λ = [[l00, 0], [l10, l11]]; `None` if M is
/// not positive definite
fn woodbury<T: Real>(lab: &LabStats, l00: T, l10: T, l11: T) -> Option<Products<T>> {
    let (a, b, c) = (lab.ww[(0, 0)], lab.ww[(0, 1)], lab.ww[(1, 1)]);
    let (p, q) = (lab.wy[0], lab.wy[1]);

    // Columns of U = ΛᵀWᵀW, and Λᵀ Wᵀy
    let u0 = [l00 * a + l10 * b, l11 * b];
    let u1 = [l00 * b + l10 * c, l11 * c];
    let uy = [l00 * p + l10 * q, l11 * q];

    // M = I + UΛ and its Cholesky factor
    let m00 = u0[0] * l00 + u1[0] * l10 + 1.0;
    let m01 = u1[0] * l11;
    let m11 = u1[1] * l11 + 1.0;
    if !(m00.value() > 0.0) {
        return None;
    }
    let c00 = m00.sqrt();
    let c10 = m01 / c00;
    let schur = m11 - c10 * c10;
    if !(schur.value() > 0.0) {
        return None;
    }
    let c11 = schur.sqrt();

    let solve = |v: [T; 2]| {
        let y0 = v[0] / c00;
        let z1 = (v[1] - c10 * y0) / c11 / c11;
        [(y0 - c10 * z1) / c00, z1]
    };
    let dot = |x: [T; 2], y: [T; 2]| x[0] * y[0] + x[1] * y[1];
    let (z0, z1, zy) = (solve(u0), solve(u1), solve(uy));

    Some(Products {
        log_det_m: (c00.ln() + c11.ln()) * 2.0,
        wvw: [-dot(u0, z0) + a, -dot(u0, z1) + b, -dot(u1, z1) + c],
        wvy: [-dot(u0, zy) + p, -dot(u1, zy) + q],
        yvy: -dot(uy, zy) + lab.yy,
    })
}

/// Normal(0, sd) log density
fn normal_log_prior<T: Real>(x: T, sd: f64) -> T {
    let z = x / sd;
    -(z * z * 0.5) - (0.5 * LN_2PI + sd.ln())
}

/// Half-Normal(0, s) density of e^u, expressed on u (Jacobian included)
fn half_normal_log_scale<T: Real>(u: T, s: f64) -> T {
    let z = u.exp() / s;
    u - z * z * 0.5 + (LN_2 - 0.5 * LN_2PI - s.ln())
}

/// sech(z) = √(1 − tanh²(z)), stable for large |z|
fn sech<T: Real>(z: T) -> T {
    let e = (-z.abs()).exp();
    e * 2.0 / (e * e + 1.0)
}

/// ln(1 − tanh²(z)), stable for large |z|
fn log_one_minus_tanh_sq<T: Real>(z: T) -> T {
    let a = z.abs();
    -(a + (-(a * 2.0)).exp().ln_1p()) * 2.0 + 2.0 * LN_2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmm::deviance::{profiled_deviance, Criterion};
    use crate::lmm::ModelSpec;
    use nalgebra::{Matrix2, Vector2};

    fn labs() -> Vec<LabStats> {
        let mut out = Vec::new();
        for (offset, slope) in [(0.1, 0.4), (-0.2, 0.7), (0.0, 0.2)] {
            let mut lab = LabStats {
                n: 0,
                ww: Matrix2::zeros(),
                wy: Vector2::zeros(),
                yy: 0.0,
            };
            for (i, c) in [0.0, 0.0, 0.0, 1.0, 1.0, 1.0].into_iter().enumerate() {
                let y = offset + slope * c + 0.05 * (i as f64 - 2.5);
                let w = Vector2::new(1.0, c);
                lab.n += 1;
                lab.ww += w * w.transpose();
                lab.wy += w * y;
                lab.yy += y * y;
            }
            out.push(lab);
        }
        out
    }

    #[test]
    fn test_likelihood_matches_profiled_deviance() {
        // At the ML-profiled β and σ, the marginal log-likelihood is -deviance/2
        let structure = ModelSpec::C1.structure();
        let labs = labs();
        let theta = 0.8;
        let parts = profiled_deviance(structure, &labs, &[theta]).unwrap();
        let sigma = parts.sigma(Criterion::Ml);

        let posterior = MarginalPosterior::new(structure, labs, PriorConfig::default());
        let log_lik = posterior.log_likelihood(
            parts.beta.as_slice(),
            sigma.ln(),
            (theta * sigma).ln(),
            0.0,
            0.0,
        );
        assert!((log_lik + 0.5 * parts.deviance(Criterion::Ml)).abs() < 1e-9);
    }

    #[test]
    fn test_half_normal_integrates_to_one() {
        // ∫ exp(half_normal_log_scale(u)) du over a wide grid
        let step = 1e-3;
        let total: f64 = (-20_000..5_000)
            .map(|i| half_normal_log_scale(i as f64 * step, 1.3).exp() * step)
            .sum();
        assert!((total - 1.0).abs() < 1e-3, "{}", total);
    }

    #[test]
    fn test_tanh_jacobian() {
        for z in [-3.0, -0.5, 0.0, 0.7, 2.0] {
            let direct = (1.0 - f64::tanh(z).powi(2)).ln();
            assert!((log_one_minus_tanh_sq(z) - direct).abs() < 1e-10);
        }
        assert!(log_one_minus_tanh_sq(400.0).is_finite());
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let points: [(ModelSpec, &[f64]); 3] = [
            (ModelSpec::Full, &[0.1, 0.4, -1.2, -0.8, -1.1, 0.3]),
            (ModelSpec::B, &[0.05, -1.0, -1.5, -0.7, -0.4]),
            (ModelSpec::A, &[0.2, -0.9, -2.0]),
        ];
        for (model, x) in points {
            let posterior = MarginalPosterior::new(model.structure(), labs(), PriorConfig::default());
            let (value, grad) = posterior.log_density_and_gradient(x);
            assert!((value - posterior.log_density(x)).abs() < 1e-10, "{}", model);
            assert_eq!(grad.len(), x.len());

            let mut shifted = x.to_vec();
            for i in 0..x.len() {
                let h = 1e-6;
                shifted[i] = x[i] + h;
                let up = posterior.log_density(&shifted);
                shifted[i] = x[i] - h;
                let down = posterior.log_density(&shifted);
                shifted[i] = x[i];
                let numeric = (up - down) / (2.0 * h);
                assert!(
                    (grad[i] - numeric).abs() < 1e-4 * numeric.abs().max(1.0),
                    "{} d{}: {} vs {}",
                    model,
                    i,
                    grad[i],
                    numeric
                );
            }
        }
    }

    #[test]
    fn test_gradient_at_invalid_point() {
        let posterior =
            MarginalPosterior::new(ModelSpec::C1.structure(), labs(), PriorConfig::default());
        let (value, grad) = posterior.log_density_and_gradient(&[0.0, f64::NAN, 0.0, 0.0]);
        assert_eq!(value, f64::NEG_INFINITY);
        assert_eq!(grad, vec![0.0; 4]);
    }

    #[test]
    fn test_density_layout() {
        let posterior = MarginalPosterior::new(
            ModelSpec::Full.structure(),
            labs(),
            PriorConfig::default(),
        );
        assert_eq!(posterior.dim(), 6);
        assert_eq!(posterior.param_names().len(), 6);
        assert!(posterior.log_density(&[0.0, 0.4, -1.0, -1.0, -1.0, 0.0]).is_finite());
        assert_eq!(posterior.log_density(&[0.0; 4]), f64::NEG_INFINITY);
        assert_eq!(
            posterior.log_density(&[f64::NAN, 0.4, -1.0, -1.0, -1.0, 0.0]),
            f64::NEG_INFINITY
        );
    }
}
