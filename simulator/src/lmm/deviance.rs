//! Profiled deviance of a linear mixed model
//!
//! Follows the lme4 formulation: the random-effects covariance is
//! D = σ²ΛΛᵀ with Λ the relative covariance factor, β and σ are profiled
//! out, and each lab's marginal covariance σ²(I + ZΛΛᵀZᵀ) is handled through
//! the Woodbury identity on the 2×2 matrix M = I + ΛᵀZᵀZΛ.

use nalgebra::{Matrix2, Vector2};

use super::{LabStats, ModelStructure};
use crate::stats::LN_2PI;

/// Optimisation criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    /// Restricted maximum likelihood
    Reml,
    /// Maximum likelihood
    Ml,
}

/// Pieces of the profiled deviance at a given θ
#[derive(Debug, Clone, PartialEq)]
pub struct DevianceParts {
    /// Σ log|Mⱼ|
    pub log_det_m: f64,
    /// log|XᵀṼ⁻¹X|
    pub log_det_a: f64,
    /// Penalised residual sum of squares
    pub r2: f64,
    /// GLS estimate of β
    pub beta: Vec<f64>,
    pub n_obs: usize,
    pub n_fixed: usize,
}

impl DevianceParts {
    /// -2 × log-likelihood under the criterion, at the profiled σ
    pub fn deviance(&self, criterion: Criterion) -> f64 {
        let n = self.n_obs as f64;
        match criterion {
            Criterion::Ml => self.log_det_m + n * (1.0 + LN_2PI + (self.r2 / n).ln()),
            Criterion::Reml => {
                let dof = n - self.n_fixed as f64;
                self.log_det_m + self.log_det_a + dof * (1.0 + LN_2PI + (self.r2 / dof).ln())
            }
        }
    }

    /// Profiled residual standard deviation
    pub fn sigma(&self, criterion: Criterion) -> f64 {
        let dof = match criterion {
            Criterion::Ml => self.n_obs as f64,
            Criterion::Reml => (self.n_obs - self.n_fixed) as f64,
        };
        (self.r2 / dof).sqrt()
    }
}

/// Generalised cross-products of one lab under Ṽ = I + ZΛΛᵀZᵀ
struct LabProducts {
    pub log_det_m: f64,
    /// WᵀṼ⁻¹W
    pub wvw: Matrix2<f64>,
    /// WᵀṼ⁻¹y
    pub wvy: Vector2<f64>,
    /// yᵀṼ⁻¹y
    pub yvy: f64,
}

/// Woodbury products for one lab; `None` if M is not positive definite
fn lab_products(lab: &LabStats, lambda: &Matrix2<f64>) -> Option<LabProducts> {
    let lambda_t = lambda.transpose();
    let m = Matrix2::identity() + lambda_t * lab.ww * lambda;
    let chol = m.cholesky()?;
    let l = chol.l();
    let log_det_m = 2.0 * (l[(0, 0)].ln() + l[(1, 1)].ln());

    let u_w = lambda_t * lab.ww;
    let u_y = lambda_t * lab.wy;
    let m_inv_u_w = chol.solve(&u_w);
    let m_inv_u_y = chol.solve(&u_y);

    Some(LabProducts {
        log_det_m,
        wvw: lab.ww - u_w.transpose() * m_inv_u_w,
        wvy: lab.wy - u_w.transpose() * m_inv_u_y,
        yvy: lab.yy - u_y.dot(&m_inv_u_y),
    })
}

/// Evaluate the profiled deviance pieces; `None` on a numerical breakdown
pub fn profiled_deviance(
    structure: ModelStructure,
    labs: &[LabStats],
    theta: &[f64],
) -> Option<DevianceParts> {
    let lambda = structure.lambda(theta);

    let mut log_det_m = 0.0;
    let mut wvw = Matrix2::zeros();
    let mut wvy = Vector2::zeros();
    let mut yvy = 0.0;
    let mut n_obs = 0;

    for lab in labs {
        let products = lab_products(lab, &lambda)?;
        log_det_m += products.log_det_m;
        wvw += products.wvw;
        wvy += products.wvy;
        yvy += products.yvy;
        n_obs += lab.n;
    }

    let n_fixed = structure.n_fixed();
    let (beta, log_det_a, r2) = if structure.fixed_slope {
        let chol = wvw.cholesky()?;
        let beta = chol.solve(&wvy);
        let l = chol.l();
        let log_det_a = 2.0 * (l[(0, 0)].ln() + l[(1, 1)].ln());
        (vec![beta[0], beta[1]], log_det_a, yvy - wvy.dot(&beta))
    } else {
        let a = wvw[(0, 0)];
        if a <= 0.0 {
            return None;
        }
        let beta = wvy[0] / a;
        (vec![beta], a.ln(), yvy - wvy[0] * beta)
    };

    if !(r2.is_finite() && r2 > 0.0 && log_det_m.is_finite()) || n_obs <= n_fixed {
        return None;
    }

    Some(DevianceParts {
        log_det_m,
        log_det_a,
        r2,
        beta,
        n_obs,
        n_fixed,
    })
}
