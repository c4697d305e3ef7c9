//! Bridge-sampling estimate of the log marginal likelihood
//!
//! Iterative scheme of Meng & Wong (1996) with a multivariate normal proposal
//! fitted to half of the posterior draws; the other half drives the
//! iteration, as in Gronau et al.'s `bridgesampling`.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::stats::{median, LN_2PI};

const TOLERANCE: f64 = 1e-10;
const MAX_ITERATIONS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("need at least {needed} posterior draws, got {got}")]
    TooFewDraws { needed: usize, got: usize },
    #[error("proposal covariance is not positive definite")]
    SingularProposal,
    #[error("non-finite log density at a posterior draw")]
    NonFinitePosterior,
    #[error("no convergence after {0} iterations")]
    NonConvergence(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeEstimate {
    pub log_marginal_likelihood: f64,
    pub iterations: usize,
}

/// Multivariate normal proposal
struct Proposal {
    mean: DVector<f64>,
    chol: DMatrix<f64>,
    log_norm: f64,
}

impl Proposal {
    fn fit(draws: &[&Vec<f64>]) -> Result<Self, BridgeError> {
        let dim = draws[0].len();
        let n = draws.len() as f64;

        let mut mean: DVector<f64> = DVector::zeros(dim);
        for d in draws {
            mean += DVector::from_column_slice(d.as_slice());
        }
        mean /= n;

        let mut cov: DMatrix<f64> = DMatrix::zeros(dim, dim);
        for d in draws {
            let centred = DVector::from_column_slice(d.as_slice()) - &mean;
            cov += &centred * centred.transpose();
        }
        cov /= n - 1.0;

        let chol = cov.cholesky().ok_or(BridgeError::SingularProposal)?.unpack();
        if chol.diagonal().iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            return Err(BridgeError::SingularProposal);
        }
        let log_det: f64 = chol.diagonal().iter().map(|v| v.ln()).sum();
        Ok(Self {
            mean,
            chol,
            log_norm: -0.5 * dim as f64 * LN_2PI - log_det,
        })
    }

    fn log_density(&self, x: &[f64]) -> f64 {
        let centred = DVector::from_column_slice(x) - &self.mean;
        match self.chol.solve_lower_triangular(&centred) {
            Some(z) => self.log_norm - 0.5 * z.norm_squared(),
            None => f64::NEG_INFINITY,
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let z: DVector<f64> = DVector::from_fn(self.mean.len(), |_, _| rng.sample(StandardNormal));
        (&self.mean + &self.chol * z).as_slice().to_vec()
    }
}

/// Estimate log ∫ exp(log_density) from posterior `draws`
pub fn log_marginal_likelihood<F, R>(
    log_density: F,
    draws: &[Vec<f64>],
    rng: &mut R,
) -> Result<BridgeEstimate, BridgeError>
where
    F: Fn(&[f64]) -> f64,
    R: Rng + ?Sized,
{
    let dim = draws.first().map_or(0, Vec::len);
    let needed = 2 * (dim + 2);
    if draws.len() < needed {
        return Err(BridgeError::TooFewDraws {
            needed,
            got: draws.len(),
        });
    }

    let fit_half: Vec<&Vec<f64>> = draws.iter().step_by(2).collect();
    let iter_half: Vec<&Vec<f64>> = draws.iter().skip(1).step_by(2).collect();
    let proposal = Proposal::fit(&fit_half)?;

    let l1: Vec<f64> = iter_half
        .iter()
        .map(|x| log_density(x) - proposal.log_density(x))
        .collect();
    if l1.iter().any(|v| !v.is_finite()) {
        return Err(BridgeError::NonFinitePosterior);
    }

    let n1 = l1.len();
    let n2 = n1;
    let l2: Vec<f64> = (0..n2)
        .map(|_| {
            let x = proposal.sample(rng);
            let value = log_density(&x) - proposal.log_density(&x);
            if value.is_nan() {
                f64::NEG_INFINITY
            } else {
                value
            }
        })
        .collect();

    let lstar = median(&l1);
    let s1 = n1 as f64 / (n1 + n2) as f64;
    let s2 = n2 as f64 / (n1 + n2) as f64;

    // r is the ratio of normalising constants scaled by e^{-lstar}
    let mut r = 1.0;
    for iteration in 1..=MAX_ITERATIONS {
        let numerator = l2
            .iter()
            .map(|l| 1.0 / (s1 + s2 * r * (-(l - lstar)).exp()))
            .sum::<f64>()
            / n2 as f64;
        let denominator = l1
            .iter()
            .map(|l| 1.0 / (s1 * (l - lstar).exp() + s2 * r))
            .sum::<f64>()
            / n1 as f64;

        let next = numerator / denominator;
        if !next.is_finite() || next <= 0.0 {
            return Err(BridgeError::NonConvergence(iteration));
        }
        let converged = ((next - r) / next).abs() < TOLERANCE;
        r = next;
        if converged {
            return Ok(BridgeEstimate {
                log_marginal_likelihood: r.ln() + lstar,
                iterations: iteration,
            });
        }
    }

    Err(BridgeError::NonConvergence(MAX_ITERATIONS))
}
