//! Bayesian fitting of the mixed models
//!
//! This module provides:
//! - The marginal posterior with lab effects integrated out
//! - An in-process NUTS sampler run as parallel chains
//! - MCMC diagnostics and the failure policy built on them
//! - Bridge-sampling estimates of the marginal likelihood

pub mod bridge;
pub mod diagnostics;
pub mod dual;
pub mod nuts;
pub mod posterior;

use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::datagen::Dataset;
use crate::error::FittingFailure;
use crate::lmm::{LabStats, ModelSpec};

pub use diagnostics::{FitMcmcSummary, FitQuality, ParamMcmcStats};
pub use posterior::{MarginalPosterior, PriorConfig};

use nuts::{sample_chain, ChainError, NutsOptions};

/// RNG streams reserved per model: one per chain, the last for bridge sampling
const STREAMS_PER_MODEL: u64 = 64;
const BRIDGE_STREAM: u64 = STREAMS_PER_MODEL - 1;

/// Largest chain count whose streams stay clear of the bridge stream
pub const MAX_CHAINS: usize = BRIDGE_STREAM as usize;

/// Configuration for NUTS sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of chains to run
    pub chains: usize,
    /// Number of warmup iterations per chain
    pub warmup: usize,
    /// Number of sampling iterations per chain
    pub samples: usize,
    /// Adapt delta (target acceptance rate)
    pub adapt_delta: f64,
    /// Maximum tree depth
    pub max_treedepth: usize,
    /// Largest tolerated share of divergent post-warm-up transitions
    pub max_divergent_fraction: f64,
    /// Largest tolerated split R-hat
    pub max_rhat: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            warmup: 1000,
            samples: 1000,
            adapt_delta: 0.99,
            max_treedepth: 15,
            max_divergent_fraction: 0.01,
            max_rhat: 1.05,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.chains == 0 || self.chains > MAX_CHAINS {
            return Err(format!(
                "sampler.chains must lie in 1..={}, got {}",
                MAX_CHAINS, self.chains
            ));
        }
        if self.samples < 10 {
            return Err("sampler.samples must be at least 10".to_string());
        }
        if !(self.adapt_delta > 0.0 && self.adapt_delta < 1.0) {
            return Err(format!(
                "sampler.adapt_delta must lie in (0, 1), got {}",
                self.adapt_delta
            ));
        }
        if self.max_treedepth == 0 || self.max_treedepth > 30 {
            return Err(format!(
                "sampler.max_treedepth must lie in 1..=30, got {}",
                self.max_treedepth
            ));
        }
        if !(0.0..=1.0).contains(&self.max_divergent_fraction) {
            return Err("sampler.max_divergent_fraction must lie in [0, 1]".to_string());
        }
        if !(self.max_rhat >= 1.0) {
            return Err("sampler.max_rhat must be at least 1".to_string());
        }
        Ok(())
    }
}

/// A sampled posterior that passed the diagnostics policy
#[derive(Debug, Clone)]
pub struct BayesianFit {
    pub model: ModelSpec,
    /// Pooled unconstrained draws, chain after chain
    pub draws: Vec<Vec<f64>>,
    pub summary: FitMcmcSummary,
    pub posterior: MarginalPosterior,
}

/// Read-only fitting prototype for one model formula
#[derive(Debug, Clone)]
pub struct BayesianTemplate {
    pub model: ModelSpec,
    priors: PriorConfig,
    sampler: SamplerConfig,
    timeout: Option<Duration>,
}

impl BayesianTemplate {
    pub fn new(
        model: ModelSpec,
        priors: PriorConfig,
        sampler: SamplerConfig,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            model,
            priors,
            sampler,
            timeout,
        }
    }

    /// Distinct RNG stream block per model so the four fits never share draws
    fn stream_base(&self) -> u64 {
        let index = match self.model {
            ModelSpec::Full => 0,
            ModelSpec::A | ModelSpec::C2 => 1,
            ModelSpec::B => 2,
            ModelSpec::C1 => 3,
        };
        index * STREAMS_PER_MODEL
    }

    fn timeout_failure(&self) -> FittingFailure {
        FittingFailure::Timeout {
            model: self.model,
            secs: self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
        }
    }

    pub fn fit(&self, data: &Dataset, seed: u64) -> Result<BayesianFit, FittingFailure> {
        let posterior = MarginalPosterior::new(
            self.model.structure(),
            LabStats::from_dataset(data),
            self.priors.clone(),
        );
        let dim = posterior.dim();
        let options = NutsOptions {
            warmup: self.sampler.warmup,
            samples: self.sampler.samples,
            adapt_delta: self.sampler.adapt_delta,
            max_treedepth: self.sampler.max_treedepth,
            deadline: self.timeout.map(|t| Instant::now() + t),
        };

        let target = |x: &[f64]| posterior.log_density_and_gradient(x);
        let chains = (0..self.sampler.chains as u64)
            .into_par_iter()
            .map(|chain| {
                let mut rng = ChaCha20Rng::seed_from_u64(seed);
                rng.set_stream(self.stream_base() + chain);
                sample_chain(&target, dim, &options, &mut rng)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| match e {
                ChainError::Deadline => self.timeout_failure(),
                ChainError::Initialization => FittingFailure::NumericalOverflow {
                    model: self.model,
                    detail: "log density is not finite at any initial value".to_string(),
                },
            })?;

        let summary = diagnostics::summarize_chains(&posterior.param_names(), &chains);

        if summary.divergent_fraction() > self.sampler.max_divergent_fraction {
            return Err(FittingFailure::Divergent {
                model: self.model,
                n_divergent: summary.n_divergent,
                n_draws: summary.total_draws(),
            });
        }
        let max_rhat = summary.overall_quality.max_rhat;
        if !(max_rhat <= self.sampler.max_rhat) {
            return Err(FittingFailure::NonConvergence {
                model: self.model,
                detail: format!("max R-hat {:.3} above {}", max_rhat, self.sampler.max_rhat),
            });
        }

        let n_chains = chains.len() as f64;
        let step_size = chains.iter().map(|c| c.step_size).sum::<f64>() / n_chains;
        let accept_stat = chains.iter().map(|c| c.mean_accept_stat).sum::<f64>() / n_chains;
        debug!(
            model = %self.model,
            formula = self.model.formula(),
            seed = data.seed,
            step_size,
            accept_stat,
            max_rhat,
            min_ess = summary.overall_quality.min_ess,
            n_divergent = summary.n_divergent,
            grade = %summary.overall_quality.quality_grade,
            "bayesian fit"
        );

        let draws = chains.into_iter().flat_map(|c| c.draws).collect();
        Ok(BayesianFit {
            model: self.model,
            draws,
            summary,
            posterior,
        })
    }
}

/// Log marginal likelihood of a fitted model by bridge sampling
pub fn bridge_sampling(
    fit: &BayesianFit,
    template: &BayesianTemplate,
    seed: u64,
) -> Result<f64, FittingFailure> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    rng.set_stream(template.stream_base() + BRIDGE_STREAM);

    let estimate =
        bridge::log_marginal_likelihood(|x| fit.posterior.log_density(x), &fit.draws, &mut rng)
            .map_err(|e| FittingFailure::BridgeSampling {
                model: fit.model,
                detail: e.to_string(),
            })?;

    debug!(
        model = %fit.model,
        log_ml = estimate.log_marginal_likelihood,
        iterations = estimate.iterations,
        "bridge sampling"
    );
    Ok(estimate.log_marginal_likelihood)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagen::{build_lab_effects, generate, GeneratorConfig, Regime};

    fn config() -> GeneratorConfig {
        let mut rng = ChaCha20Rng::seed_from_u64(2024);
        GeneratorConfig {
            n_labs: 20,
            n_per_lab: 24,
            fe_mu: 0.5,
            fe_sigma: 0.2,
            re_sigma: 0.2,
            lab_effects: build_lab_effects(20, 0.5, 0.2, &mut rng).unwrap(),
        }
    }

    fn quick_sampler() -> SamplerConfig {
        SamplerConfig {
            chains: 2,
            warmup: 300,
            samples: 400,
            adapt_delta: 0.9,
            max_treedepth: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_sampler_config_validation() {
        assert!(SamplerConfig::default().validate().is_ok());
        let bad = SamplerConfig {
            adapt_delta: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = SamplerConfig {
            chains: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        // Chain streams must not reach the bridge-sampling stream
        let widest = SamplerConfig {
            chains: MAX_CHAINS,
            ..Default::default()
        };
        assert!(widest.validate().is_ok());
        let bad = SamplerConfig {
            chains: MAX_CHAINS + 1,
            ..Default::default()
        };
        assert!(bad.validate().unwrap_err().contains("sampler.chains"));
    }

    #[test]
    fn test_fit_recovers_effect_and_is_reproducible() {
        let data = generate(Regime::NullRe, 5, &config()).unwrap();
        let template = BayesianTemplate::new(
            ModelSpec::C1,
            PriorConfig::default(),
            SamplerConfig {
                max_rhat: 1.1,
                ..quick_sampler()
            },
            None,
        );
        let fit = template.fit(&data, 5).unwrap();
        assert_eq!(fit.draws.len(), 800);
        assert_eq!(fit.summary.params[1].name, "b_condition");
        assert!((fit.summary.params[1].mean - 0.5).abs() < 0.1);

        let again = template.fit(&data, 5).unwrap();
        assert_eq!(fit.draws, again.draws);
    }

    #[test]
    fn test_bridge_sampling_favours_true_fixed_effect() {
        let data = generate(Regime::NullRe, 6, &config()).unwrap();
        let sampler = SamplerConfig {
            max_rhat: 1.1,
            ..quick_sampler()
        };
        let a = BayesianTemplate::new(ModelSpec::A, PriorConfig::default(), sampler.clone(), None);
        let c1 = BayesianTemplate::new(ModelSpec::C1, PriorConfig::default(), sampler, None);

        let log_ml_a = bridge_sampling(&a.fit(&data, 6).unwrap(), &a, 6).unwrap();
        let log_ml_c1 = bridge_sampling(&c1.fit(&data, 6).unwrap(), &c1, 6).unwrap();
        // A condition shift of 0.5 against noise 0.2 over 480 rows is overwhelming
        assert!(log_ml_c1 - log_ml_a > 3f64.ln(), "{} vs {}", log_ml_c1, log_ml_a);
    }

    #[test]
    fn test_expired_deadline_is_timeout() {
        let data = generate(Regime::NullBoth, 1, &config()).unwrap();
        let template = BayesianTemplate::new(
            ModelSpec::A,
            PriorConfig::default(),
            quick_sampler(),
            Some(Duration::ZERO),
        );
        assert_eq!(
            template.fit(&data, 1).unwrap_err(),
            FittingFailure::Timeout {
                model: ModelSpec::A,
                secs: 0
            }
        );
    }
}
