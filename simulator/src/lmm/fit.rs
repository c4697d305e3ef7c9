//! Frequentist fitting and likelihood-ratio tests

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::deviance::{profiled_deviance, Criterion};
use super::optim::{nelder_mead, NelderMeadOptions, Termination};
use super::{LabStats, ModelSpec, ModelStructure};
use crate::datagen::Dataset;
use crate::error::FittingFailure;
use crate::stats::chi_square_sf;

/// Diagonal entries of Λ below this are reported as a singular fit
pub const SINGULAR_TOLERANCE: f64 = 1e-4;

/// Controls for REML/ML optimisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequentistConfig {
    /// Optimiser iteration cap per criterion
    pub max_iterations: usize,
    /// Relative tolerance on the deviance
    pub tolerance: f64,
    /// Treat boundary (singular) fits as failures
    pub fail_on_singular: bool,
}

impl Default for FrequentistConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            tolerance: 1e-9,
            fail_on_singular: false,
        }
    }
}

/// Estimates at the optimum of one criterion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimates {
    pub beta: Vec<f64>,
    pub sigma: f64,
    /// Relative covariance factor, diagonal made non-negative
    pub theta: Vec<f64>,
    pub log_lik: f64,
    pub iterations: usize,
}

/// A fitted model: REML estimates plus the ML refit used for LRTs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequentistFit {
    pub model: ModelSpec,
    pub reml: Estimates,
    pub ml: Estimates,
    pub n_params: usize,
    pub singular: bool,
}

/// Read-only fitting prototype for one model formula
///
/// Built once per study and shared between workers; [`FrequentistTemplate::fit`]
/// is the refit-with-new-data path.
#[derive(Debug, Clone)]
pub struct FrequentistTemplate {
    pub model: ModelSpec,
    structure: ModelStructure,
    start_theta: Vec<f64>,
    config: FrequentistConfig,
    timeout: Option<Duration>,
}

impl FrequentistTemplate {
    pub fn new(model: ModelSpec, config: FrequentistConfig, timeout: Option<Duration>) -> Self {
        let structure = model.structure();
        Self {
            model,
            structure,
            start_theta: structure.start_theta(),
            config,
            timeout,
        }
    }

    pub fn fit(&self, data: &Dataset) -> Result<FrequentistFit, FittingFailure> {
        let labs = LabStats::from_dataset(data);
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let reml = self.optimise(&labs, Criterion::Reml, deadline)?;
        let ml = self.optimise(&labs, Criterion::Ml, deadline)?;

        let singular = is_singular(self.structure, &reml.theta);
        if singular && self.config.fail_on_singular {
            return Err(FittingFailure::SingularFit { model: self.model });
        }

        debug!(
            model = %self.model,
            formula = self.model.formula(),
            seed = data.seed,
            reml_log_lik = reml.log_lik,
            ml_log_lik = ml.log_lik,
            singular,
            "frequentist fit"
        );

        Ok(FrequentistFit {
            model: self.model,
            reml,
            ml,
            n_params: self.structure.n_params(),
            singular,
        })
    }

    fn optimise(
        &self,
        labs: &[LabStats],
        criterion: Criterion,
        deadline: Option<Instant>,
    ) -> Result<Estimates, FittingFailure> {
        let structure = self.structure;
        let objective = |theta: &[f64]| {
            profiled_deviance(structure, labs, theta)
                .map(|parts| parts.deviance(criterion))
                .unwrap_or(f64::INFINITY)
        };

        if !objective(&self.start_theta).is_finite() {
            return Err(FittingFailure::NumericalOverflow {
                model: self.model,
                detail: "deviance is not finite at the starting values".to_string(),
            });
        }

        let options = NelderMeadOptions {
            max_iterations: self.config.max_iterations,
            f_tolerance: self.config.tolerance,
            deadline,
            ..Default::default()
        };
        let result = nelder_mead(objective, &self.start_theta, &options);

        match result.termination {
            Termination::Converged => {}
            Termination::MaxIterations => {
                return Err(FittingFailure::NonConvergence {
                    model: self.model,
                    detail: format!(
                        "{:?} optimiser reached {} iterations",
                        criterion, result.iterations
                    ),
                })
            }
            Termination::Deadline => {
                return Err(FittingFailure::Timeout {
                    model: self.model,
                    secs: self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                })
            }
        }

        let parts = profiled_deviance(structure, labs, &result.x).ok_or_else(|| {
            FittingFailure::NumericalOverflow {
                model: self.model,
                detail: "deviance breakdown at the optimum".to_string(),
            }
        })?;

        let mut theta = result.x;
        theta[0] = theta[0].abs();
        if structure.random_slope {
            theta[2] = theta[2].abs();
        }

        Ok(Estimates {
            beta: parts.beta.clone(),
            sigma: parts.sigma(criterion),
            theta,
            log_lik: -0.5 * parts.deviance(criterion),
            iterations: result.iterations,
        })
    }
}

fn is_singular(structure: ModelStructure, theta: &[f64]) -> bool {
    if structure.random_slope {
        theta[0].abs() < SINGULAR_TOLERANCE || theta[2].abs() < SINGULAR_TOLERANCE
    } else {
        theta[0].abs() < SINGULAR_TOLERANCE
    }
}

/// Likelihood-ratio test between nested models
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LrtResult {
    /// 2 × (ℓ_alt − ℓ_null), clamped at zero
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

/// Compare `null` against the larger `alternative` on their ML fits
pub fn likelihood_ratio_test(null: &FrequentistFit, alternative: &FrequentistFit) -> LrtResult {
    let statistic = (2.0 * (alternative.ml.log_lik - null.ml.log_lik)).max(0.0);
    let df = alternative.n_params.saturating_sub(null.n_params);
    LrtResult {
        statistic,
        df,
        p_value: chi_square_sf(statistic, df),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagen::{build_lab_effects, generate, GeneratorConfig, Regime};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

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

    fn fit(model: ModelSpec, data: &Dataset) -> FrequentistFit {
        FrequentistTemplate::new(model, FrequentistConfig::default(), None)
            .fit(data)
            .unwrap()
    }

    #[test]
    fn test_fixed_effect_recovered() {
        let data = generate(Regime::NullRe, 1, &config()).unwrap();
        let full = fit(ModelSpec::Full, &data);
        assert_eq!(full.reml.beta.len(), 2);
        assert!((full.reml.beta[1] - 0.5).abs() < 0.1, "{:?}", full.reml);
        assert!((full.reml.sigma - 0.2).abs() < 0.05, "{:?}", full.reml);
    }

    #[test]
    fn test_ml_log_lik_is_nested() {
        let data = generate(Regime::NullNone, 4, &config()).unwrap();
        let full = fit(ModelSpec::Full, &data);
        let a = fit(ModelSpec::A, &data);
        let b = fit(ModelSpec::B, &data);
        let c1 = fit(ModelSpec::C1, &data);

        // Larger models never fit worse under ML
        let slack = 1e-4;
        assert!(full.ml.log_lik >= a.ml.log_lik - slack);
        assert!(full.ml.log_lik >= b.ml.log_lik - slack);
        assert!(full.ml.log_lik >= c1.ml.log_lik - slack);
        assert!(c1.ml.log_lik >= a.ml.log_lik - slack);
    }

    #[test]
    fn test_lrt_detects_random_slope() {
        let data = generate(Regime::NullFe, 8, &config()).unwrap();
        let full = fit(ModelSpec::Full, &data);
        let c1 = fit(ModelSpec::C1, &data);

        let lrt = likelihood_ratio_test(&c1, &full);
        assert_eq!(lrt.df, 2);
        // Lab effects of size ~0.5 against noise ~0.28 are unmistakable
        assert!(lrt.p_value < 1e-6, "{:?}", lrt);
    }

    #[test]
    fn test_lrt_degrees_of_freedom() {
        let data = generate(Regime::NullBoth, 2, &config()).unwrap();
        let full = fit(ModelSpec::Full, &data);
        let a = fit(ModelSpec::A, &data);
        let b = fit(ModelSpec::B, &data);
        let c1 = fit(ModelSpec::C1, &data);

        assert_eq!(likelihood_ratio_test(&a, &full).df, 3);
        assert_eq!(likelihood_ratio_test(&b, &full).df, 1);
        assert_eq!(likelihood_ratio_test(&c1, &full).df, 2);
        assert_eq!(likelihood_ratio_test(&a, &c1).df, 1);
        for p in [
            likelihood_ratio_test(&a, &full).p_value,
            likelihood_ratio_test(&a, &c1).p_value,
        ] {
            assert!((0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn test_singular_fit_policy() {
        // No lab intercept variation is generated, so the random intercept
        // collapses to the boundary.
        let data = generate(Regime::NullBoth, 3, &config()).unwrap();
        let lenient = FrequentistTemplate::new(ModelSpec::A, FrequentistConfig::default(), None);
        let strict = FrequentistTemplate::new(
            ModelSpec::A,
            FrequentistConfig {
                fail_on_singular: true,
                ..Default::default()
            },
            None,
        );

        let fit = lenient.fit(&data).unwrap();
        if fit.singular {
            assert_eq!(
                strict.fit(&data),
                Err(FittingFailure::SingularFit { model: ModelSpec::A })
            );
        } else {
            assert!(strict.fit(&data).is_ok());
        }
    }

    #[test]
    fn test_iteration_cap_is_non_convergence() {
        let data = generate(Regime::NullNone, 3, &config()).unwrap();
        let template = FrequentistTemplate::new(
            ModelSpec::Full,
            FrequentistConfig {
                max_iterations: 2,
                ..Default::default()
            },
            None,
        );
        assert!(matches!(
            template.fit(&data),
            Err(FittingFailure::NonConvergence { model: ModelSpec::Full, .. })
        ));
    }
}
