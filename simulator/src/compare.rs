//! Model comparisons for one replication
//!
//! Both engines fit the same four models (Full, A, B, C1) and derive the four
//! labelled comparisons. Every statistic is oriented alternative-over-null:
//! a large Bayes factor or a small p-value is evidence against the named null.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bayes::{bridge_sampling, BayesianTemplate, PriorConfig, SamplerConfig};
use crate::datagen::{Dataset, Regime};
use crate::error::FittingFailure;
use crate::lmm::{likelihood_ratio_test, FrequentistConfig, FrequentistTemplate, ModelSpec};

/// Inference method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Bayesian,
    Frequentist,
}

impl Method {
    pub const ALL: [Method; 2] = [Method::Bayesian, Method::Frequentist];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Bayesian => "bayesian",
            Method::Frequentist => "frequentist",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bayesian" | "bf" => Ok(Method::Bayesian),
            "frequentist" | "lrt" => Ok(Method::Frequentist),
            other => Err(format!(
                "unknown method '{}' (expected bayesian or frequentist)",
                other
            )),
        }
    }
}

/// The null model a comparison tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NullModel {
    A,
    B,
    C1,
    C2,
}

impl NullModel {
    /// Output order of a replication's rows
    pub const ALL: [NullModel; 4] = [NullModel::A, NullModel::B, NullModel::C1, NullModel::C2];

    pub fn as_str(&self) -> &'static str {
        match self {
            NullModel::A => "A",
            NullModel::B => "B",
            NullModel::C1 => "C1",
            NullModel::C2 => "C2",
        }
    }

    /// (null, alternative) models of the comparison
    pub fn models(&self) -> (ModelSpec, ModelSpec) {
        match self {
            NullModel::A => (ModelSpec::A, ModelSpec::Full),
            NullModel::B => (ModelSpec::B, ModelSpec::Full),
            NullModel::C1 => (ModelSpec::C1, ModelSpec::Full),
            NullModel::C2 => (ModelSpec::C2, ModelSpec::C1),
        }
    }

    /// Whether the comparison tests the population condition effect
    pub fn tests_fixed_effect(&self) -> bool {
        matches!(self, NullModel::A | NullModel::B | NullModel::C2)
    }

    /// Whether the comparison tests the lab-level condition slope
    pub fn tests_random_effect(&self) -> bool {
        matches!(self, NullModel::A | NullModel::C1)
    }

    /// The null holds when none of the tested effects is present in the regime
    pub fn null_is_true(&self, regime: Regime) -> bool {
        !(self.tests_fixed_effect() && regime.has_fixed_effect()
            || self.tests_random_effect() && regime.has_random_effect())
    }
}

impl fmt::Display for NullModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NullModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NullModel::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| format!("unknown null model '{}'", s))
    }
}

/// One labelled comparison of one replication
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub regime: Regime,
    pub null_model: NullModel,
    /// Bayes factor or p-value
    pub statistic: f64,
    pub method: Method,
}

/// Fits the required models and derives the four comparisons
pub trait ComparisonEngine: Sync {
    fn method(&self) -> Method;

    /// Rows in [`NullModel::ALL`] order, or the first fitting failure
    fn compare(&self, dataset: &Dataset, seed: u64)
        -> Result<Vec<ComparisonResult>, FittingFailure>;
}

fn results(
    regime: Regime,
    method: Method,
    statistics: [f64; 4],
) -> Vec<ComparisonResult> {
    NullModel::ALL
        .into_iter()
        .zip(statistics)
        .map(|(null_model, statistic)| ComparisonResult {
            regime,
            null_model,
            statistic,
            method,
        })
        .collect()
}

/// Likelihood-ratio tests on ML refits
#[derive(Debug, Clone)]
pub struct FrequentistComparison {
    full: FrequentistTemplate,
    a: FrequentistTemplate,
    b: FrequentistTemplate,
    c1: FrequentistTemplate,
}

impl FrequentistComparison {
    pub fn new(config: FrequentistConfig, timeout: Option<std::time::Duration>) -> Self {
        let template = |model| FrequentistTemplate::new(model, config.clone(), timeout);
        Self {
            full: template(ModelSpec::Full),
            a: template(ModelSpec::A),
            b: template(ModelSpec::B),
            c1: template(ModelSpec::C1),
        }
    }
}

impl ComparisonEngine for FrequentistComparison {
    fn method(&self) -> Method {
        Method::Frequentist
    }

    fn compare(
        &self,
        dataset: &Dataset,
        _seed: u64,
    ) -> Result<Vec<ComparisonResult>, FittingFailure> {
        let full = self.full.fit(dataset)?;
        let a = self.a.fit(dataset)?;
        let b = self.b.fit(dataset)?;
        let c1 = self.c1.fit(dataset)?;

        let p_values = [
            likelihood_ratio_test(&a, &full).p_value,
            likelihood_ratio_test(&b, &full).p_value,
            likelihood_ratio_test(&c1, &full).p_value,
            likelihood_ratio_test(&a, &c1).p_value,
        ];
        Ok(results(dataset.regime, self.method(), p_values))
    }
}

/// Bayes factors from bridge-sampled marginal likelihoods
#[derive(Debug, Clone)]
pub struct BayesianComparison {
    full: BayesianTemplate,
    a: BayesianTemplate,
    b: BayesianTemplate,
    c1: BayesianTemplate,
}

impl BayesianComparison {
    pub fn new(
        priors: PriorConfig,
        sampler: SamplerConfig,
        timeout: Option<std::time::Duration>,
    ) -> Self {
        let template =
            |model| BayesianTemplate::new(model, priors.clone(), sampler.clone(), timeout);
        Self {
            full: template(ModelSpec::Full),
            a: template(ModelSpec::A),
            b: template(ModelSpec::B),
            c1: template(ModelSpec::C1),
        }
    }

    fn log_evidence(
        template: &BayesianTemplate,
        dataset: &Dataset,
        seed: u64,
    ) -> Result<f64, FittingFailure> {
        let fit = template.fit(dataset, seed)?;
        bridge_sampling(&fit, template, seed)
    }
}

impl ComparisonEngine for BayesianComparison {
    fn method(&self) -> Method {
        Method::Bayesian
    }

    fn compare(
        &self,
        dataset: &Dataset,
        seed: u64,
    ) -> Result<Vec<ComparisonResult>, FittingFailure> {
        let full = Self::log_evidence(&self.full, dataset, seed)?;
        let a = Self::log_evidence(&self.a, dataset, seed)?;
        let b = Self::log_evidence(&self.b, dataset, seed)?;
        let c1 = Self::log_evidence(&self.c1, dataset, seed)?;

        // exp of a huge log ratio is +∞, which the store writes as Inf
        let bayes_factors = [
            (full - a).exp(),
            (full - b).exp(),
            (full - c1).exp(),
            (c1 - a).exp(),
        ];
        Ok(results(dataset.regime, self.method(), bayes_factors))
    }
}
