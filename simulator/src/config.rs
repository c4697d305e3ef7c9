//! Study configuration
//!
//! A JSON document deserialised with serde; every field has a default so an
//! empty object `{}` is a valid configuration.

use std::collections::HashSet;
use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::bayes::{PriorConfig, SamplerConfig};
use crate::datagen::{build_lab_effects, GeneratorConfig, Regime};
use crate::error::ConfigError;
use crate::lmm::FrequentistConfig;

/// Bayes factor above which the null model is rejected
pub const BF_REJECT: f64 = 3.0;
/// Bayes factor below which the data favour the null model
pub const BF_ACCEPT_NULL: f64 = 1.0 / 3.0;
/// Significance level for likelihood-ratio tests
pub const ALPHA: f64 = 0.05;

/// Decision thresholds, fixed for the duration of a study
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub bf_reject: f64,
    pub bf_accept_null: f64,
    pub alpha: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            bf_reject: BF_REJECT,
            bf_accept_null: BF_ACCEPT_NULL,
            alpha: ALPHA,
        }
    }
}

/// Data-generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub n_labs: usize,
    pub n_per_lab: usize,
    pub fe_mu: f64,
    pub fe_sigma: f64,
    pub re_sigma: f64,
    /// Mean of the normal the lab-effect magnitudes are drawn from
    pub lab_effect_mean: f64,
    pub lab_effect_sd: f64,
    pub lab_effect_seed: u64,
    /// Explicit lab effects; overrides the seeded builder when present
    pub lab_effects: Option<Vec<f64>>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            n_labs: 20,
            n_per_lab: 24,
            fe_mu: 0.5,
            fe_sigma: 0.2,
            re_sigma: 0.2,
            lab_effect_mean: 0.5,
            lab_effect_sd: 0.2,
            lab_effect_seed: 2024,
            lab_effects: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    pub regimes: Vec<Regime>,
    pub data: DataConfig,
    /// Replications per regime per run
    pub n_replications: usize,
    /// Worker pool size
    pub workers: usize,
    pub thresholds: Thresholds,
    pub sampler: SamplerConfig,
    pub priors: PriorConfig,
    pub frequentist: FrequentistConfig,
    /// Per-fit wall-clock limit
    pub fit_timeout_secs: Option<u64>,
    /// Only re-aggregate existing results
    pub skip_generation: bool,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            regimes: Regime::ALL.to_vec(),
            data: DataConfig::default(),
            n_replications: 100,
            workers: 4,
            thresholds: Thresholds::default(),
            sampler: SamplerConfig::default(),
            priors: PriorConfig::default(),
            frequentist: FrequentistConfig::default(),
            fit_timeout_secs: None,
            skip_generation: false,
        }
    }
}

impl StudyConfig {
    /// Load and validate a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: StudyConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.regimes.is_empty() {
            return invalid("at least one regime is required".to_string());
        }
        let mut seen = HashSet::new();
        for regime in &self.regimes {
            if !seen.insert(regime) {
                return invalid(format!("regime {} listed twice", regime));
            }
        }
        if self.n_replications == 0 {
            return invalid("n_replications must be at least 1".to_string());
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1".to_string());
        }

        let t = &self.thresholds;
        if !(t.alpha > 0.0 && t.alpha < 1.0) {
            return invalid(format!("alpha must lie in (0, 1), got {}", t.alpha));
        }
        if !(t.bf_accept_null > 0.0 && t.bf_accept_null <= 1.0 && t.bf_reject >= 1.0) {
            return invalid(format!(
                "Bayes factor thresholds must satisfy 0 < {} <= 1 <= {}",
                t.bf_accept_null, t.bf_reject
            ));
        }

        self.sampler.validate().map_err(ConfigError::Invalid)?;

        for (name, sd) in [
            ("priors.intercept_sd", self.priors.intercept_sd),
            ("priors.effect_sd", self.priors.effect_sd),
            ("priors.scale_sd", self.priors.scale_sd),
        ] {
            if !(sd.is_finite() && sd > 0.0) {
                return invalid(format!("{} must be positive, got {}", name, sd));
            }
        }
        if self.frequentist.max_iterations == 0 {
            return invalid("frequentist.max_iterations must be at least 1".to_string());
        }

        self.generator_config()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// Resolve the generator inputs, building lab effects from the configured seed
    pub fn generator_config(&self) -> Result<GeneratorConfig, crate::error::GenerationError> {
        let data = &self.data;
        let lab_effects = match &data.lab_effects {
            Some(effects) => effects.clone(),
            None => {
                let mut rng = ChaCha20Rng::seed_from_u64(data.lab_effect_seed);
                build_lab_effects(
                    data.n_labs,
                    data.lab_effect_mean,
                    data.lab_effect_sd,
                    &mut rng,
                )?
            }
        };
        let config = GeneratorConfig {
            n_labs: data.n_labs,
            n_per_lab: data.n_per_lab,
            fe_mu: data.fe_mu,
            fe_sigma: data.fe_sigma,
            re_sigma: data.re_sigma,
            lab_effects,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn fit_timeout(&self) -> Option<std::time::Duration> {
        self.fit_timeout_secs.map(std::time::Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config: StudyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StudyConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.regimes.len(), 4);
        assert_eq!(config.thresholds.bf_reject, 3.0);
    }

    #[test]
    fn test_partial_override() {
        let json = r#"{
            "regimes": ["null_fe"],
            "data": { "n_labs": 6 },
            "sampler": { "chains": 2 }
        }"#;
        let config: StudyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.regimes, vec![Regime::NullFe]);
        assert_eq!(config.data.n_labs, 6);
        assert_eq!(config.data.n_per_lab, 24);
        assert_eq!(config.sampler.chains, 2);
        assert_eq!(config.sampler.warmup, 1000);
        assert_eq!(config.generator_config().unwrap().lab_effects.len(), 6);
    }

    #[test]
    fn test_unknown_regime_tag_rejected() {
        let result: Result<StudyConfig, _> = serde_json::from_str(r#"{"regimes": ["null_all"]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            StudyConfig {
                regimes: vec![Regime::NullRe, Regime::NullRe],
                ..Default::default()
            },
            StudyConfig {
                workers: 0,
                ..Default::default()
            },
            StudyConfig {
                thresholds: Thresholds {
                    alpha: 1.5,
                    ..Default::default()
                },
                ..Default::default()
            },
            StudyConfig {
                data: DataConfig {
                    n_per_lab: 7,
                    ..Default::default()
                },
                ..Default::default()
            },
            StudyConfig {
                data: DataConfig {
                    lab_effects: Some(vec![0.1, -0.1]),
                    ..Default::default()
                },
                ..Default::default()
            },
            // Non-zero sum would add a population effect under null_fe
            StudyConfig {
                data: DataConfig {
                    n_labs: 2,
                    lab_effects: Some(vec![0.3, 0.3]),
                    ..Default::default()
                },
                ..Default::default()
            },
            StudyConfig {
                data: DataConfig {
                    n_labs: 3,
                    lab_effects: Some(vec![0.3, -0.29, -0.01]),
                    ..Default::default()
                },
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{:?}",
                config
            );
        }
    }

    #[test]
    fn test_explicit_lab_effects_accepted() {
        let config = StudyConfig {
            data: DataConfig {
                n_labs: 2,
                lab_effects: Some(vec![0.3, -0.3]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.generator_config().unwrap().lab_effects, vec![0.3, -0.3]);
    }

    #[test]
    fn test_lab_effects_reproducible_from_seed() {
        let config = StudyConfig::default();
        let a = config.generator_config().unwrap();
        let b = config.generator_config().unwrap();
        assert_eq!(a.lab_effects, b.lab_effects);
        assert!(a.lab_effects.iter().sum::<f64>().abs() < 1e-12);
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.json");
        let config = StudyConfig {
            n_replications: 12,
            fit_timeout_secs: Some(30),
            ..Default::default()
        };
        std::fs::write(&path, config.to_json().unwrap()).unwrap();
        let loaded = StudyConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.fit_timeout(), Some(std::time::Duration::from_secs(30)));
    }
}
