//! Synthetic dataset generator for the lab × condition design.
//!
//! Every dataset is a balanced table of (lab, condition, obs) records drawn
//! under one of four data-generating regimes. The same regime, seed and
//! configuration always reproduce the same dataset.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{GenerationError, PersistenceError};

/// Minimum magnitude of every per-lab effect
pub const LAB_EFFECT_FLOOR: f64 = 0.05;

/// Data-generating regime, named after which null hypotheses hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    /// No fixed effect, no random slope
    NullBoth,
    /// Fixed effect present, no random slope
    NullRe,
    /// Random slope present, fixed effect null
    NullFe,
    /// Both present
    NullNone,
}

impl Regime {
    pub const ALL: [Regime; 4] = [
        Regime::NullBoth,
        Regime::NullRe,
        Regime::NullFe,
        Regime::NullNone,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Regime::NullBoth => "null_both",
            Regime::NullRe => "null_re",
            Regime::NullFe => "null_fe",
            Regime::NullNone => "null_none",
        }
    }

    /// Whether the population-level condition effect is non-zero
    pub fn has_fixed_effect(&self) -> bool {
        matches!(self, Regime::NullRe | Regime::NullNone)
    }

    /// Whether labs deviate from the population condition effect
    pub fn has_random_effect(&self) -> bool {
        matches!(self, Regime::NullFe | Regime::NullNone)
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Regime {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Regime::ALL
            .into_iter()
            .find(|r| r.tag() == s.trim())
            .ok_or_else(|| GenerationError::UnknownRegime(s.to_string()))
    }
}

/// Fully resolved generator inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub n_labs: usize,
    /// Records per lab, split evenly between the two conditions
    pub n_per_lab: usize,
    pub fe_mu: f64,
    pub fe_sigma: f64,
    pub re_sigma: f64,
    /// Per-lab condition-effect deviations (length `n_labs`, sums to zero)
    pub lab_effects: Vec<f64>,
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.n_labs < 2 {
            return Err(GenerationError::InvalidConfig(format!(
                "n_labs must be at least 2, got {}",
                self.n_labs
            )));
        }
        if self.n_per_lab == 0 || self.n_per_lab % 2 != 0 {
            return Err(GenerationError::InvalidConfig(format!(
                "n_per_lab must be a positive even number, got {}",
                self.n_per_lab
            )));
        }
        if !self.fe_mu.is_finite() {
            return Err(GenerationError::InvalidConfig(
                "fe_mu must be finite".to_string(),
            ));
        }
        for (name, sd) in [("fe_sigma", self.fe_sigma), ("re_sigma", self.re_sigma)] {
            if !(sd.is_finite() && sd > 0.0) {
                return Err(GenerationError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, sd
                )));
            }
        }
        if self.lab_effects.len() != self.n_labs {
            return Err(GenerationError::InvalidConfig(format!(
                "lab_effects has {} entries for {} labs",
                self.lab_effects.len(),
                self.n_labs
            )));
        }
        let sum: f64 = self.lab_effects.iter().sum();
        if !sum.is_finite() || sum.abs() > 1e-9 {
            return Err(GenerationError::InvalidConfig(format!(
                "lab_effects must sum to zero, got {}",
                sum
            )));
        }
        if let Some(e) = self
            .lab_effects
            .iter()
            .find(|e| !(e.abs() >= LAB_EFFECT_FLOOR))
        {
            return Err(GenerationError::InvalidConfig(format!(
                "lab effect {} is below the floor magnitude {}",
                e, LAB_EFFECT_FLOOR
            )));
        }
        Ok(())
    }
}

/// One observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataRow {
    /// Lab id, 1-based
    pub lab: usize,
    /// 0 = control, 1 = treatment
    pub condition: u8,
    pub obs: f64,
}

/// Balanced lab × condition dataset
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub regime: Regime,
    pub seed: u64,
    pub n_labs: usize,
    pub n_per_lab: usize,
    /// Ordered by lab, then condition, then trial
    pub rows: Vec<DataRow>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Records for `(lab, condition)`
    pub fn cell_count(&self, lab: usize, condition: u8) -> usize {
        self.rows
            .iter()
            .filter(|r| r.lab == lab && r.condition == condition)
            .count()
    }
}

/// Build a zero-sum vector of per-lab effects
///
/// Draws `n_labs - 1` magnitudes from Normal(mean, sd) floored at
/// [`LAB_EFFECT_FLOOR`], sorts them, alternates their signs and closes the
/// vector with the negated sum. The sum is exactly zero by construction and
/// every magnitude is at least the floor.
pub fn build_lab_effects<R: Rng + ?Sized>(
    n_labs: usize,
    mean: f64,
    sd: f64,
    rng: &mut R,
) -> Result<Vec<f64>, GenerationError> {
    if n_labs < 2 {
        return Err(GenerationError::InvalidConfig(format!(
            "lab effects need at least 2 labs, got {}",
            n_labs
        )));
    }
    if !(mean.is_finite() && sd.is_finite() && sd >= 0.0) {
        return Err(GenerationError::InvalidConfig(format!(
            "lab effect distribution Normal({}, {}) is invalid",
            mean, sd
        )));
    }

    let mut effects: Vec<f64> = (0..n_labs - 1)
        .map(|_| {
            let z: f64 = rng.sample(StandardNormal);
            (mean + sd * z).max(LAB_EFFECT_FLOOR)
        })
        .collect();
    effects.sort_by(f64::total_cmp);

    for (i, effect) in effects.iter_mut().enumerate() {
        if i % 2 == 1 {
            *effect = -*effect;
        }
    }

    // An even number of alternating values can nearly cancel; flipping the
    // largest moves the sum by at least twice the floor.
    let sum: f64 = effects.iter().sum();
    if sum.abs() < LAB_EFFECT_FLOOR {
        if let Some(last) = effects.last_mut() {
            *last = -*last;
        }
    }

    let closing = -effects.iter().sum::<f64>();
    effects.push(closing);

    Ok(effects)
}

/// Generate one dataset
pub fn generate(
    regime: Regime,
    seed: u64,
    config: &GeneratorConfig,
) -> Result<Dataset, GenerationError> {
    config.validate()?;

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let per_cell = config.n_per_lab / 2;

    let mut rows = Vec::with_capacity(config.n_labs * config.n_per_lab);
    for lab in 1..=config.n_labs {
        for condition in 0..=1u8 {
            for _ in 0..per_cell {
                rows.push(DataRow {
                    lab,
                    condition,
                    obs: 0.0,
                });
            }
        }
    }

    let fe_mu = if regime.has_fixed_effect() {
        config.fe_mu
    } else {
        0.0
    };
    for row in rows.iter_mut() {
        let z: f64 = rng.sample(StandardNormal);
        row.obs = f64::from(row.condition) * fe_mu + config.fe_sigma * z;
    }

    if regime.has_random_effect() {
        for row in rows.iter_mut() {
            let z: f64 = rng.sample(StandardNormal);
            let lab_effect = config.lab_effects[row.lab - 1];
            row.obs += f64::from(row.condition) * lab_effect + config.re_sigma * z;
        }
    }

    Ok(Dataset {
        regime,
        seed,
        n_labs: config.n_labs,
        n_per_lab: config.n_per_lab,
        rows,
    })
}

/// Write dataset to CSV file
pub fn write_csv(path: &Path, data: &Dataset) -> Result<(), PersistenceError> {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(data.len() * 24);
    out.push_str("lab,condition,obs\n");
    for row in &data.rows {
        let _ = writeln!(out, "{},{},{:.6}", row.lab, row.condition, row.obs);
    }

    std::fs::write(path, out).map_err(|e| PersistenceError::io(path, e))
}
