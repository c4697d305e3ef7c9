//! Linear mixed models for the lab × condition design
//!
//! This module provides:
//! - The fixed set of model formulas compared by the study
//! - Per-lab sufficient statistics shared by both fitting paths
//! - Profiled-deviance REML/ML fitting and likelihood-ratio tests

pub mod deviance;
pub mod fit;
pub mod optim;

use std::fmt;

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::datagen::Dataset;

pub use deviance::{profiled_deviance, Criterion, DevianceParts};
pub use fit::{
    likelihood_ratio_test, Estimates, FrequentistConfig, FrequentistFit, FrequentistTemplate,
    LrtResult,
};
pub use optim::{nelder_mead, NelderMeadOptions, NelderMeadResult, Termination};

/// Model formulas, in lme4 notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelSpec {
    /// `obs ~ 1 + condition + (1 + condition | lab)`
    Full,
    /// `obs ~ 1 + (1 | lab)`
    A,
    /// `obs ~ 1 + (1 + condition | lab)`
    B,
    /// `obs ~ 1 + condition + (1 | lab)`
    C1,
    /// Same model as A, used as the baseline for C1
    C2,
}

impl ModelSpec {
    pub fn structure(&self) -> ModelStructure {
        match self {
            ModelSpec::Full => ModelStructure {
                fixed_slope: true,
                random_slope: true,
            },
            ModelSpec::A | ModelSpec::C2 => ModelStructure {
                fixed_slope: false,
                random_slope: false,
            },
            ModelSpec::B => ModelStructure {
                fixed_slope: false,
                random_slope: true,
            },
            ModelSpec::C1 => ModelStructure {
                fixed_slope: true,
                random_slope: false,
            },
        }
    }

    pub fn formula(&self) -> &'static str {
        match self {
            ModelSpec::Full => "obs ~ 1 + condition + (1 + condition | lab)",
            ModelSpec::A | ModelSpec::C2 => "obs ~ 1 + (1 | lab)",
            ModelSpec::B => "obs ~ 1 + (1 + condition | lab)",
            ModelSpec::C1 => "obs ~ 1 + condition + (1 | lab)",
        }
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelSpec::Full => "Full",
            ModelSpec::A => "A",
            ModelSpec::B => "B",
            ModelSpec::C1 => "C1",
            ModelSpec::C2 => "C2",
        };
        f.write_str(name)
    }
}

/// Which condition terms a model carries (the intercepts are always present)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelStructure {
    pub fixed_slope: bool,
    pub random_slope: bool,
}

impl ModelStructure {
    /// Number of fixed-effect coefficients
    pub fn n_fixed(&self) -> usize {
        if self.fixed_slope {
            2
        } else {
            1
        }
    }

    /// Number of relative covariance parameters (θ)
    pub fn n_theta(&self) -> usize {
        if self.random_slope {
            3
        } else {
            1
        }
    }

    /// Total parameter count including the residual standard deviation
    pub fn n_params(&self) -> usize {
        self.n_fixed() + self.n_theta() + 1
    }

    /// Lower-triangular relative covariance factor Λ embedded in 2×2
    ///
    /// Without a random slope the second column is zero, which leaves the
    /// condition column out of the random-effects design.
    pub fn lambda(&self, theta: &[f64]) -> Matrix2<f64> {
        if self.random_slope {
            Matrix2::new(theta[0].abs(), 0.0, theta[1], theta[2].abs())
        } else {
            Matrix2::new(theta[0].abs(), 0.0, 0.0, 0.0)
        }
    }

    /// lme4 default starting point
    pub fn start_theta(&self) -> Vec<f64> {
        if self.random_slope {
            vec![1.0, 0.0, 1.0]
        } else {
            vec![1.0]
        }
    }
}

/// Sufficient statistics of one lab, with W = [1, condition]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabStats {
    pub n: usize,
    /// WᵀW
    pub ww: Matrix2<f64>,
    /// Wᵀy
    pub wy: Vector2<f64>,
    /// yᵀy
    pub yy: f64,
}

impl LabStats {
    fn empty() -> Self {
        Self {
            n: 0,
            ww: Matrix2::zeros(),
            wy: Vector2::zeros(),
            yy: 0.0,
        }
    }

    /// Accumulate per-lab statistics, skipping labs with no records
    pub fn from_dataset(data: &Dataset) -> Vec<LabStats> {
        let mut labs = vec![LabStats::empty(); data.n_labs];
        for row in &data.rows {
            let Some(lab) = row.lab.checked_sub(1).and_then(|i| labs.get_mut(i)) else {
                continue;
            };
            let w = Vector2::new(1.0, f64::from(row.condition));
            lab.n += 1;
            lab.ww += w * w.transpose();
            lab.wy += w * row.obs;
            lab.yy += row.obs * row.obs;
        }
        labs.retain(|lab| lab.n > 0);
        labs
    }
}
