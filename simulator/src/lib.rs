//! nullsim library.
//!
//! This crate implements a Monte Carlo study of null-model selection for
//! fixed and random condition effects in linear mixed models, comparing
//! Bayes factors against likelihood-ratio p-values.

pub mod aggregate;
pub mod bayes;
pub mod compare;
pub mod config;
pub mod datagen;
pub mod driver;
pub mod error;
pub mod lmm;
pub mod stats;
pub mod store;

pub use aggregate::{compute_error_rates, ErrorKind, ErrorRateRow, ErrorRateTable};
pub use compare::{
    BayesianComparison, ComparisonEngine, ComparisonResult, FrequentistComparison, Method,
    NullModel,
};
pub use config::{StudyConfig, Thresholds};
pub use datagen::{build_lab_effects, generate, Dataset, GeneratorConfig, Regime};
pub use driver::{run_study, RegimeSummary, StudyOptions, StudySummary};
pub use error::{ConfigError, FittingFailure, GenerationError, PersistenceError, StudyError};
pub use store::{ResultRow, ResultsStore};
