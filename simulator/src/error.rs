//! Error taxonomy for the simulation study.
//!
//! Generation, configuration and persistence errors are fatal and stop a run.
//! A [`FittingFailure`] is recovered at the replication boundary and recorded
//! as a missing result.

use std::path::PathBuf;

use crate::lmm::ModelSpec;

/// Errors raised while building datasets or lab effect vectors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("unknown regime tag '{0}' (expected null_both, null_re, null_fe or null_none)")]
    UnknownRegime(String),

    #[error("invalid generator configuration: {0}")]
    InvalidConfig(String),
}

/// A model fit that could not produce a usable result
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FittingFailure {
    #[error("{model} fit did not converge: {detail}")]
    NonConvergence { model: ModelSpec, detail: String },

    #[error("{model} fit is singular (relative covariance factor on the boundary)")]
    SingularFit { model: ModelSpec },

    #[error("{model} sampler produced {n_divergent} divergent transitions out of {n_draws}")]
    Divergent {
        model: ModelSpec,
        n_divergent: usize,
        n_draws: usize,
    },

    #[error("{model} fit hit a non-finite value: {detail}")]
    NumericalOverflow { model: ModelSpec, detail: String },

    #[error("bridge sampling for {model} failed: {detail}")]
    BridgeSampling { model: ModelSpec, detail: String },

    #[error("{model} fit exceeded the {secs}s deadline")]
    Timeout { model: ModelSpec, secs: u64 },
}

impl FittingFailure {
    /// Short cause tag used in run summaries
    pub fn cause(&self) -> &'static str {
        match self {
            FittingFailure::NonConvergence { .. } => "non_convergence",
            FittingFailure::SingularFit { .. } => "singular_fit",
            FittingFailure::Divergent { .. } => "divergent",
            FittingFailure::NumericalOverflow { .. } => "numerical_overflow",
            FittingFailure::BridgeSampling { .. } => "bridge_sampling",
            FittingFailure::Timeout { .. } => "timeout",
        }
    }

    /// Model whose fit failed
    pub fn model(&self) -> ModelSpec {
        match self {
            FittingFailure::NonConvergence { model, .. }
            | FittingFailure::SingularFit { model }
            | FittingFailure::Divergent { model, .. }
            | FittingFailure::NumericalOverflow { model, .. }
            | FittingFailure::BridgeSampling { model, .. }
            | FittingFailure::Timeout { model, .. } => *model,
        }
    }
}

/// Errors reading or appending to the results store
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("results store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed results file {path} at line {line}: {detail}")]
    Malformed {
        path: PathBuf,
        line: usize,
        detail: String,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors loading or validating a study configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error in configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal errors that stop a study run
#[derive(Debug, thiserror::Error)]
pub enum StudyError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_cause_tags() {
        let failure = FittingFailure::Timeout {
            model: ModelSpec::Full,
            secs: 30,
        };
        assert_eq!(failure.cause(), "timeout");
        assert_eq!(failure.model(), ModelSpec::Full);
        assert!(failure.to_string().contains("30s deadline"));

        let failure = FittingFailure::SingularFit { model: ModelSpec::B };
        assert_eq!(failure.cause(), "singular_fit");
        assert_eq!(failure.model(), ModelSpec::B);
    }
}
