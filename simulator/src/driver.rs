//! Simulation driver: replications per regime on a fixed worker pool
//!
//! Replication indices continue from what the results store already holds,
//! so an interrupted study resumes without reusing seeds.

use std::collections::BTreeMap;
use std::fmt;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::compare::{ComparisonEngine, ComparisonResult, Method};
use crate::datagen::{generate, GeneratorConfig, Regime};
use crate::error::{FittingFailure, GenerationError, StudyError};
use crate::store::{ResultRow, ResultsStore};

/// Run-wide settings for [`run_study`]
#[derive(Debug, Clone)]
pub struct StudyOptions {
    /// Worker pool size
    pub workers: usize,
    pub generator: GeneratorConfig,
    /// Threads each replication may occupy (MCMC chains), for the oversubscription check
    pub threads_per_replication: usize,
}

/// Outcome counts for one regime batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegimeSummary {
    pub regime: Regime,
    pub first_seed: u64,
    pub last_seed: u64,
    pub successes: usize,
    pub failures: usize,
    /// Failure counts keyed by cause tag
    pub causes: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudySummary {
    pub method: Method,
    pub regimes: Vec<RegimeSummary>,
}

impl StudySummary {
    pub fn total_failures(&self) -> usize {
        self.regimes.iter().map(|r| r.failures).sum()
    }
}

impl fmt::Display for StudySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} replications:", self.method)?;
        for r in &self.regimes {
            write!(
                f,
                "  {:<10} seeds {}..={}  ok {:>4}  missing {:>4}",
                r.regime.tag(),
                r.first_seed,
                r.last_seed,
                r.successes,
                r.failures
            )?;
            if !r.causes.is_empty() {
                let causes: Vec<String> =
                    r.causes.iter().map(|(c, n)| format!("{}={}", c, n)).collect();
                write!(f, "  ({})", causes.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Run `n_replications` more replications of every regime and persist them
pub fn run_study(
    engine: &dyn ComparisonEngine,
    store: &ResultsStore,
    regimes: &[Regime],
    n_replications: u64,
    options: &StudyOptions,
) -> Result<StudySummary, StudyError> {
    let method = engine.method();
    options.generator.validate()?;

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let demand = options.workers * options.threads_per_replication.max(1);
    if demand > cores {
        warn!(
            workers = options.workers,
            threads_per_replication = options.threads_per_replication,
            cores,
            "worker pool oversubscribes the available cores"
        );
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers)
        .build()
        .map_err(|e| StudyError::WorkerPool(e.to_string()))?;

    let mut summaries = Vec::with_capacity(regimes.len());
    for &regime in regimes {
        let start = store.replications_completed(method, regime)?;
        let first_seed = start + 1;
        let last_seed = start + n_replications;
        info!(%method, %regime, first_seed, last_seed, "starting regime batch");

        let outcomes: Vec<Result<Vec<ComparisonResult>, FittingFailure>> = pool.install(|| {
            (first_seed..=last_seed)
                .into_par_iter()
                .map(|seed| {
                    let dataset = generate(regime, seed, &options.generator)?;
                    let outcome = engine.compare(&dataset, seed);
                    if let Err(failure) = &outcome {
                        warn!(
                            %method,
                            %regime,
                            seed,
                            model = %failure.model(),
                            cause = failure.cause(),
                            "replication failed: {}",
                            failure
                        );
                    }
                    Ok(outcome)
                })
                .collect::<Result<Vec<_>, GenerationError>>()
        })?;

        let mut rows = Vec::with_capacity(outcomes.len() * crate::store::ROWS_PER_REPLICATION);
        let mut summary = RegimeSummary {
            regime,
            first_seed,
            last_seed,
            successes: 0,
            failures: 0,
            causes: BTreeMap::new(),
        };
        for outcome in outcomes {
            match outcome {
                Ok(results) => {
                    summary.successes += 1;
                    rows.extend(results.into_iter().map(ResultRow::from));
                }
                Err(failure) => {
                    summary.failures += 1;
                    *summary.causes.entry(failure.cause().to_string()).or_default() += 1;
                    rows.extend(ResultRow::missing_replication(regime));
                }
            }
        }

        store.append_batch(method, &rows)?;
        info!(
            %method,
            %regime,
            successes = summary.successes,
            failures = summary.failures,
            "regime batch persisted"
        );
        summaries.push(summary);
    }

    Ok(StudySummary {
        method,
        regimes: summaries,
    })
}
