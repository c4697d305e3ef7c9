//! Convergence and sampling-quality summaries for in-process chains

use serde::{Deserialize, Serialize};

use super::nuts::ChainOutput;

/// MCMC statistics for a single parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamMcmcStats {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub rhat: f64,
    pub ess: f64,
    pub q05: f64,
    pub q50: f64,
    pub q95: f64,
}

/// Summary of MCMC fit quality
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitMcmcSummary {
    /// Post-warm-up draws per chain
    pub n_draws: usize,
    pub n_chains: usize,
    pub n_divergent: usize,
    pub max_treedepth_exceeded: usize,
    pub params: Vec<ParamMcmcStats>,
    pub overall_quality: FitQuality,
}

impl FitMcmcSummary {
    pub fn total_draws(&self) -> usize {
        self.n_draws * self.n_chains
    }

    pub fn divergent_fraction(&self) -> f64 {
        match self.total_draws() {
            0 => 0.0,
            n => self.n_divergent as f64 / n as f64,
        }
    }
}

/// Overall fit quality assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitQuality {
    pub has_convergence_issues: bool,
    pub has_sampling_issues: bool,
    pub max_rhat: f64,
    pub min_ess: f64,
    pub quality_grade: String, // "A", "B", "C", "D", "F"
}

/// Summarise chains that share one parameter layout
pub fn summarize_chains(param_names: &[String], chains: &[ChainOutput]) -> FitMcmcSummary {
    let n_chains = chains.len();
    let n_draws = chains.iter().map(|c| c.draws.len()).min().unwrap_or(0);
    let n_divergent = chains.iter().map(|c| c.n_divergent).sum();
    let max_treedepth_exceeded = chains.iter().map(|c| c.n_max_treedepth).sum();

    let mut params = Vec::with_capacity(param_names.len());
    let mut max_rhat: f64 = 0.0;
    let mut min_ess = f64::INFINITY;

    for (idx, name) in param_names.iter().enumerate() {
        let draws_per_chain: Vec<Vec<f64>> = chains
            .iter()
            .map(|chain| chain.draws[..n_draws].iter().map(|d| d[idx]).collect())
            .collect();

        let flat: Vec<f64> = draws_per_chain.iter().flatten().copied().collect();
        let mean = crate::stats::mean(&flat);
        let sd = crate::stats::variance(&flat).sqrt();
        let rhat = compute_split_rhat(&draws_per_chain);
        let ess = compute_ess(&draws_per_chain);
        let quantiles = compute_quantiles(&flat, &[0.05, 0.50, 0.95]);

        max_rhat = max_rhat.max(rhat);
        min_ess = min_ess.min(ess);

        params.push(ParamMcmcStats {
            name: name.clone(),
            mean,
            sd,
            rhat,
            ess,
            q05: quantiles[0],
            q50: quantiles[1],
            q95: quantiles[2],
        });
    }

    let has_convergence_issues = max_rhat > 1.01 || min_ess < 100.0;
    let has_sampling_issues =
        n_divergent > 0 || max_treedepth_exceeded > n_draws * n_chains / 20;

    let quality_grade = if !has_convergence_issues && !has_sampling_issues {
        "A"
    } else if max_rhat < 1.05 && min_ess > 50.0 && n_divergent < 10 {
        "B"
    } else if max_rhat < 1.10 && min_ess > 20.0 {
        "C"
    } else if max_rhat < 1.20 {
        "D"
    } else {
        "F"
    };

    FitMcmcSummary {
        n_draws,
        n_chains,
        n_divergent,
        max_treedepth_exceeded,
        params,
        overall_quality: FitQuality {
            has_convergence_issues,
            has_sampling_issues,
            max_rhat,
            min_ess,
            quality_grade: quality_grade.to_string(),
        },
    }
}

/// Halve every chain so within-chain drift shows up as between-chain spread
fn split_chains(draws_per_chain: &[Vec<f64>]) -> Vec<&[f64]> {
    draws_per_chain
        .iter()
        .flat_map(|chain| {
            let half = chain.len() / 2;
            [&chain[..half], &chain[chain.len() - half..]]
        })
        .collect()
}

/// Split R-hat (potential scale reduction factor)
pub fn compute_split_rhat(draws_per_chain: &[Vec<f64>]) -> f64 {
    let halves = split_chains(draws_per_chain);
    let n = halves.first().map_or(0, |h| h.len());
    if halves.len() < 2 || n < 2 {
        return 1.0;
    }

    let means: Vec<f64> = halves.iter().map(|h| crate::stats::mean(h)).collect();
    let within = halves
        .iter()
        .map(|h| crate::stats::variance(h))
        .sum::<f64>()
        / halves.len() as f64;
    let between = n as f64 * crate::stats::variance(&means);

    if within <= 0.0 {
        return if between <= 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var_plus = ((n - 1) as f64 * within + between) / n as f64;
    (var_plus / within).sqrt()
}

/// Effective sample size of the raw draws from Geyer's initial monotone sequence
pub fn compute_ess(draws_per_chain: &[Vec<f64>]) -> f64 {
    let m = draws_per_chain.len();
    let n = draws_per_chain.iter().map(Vec::len).min().unwrap_or(0);
    if m == 0 || n < 4 {
        return (m * n) as f64;
    }

    let chain_means: Vec<f64> = draws_per_chain
        .iter()
        .map(|c| crate::stats::mean(&c[..n]))
        .collect();
    let chain_vars: Vec<f64> = draws_per_chain
        .iter()
        .map(|c| crate::stats::variance(&c[..n]))
        .collect();
    let within = crate::stats::mean(&chain_vars);
    let var_plus = within * (n - 1) as f64 / n as f64
        + if m > 1 {
            crate::stats::variance(&chain_means)
        } else {
            0.0
        };
    if var_plus <= 0.0 {
        return (m * n) as f64;
    }

    // Autocovariance at lag t averaged over chains
    let autocov = |lag: usize| -> f64 {
        draws_per_chain
            .iter()
            .zip(&chain_means)
            .map(|(c, mu)| {
                (0..n - lag)
                    .map(|i| (c[i] - mu) * (c[i + lag] - mu))
                    .sum::<f64>()
                    / n as f64
            })
            .sum::<f64>()
            / m as f64
    };
    let rho = |lag: usize| 1.0 - (within - autocov(lag)) / var_plus;

    let mut tau = -1.0;
    let mut lag = 0;
    let mut previous_pair = f64::INFINITY;
    while lag + 1 < n {
        let pair = rho(lag) + rho(lag + 1);
        if pair <= 0.0 {
            break;
        }
        // Monotone initial sequence
        let pair = pair.min(previous_pair);
        tau += 2.0 * pair;
        previous_pair = pair;
        lag += 2;
    }

    let total = (m * n) as f64;
    total / tau.max(1.0 / total.log10())
}

/// Nearest-rank quantiles
pub fn compute_quantiles(draws: &[f64], probs: &[f64]) -> Vec<f64> {
    if draws.is_empty() {
        return vec![f64::NAN; probs.len()];
    }
    let mut sorted = draws.to_vec();
    sorted.sort_by(f64::total_cmp);

    probs
        .iter()
        .map(|&p| {
            let idx = (p * (sorted.len() - 1) as f64).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;
    use rand_distr::StandardNormal;

    fn iid_chains(n_chains: usize, n: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        (0..n_chains)
            .map(|_| (0..n).map(|_| rng.sample(StandardNormal)).collect())
            .collect()
    }

    #[test]
    fn test_split_rhat_near_one_for_iid_chains() {
        let rhat = compute_split_rhat(&iid_chains(4, 500, 3));
        assert!(rhat > 0.99 && rhat < 1.02, "R-hat = {}", rhat);
    }

    #[test]
    fn test_split_rhat_flags_drift() {
        // Chains that trend upwards never mix
        let drifting: Vec<Vec<f64>> = (0..4)
            .map(|c| (0..200).map(|i| i as f64 * 0.05 + c as f64).collect())
            .collect();
        assert!(compute_split_rhat(&drifting) > 1.5);
    }

    #[test]
    fn test_ess_iid_and_autocorrelated() {
        let iid = iid_chains(4, 1000, 11);
        let ess_iid = compute_ess(&iid);
        assert!(ess_iid > 2500.0, "ess = {}", ess_iid);

        // AR(1) with φ = 0.9 reduces ESS by roughly (1 − φ)/(1 + φ)
        let ar: Vec<Vec<f64>> = iid
            .iter()
            .map(|noise| {
                let mut x = 0.0;
                noise
                    .iter()
                    .map(|e| {
                        x = 0.9 * x + e;
                        x
                    })
                    .collect()
            })
            .collect();
        let ess_ar = compute_ess(&ar);
        assert!(ess_ar < 600.0 && ess_ar > 100.0, "ess = {}", ess_ar);
    }

    #[test]
    fn test_compute_quantiles() {
        let draws = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let quantiles = compute_quantiles(&draws, &[0.0, 0.5, 1.0]);
        assert_eq!(quantiles, vec![1.0, 6.0, 10.0]);
    }

    #[test]
    fn test_summary_grade_and_divergences() {
        let iid = iid_chains(4, 1000, 5);
        let chains: Vec<ChainOutput> = iid
            .iter()
            .enumerate()
            .map(|(i, c)| ChainOutput {
                draws: c.iter().map(|v| vec![*v, 2.0 * v]).collect(),
                n_divergent: usize::from(i == 0) * 8,
                n_max_treedepth: 0,
                step_size: 0.5,
                mean_accept_stat: 0.9,
            })
            .collect();
        let names = vec!["a".to_string(), "b".to_string()];
        let summary = summarize_chains(&names, &chains);

        assert_eq!(summary.n_chains, 4);
        assert_eq!(summary.total_draws(), 4000);
        assert_eq!(summary.n_divergent, 8);
        assert!((summary.divergent_fraction() - 0.002).abs() < 1e-12);
        assert_eq!(summary.overall_quality.quality_grade, "B");
        assert!((summary.params[1].sd / summary.params[0].sd - 2.0).abs() < 1e-9);
    }
}
