//! No-U-Turn sampler with dual-averaging step size and diagonal metric
//!
//! Reference: Hoffman & Gelman (2014) "The No-U-Turn Sampler", Algorithms 4
//! and 6, with Stan's windowed warm-up for the metric.

use std::time::Instant;

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Exp1, StandardNormal};

/// Energy error beyond which a trajectory is flagged divergent
const MAX_ENERGY_ERROR: f64 = 1000.0;

/// Controls for one chain
#[derive(Debug, Clone)]
pub struct NutsOptions {
    pub warmup: usize,
    pub samples: usize,
    /// Target mean acceptance statistic
    pub adapt_delta: f64,
    pub max_treedepth: usize,
    pub deadline: Option<Instant>,
}

/// Post-warm-up output of one chain
#[derive(Debug, Clone)]
pub struct ChainOutput {
    /// One unconstrained draw per iteration
    pub draws: Vec<Vec<f64>>,
    pub n_divergent: usize,
    pub n_max_treedepth: usize,
    pub step_size: f64,
    pub mean_accept_stat: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainError {
    /// No finite log density found at any initial point
    Initialization,
    Deadline,
}

#[derive(Debug, Clone)]
struct Point {
    theta: Vec<f64>,
    r: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

struct Tree {
    minus: Point,
    plus: Point,
    proposal: Point,
    n_valid: f64,
    keep_going: bool,
    sum_accept: f64,
    n_accept: usize,
    divergent: bool,
}

struct Sampler<'a, F> {
    target: &'a F,
    inv_metric: Vec<f64>,
}

impl<'a, F: Fn(&[f64]) -> (f64, Vec<f64>)> Sampler<'a, F> {
    fn joint(&self, point: &Point) -> f64 {
        let kinetic: f64 = point
            .r
            .iter()
            .zip(&self.inv_metric)
            .map(|(r, m)| m * r * r)
            .sum();
        point.logp - 0.5 * kinetic
    }

    fn sample_momentum(&self, rng: &mut ChaCha20Rng) -> Vec<f64> {
        self.inv_metric
            .iter()
            .map(|m| {
                let z: f64 = rng.sample(StandardNormal);
                z / m.sqrt()
            })
            .collect()
    }

    fn leapfrog(&self, point: &Point, eps: f64) -> Point {
        let r_half: Vec<f64> = point
            .r
            .iter()
            .zip(&point.grad)
            .map(|(r, g)| r + 0.5 * eps * g)
            .collect();
        let theta: Vec<f64> = point
            .theta
            .iter()
            .zip(&r_half)
            .zip(&self.inv_metric)
            .map(|((t, r), m)| t + eps * m * r)
            .collect();
        let (logp, grad) = (self.target)(&theta);
        let r = r_half
            .iter()
            .zip(&grad)
            .map(|(r, g)| r + 0.5 * eps * g)
            .collect();
        Point {
            theta,
            r,
            grad,
            logp,
        }
    }

    /// Generalised no-U-turn criterion on the trajectory ends
    fn no_u_turn(&self, minus: &Point, plus: &Point) -> bool {
        let mut forward = 0.0;
        let mut backward = 0.0;
        for i in 0..minus.theta.len() {
            let span = plus.theta[i] - minus.theta[i];
            forward += span * self.inv_metric[i] * plus.r[i];
            backward += span * self.inv_metric[i] * minus.r[i];
        }
        forward >= 0.0 && backward >= 0.0
    }

    #[allow(clippy::too_many_arguments)]
    fn build_tree(
        &self,
        start: &Point,
        log_u: f64,
        direction: f64,
        depth: usize,
        eps: f64,
        joint0: f64,
        rng: &mut ChaCha20Rng,
    ) -> Tree {
        if depth == 0 {
            let point = self.leapfrog(start, direction * eps);
            let joint = self.joint(&point);
            let joint = if joint.is_nan() { f64::NEG_INFINITY } else { joint };
            let keep_going = log_u < joint + MAX_ENERGY_ERROR;
            return Tree {
                minus: point.clone(),
                plus: point.clone(),
                n_valid: if log_u <= joint { 1.0 } else { 0.0 },
                keep_going,
                sum_accept: (joint - joint0).exp().min(1.0),
                n_accept: 1,
                divergent: !keep_going,
                proposal: point,
            };
        }

        let mut tree = self.build_tree(start, log_u, direction, depth - 1, eps, joint0, rng);
        if !tree.keep_going {
            return tree;
        }

        let edge = if direction < 0.0 {
            tree.minus.clone()
        } else {
            tree.plus.clone()
        };
        let sub = self.build_tree(&edge, log_u, direction, depth - 1, eps, joint0, rng);

        let total = tree.n_valid + sub.n_valid;
        if total > 0.0 && rng.gen::<f64>() < sub.n_valid / total {
            tree.proposal = sub.proposal;
        }
        if direction < 0.0 {
            tree.minus = sub.minus;
        } else {
            tree.plus = sub.plus;
        }
        tree.sum_accept += sub.sum_accept;
        tree.n_accept += sub.n_accept;
        tree.divergent |= sub.divergent;
        tree.n_valid = total;
        tree.keep_going = sub.keep_going && self.no_u_turn(&tree.minus, &tree.plus);
        tree
    }

    /// One NUTS transition: (next point, accept stat, divergent, hit max depth)
    fn transition(
        &self,
        current: &Point,
        eps: f64,
        max_treedepth: usize,
        rng: &mut ChaCha20Rng,
    ) -> (Point, f64, bool, bool) {
        let mut start = current.clone();
        start.r = self.sample_momentum(rng);
        let joint0 = self.joint(&start);
        let log_u = joint0 - rng.sample::<f64, _>(Exp1);

        let mut minus = start.clone();
        let mut plus = start.clone();
        let mut next = start;
        let mut n_valid = 1.0;
        let mut keep_going = true;
        let mut depth = 0;
        let mut sum_accept = 0.0;
        let mut n_accept = 0;
        let mut divergent = false;

        while keep_going && depth < max_treedepth {
            let direction = if rng.gen::<bool>() { 1.0 } else { -1.0 };
            let tree = if direction < 0.0 {
                let tree = self.build_tree(&minus, log_u, direction, depth, eps, joint0, rng);
                minus = tree.minus.clone();
                tree
            } else {
                let tree = self.build_tree(&plus, log_u, direction, depth, eps, joint0, rng);
                plus = tree.plus.clone();
                tree
            };

            sum_accept += tree.sum_accept;
            n_accept += tree.n_accept;
            divergent |= tree.divergent;

            if tree.keep_going && rng.gen::<f64>() < tree.n_valid / n_valid {
                next = tree.proposal;
            }
            n_valid += tree.n_valid;
            keep_going = tree.keep_going && self.no_u_turn(&minus, &plus);
            depth += 1;
        }

        let accept = if n_accept > 0 {
            sum_accept / n_accept as f64
        } else {
            0.0
        };
        (next, accept, divergent, keep_going && depth >= max_treedepth)
    }

    /// Heuristic initial step size (Algorithm 4)
    fn find_reasonable_step(&self, point: &Point, rng: &mut ChaCha20Rng) -> f64 {
        let mut eps = 1.0;
        let mut start = point.clone();
        start.r = self.sample_momentum(rng);
        let joint0 = self.joint(&start);

        let log_ratio = |eps: f64| {
            let next = self.leapfrog(&start, eps);
            let value = self.joint(&next) - joint0;
            if value.is_nan() {
                f64::NEG_INFINITY
            } else {
                value
            }
        };

        let direction = if log_ratio(eps) > 0.5f64.ln() { 1.0 } else { -1.0 };
        for _ in 0..100 {
            if direction * log_ratio(eps) <= -direction * std::f64::consts::LN_2 {
                break;
            }
            eps *= 2f64.powf(direction);
        }
        eps.clamp(1e-8, 1e3)
    }
}

/// Dual-averaging step size adaptation
struct DualAveraging {
    mu: f64,
    h_bar: f64,
    log_eps: f64,
    log_eps_bar: f64,
    step: usize,
    delta: f64,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    fn new(eps: f64, delta: f64) -> Self {
        Self {
            mu: (10.0 * eps).ln(),
            h_bar: 0.0,
            log_eps: eps.ln(),
            log_eps_bar: 0.0,
            step: 0,
            delta,
        }
    }

    fn update(&mut self, accept: f64) -> f64 {
        self.step += 1;
        let m = self.step as f64;
        let w = 1.0 / (m + Self::T0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.delta - accept);
        self.log_eps = self.mu - m.sqrt() / Self::GAMMA * self.h_bar;
        let eta = m.powf(-Self::KAPPA);
        self.log_eps_bar = eta * self.log_eps + (1.0 - eta) * self.log_eps_bar;
        self.log_eps.exp()
    }

    fn final_step(&self) -> f64 {
        self.log_eps_bar.exp()
    }
}

/// Slow adaptation windows `[start, end)` for the metric (Stan's doubling scheme)
pub fn metric_windows(warmup: usize) -> Vec<(usize, usize)> {
    if warmup < 20 {
        return Vec::new();
    }
    let (init, term, base) = if warmup >= 150 {
        (75, 50, 25)
    } else {
        let init = warmup * 15 / 100;
        let term = warmup / 10;
        (init, term, warmup - init - term)
    };

    let end_slow = warmup - term;
    let mut windows = Vec::new();
    let mut start = init;
    let mut size = base;
    while start < end_slow {
        let mut end = (start + size).min(end_slow);
        if end + 2 * size > end_slow {
            end = end_slow;
        }
        windows.push((start, end));
        start = end;
        size *= 2;
    }
    windows
}

/// Run one chain from a random initial point
///
/// `target` returns the log density and its gradient.
pub fn sample_chain<F: Fn(&[f64]) -> (f64, Vec<f64>)>(
    target: &F,
    dim: usize,
    options: &NutsOptions,
    rng: &mut ChaCha20Rng,
) -> Result<ChainOutput, ChainError> {
    let mut sampler = Sampler {
        target,
        inv_metric: vec![1.0; dim],
    };

    // Uniform(-2, 2) initialisation on the unconstrained scale
    let mut current = None;
    for _ in 0..100 {
        let theta: Vec<f64> = (0..dim).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let (logp, grad) = target(&theta);
        if logp.is_finite() && grad.iter().all(|g| g.is_finite()) {
            current = Some(Point {
                theta,
                r: vec![0.0; dim],
                grad,
                logp,
            });
            break;
        }
    }
    let mut current = current.ok_or(ChainError::Initialization)?;

    let windows = metric_windows(options.warmup);
    let mut adapter = DualAveraging::new(
        sampler.find_reasonable_step(&current, rng),
        options.adapt_delta,
    );
    let mut eps = adapter.log_eps.exp();
    let mut window_draws: Vec<Vec<f64>> = Vec::new();

    for iter in 0..options.warmup {
        if options.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ChainError::Deadline);
        }
        let (next, accept, _, _) = sampler.transition(&current, eps, options.max_treedepth, rng);
        current = next;
        eps = adapter.update(accept);

        if let Some(&(_, end)) = windows.iter().find(|(s, e)| iter >= *s && iter < *e) {
            window_draws.push(current.theta.clone());
            if iter + 1 == end && window_draws.len() >= 3 {
                sampler.inv_metric = regularized_variance(&window_draws);
                window_draws.clear();
                adapter = DualAveraging::new(
                    sampler.find_reasonable_step(&current, rng),
                    options.adapt_delta,
                );
                eps = adapter.log_eps.exp();
            }
        }
    }
    if options.warmup > 0 {
        eps = adapter.final_step();
    }

    let mut draws = Vec::with_capacity(options.samples);
    let mut n_divergent = 0;
    let mut n_max_treedepth = 0;
    let mut sum_accept = 0.0;
    for _ in 0..options.samples {
        if options.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ChainError::Deadline);
        }
        let (next, accept, divergent, saturated) =
            sampler.transition(&current, eps, options.max_treedepth, rng);
        current = next;
        sum_accept += accept;
        n_divergent += usize::from(divergent);
        n_max_treedepth += usize::from(saturated);
        draws.push(current.theta.clone());
    }

    Ok(ChainOutput {
        draws,
        n_divergent,
        n_max_treedepth,
        step_size: eps,
        mean_accept_stat: if options.samples > 0 {
            sum_accept / options.samples as f64
        } else {
            0.0
        },
    })
}

/// Per-coordinate variance shrunk towards 1e-3 (Stan's regularisation)
fn regularized_variance(draws: &[Vec<f64>]) -> Vec<f64> {
    let n = draws.len() as f64;
    let dim = draws[0].len();
    (0..dim)
        .map(|j| {
            let column: Vec<f64> = draws.iter().map(|d| d[j]).collect();
            let var = crate::stats::variance(&column);
            (n / (n + 5.0)) * var + 1e-3 * (5.0 / (n + 5.0))
        })
        .collect()
}
