//! Derivative-free minimisation (Nelder–Mead simplex)

use std::time::Instant;

/// Settings for [`nelder_mead`]
#[derive(Debug, Clone)]
pub struct NelderMeadOptions {
    pub max_iterations: usize,
    /// Convergence threshold on the spread of simplex function values
    pub f_tolerance: f64,
    /// Convergence threshold on the simplex diameter
    pub x_tolerance: f64,
    /// Initial simplex edge length
    pub initial_step: f64,
    pub deadline: Option<Instant>,
}

impl Default for NelderMeadOptions {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            f_tolerance: 1e-9,
            x_tolerance: 1e-7,
            initial_step: 0.25,
            deadline: None,
        }
    }
}

/// Why the optimiser stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Converged,
    MaxIterations,
    Deadline,
}

#[derive(Debug, Clone)]
pub struct NelderMeadResult {
    pub x: Vec<f64>,
    pub f: f64,
    pub iterations: usize,
    pub termination: Termination,
}

/// Minimise `f` from `start`; non-finite values are treated as +∞
pub fn nelder_mead<F>(mut f: F, start: &[f64], options: &NelderMeadOptions) -> NelderMeadResult
where
    F: FnMut(&[f64]) -> f64,
{
    let dim = start.len();
    let mut eval = |x: &[f64]| {
        let v = f(x);
        if v.is_finite() {
            v
        } else {
            f64::INFINITY
        }
    };

    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(dim + 1);
    simplex.push(start.to_vec());
    for i in 0..dim {
        let mut vertex = start.to_vec();
        vertex[i] += options.initial_step;
        simplex.push(vertex);
    }
    let mut values: Vec<f64> = simplex.iter().map(|x| eval(x)).collect();

    let mut iterations = 0;
    let termination = loop {
        let mut order: Vec<usize> = (0..=dim).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        values = order.iter().map(|&i| values[i]).collect();

        let best = values[0];
        let worst = values[dim];
        let diameter = simplex[1..]
            .iter()
            .flat_map(|v| v.iter().zip(&simplex[0]).map(|(a, b)| (a - b).abs()))
            .fold(0.0, f64::max);
        if (worst - best).abs() <= options.f_tolerance * (1.0 + best.abs())
            && diameter <= options.x_tolerance
        {
            break Termination::Converged;
        }
        if iterations >= options.max_iterations {
            break Termination::MaxIterations;
        }
        if options.deadline.is_some_and(|d| Instant::now() >= d) {
            break Termination::Deadline;
        }
        iterations += 1;

        let centroid: Vec<f64> = (0..dim)
            .map(|j| simplex[..dim].iter().map(|v| v[j]).sum::<f64>() / dim as f64)
            .collect();
        let towards = |coef: f64| -> Vec<f64> {
            centroid
                .iter()
                .zip(&simplex[dim])
                .map(|(c, w)| c + coef * (w - c))
                .collect()
        };

        let reflected = towards(-1.0);
        let f_reflected = eval(&reflected);

        if f_reflected < values[0] {
            let expanded = towards(-2.0);
            let f_expanded = eval(&expanded);
            if f_expanded < f_reflected {
                simplex[dim] = expanded;
                values[dim] = f_expanded;
            } else {
                simplex[dim] = reflected;
                values[dim] = f_reflected;
            }
            continue;
        }

        if f_reflected < values[dim - 1] {
            simplex[dim] = reflected;
            values[dim] = f_reflected;
            continue;
        }

        if f_reflected < values[dim] {
            let outside = towards(-0.5);
            let f_outside = eval(&outside);
            if f_outside <= f_reflected {
                simplex[dim] = outside;
                values[dim] = f_outside;
                continue;
            }
        } else {
            let inside = towards(0.5);
            let f_inside = eval(&inside);
            if f_inside < values[dim] {
                simplex[dim] = inside;
                values[dim] = f_inside;
                continue;
            }
        }

        // Shrink towards the best vertex
        let best_vertex = simplex[0].clone();
        for i in 1..=dim {
            for j in 0..dim {
                simplex[i][j] = best_vertex[j] + 0.5 * (simplex[i][j] - best_vertex[j]);
            }
            values[i] = eval(&simplex[i]);
        }
    };

    NelderMeadResult {
        x: simplex[0].clone(),
        f: values[0],
        iterations,
        termination,
    }
}
