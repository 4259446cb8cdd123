// src/optimizer.rs
//
// Gradient-based minimisers for small, smooth problems.
//
// Two solvers share one backtracking line search and one result type:
// - projected limited-memory BFGS with box bounds (L-BFGS-B style)
// - nonlinear conjugate gradient (Polak-Ribière+), unbounded
//
// The objective returns value and gradient together, so every trial point
// costs exactly one evaluation.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Sufficient-decrease constant for the Armijo condition.
const ARMIJO: f64 = 1e-4;

/// Largest initial step the conjugate gradient solver will try.
const MAX_INITIAL_STEP: f64 = 1e12;

/// Which minimiser to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMethod {
    /// Projected L-BFGS, honours box bounds.
    #[default]
    LBfgsB,

    /// Polak-Ribière+ conjugate gradient. Bounds are ignored.
    ConjugateGradient,
}

impl SolverMethod {
    pub fn name(&self) -> &'static str {
        match self {
            SolverMethod::LBfgsB => "L-BFGS-B",
            SolverMethod::ConjugateGradient => "CG",
        }
    }

    pub fn supports_bounds(&self) -> bool {
        matches!(self, SolverMethod::LBfgsB)
    }
}

/// Solver settings.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub method: SolverMethod,

    /// `None` runs until a convergence criterion or the line search stops it.
    pub max_iterations: Option<usize>,

    /// Number of correction pairs kept by L-BFGS.
    pub history: usize,

    /// Stop when the (projected) gradient's max-norm falls below this.
    pub gradient_tolerance: f64,

    /// Stop when the relative reduction of the objective falls below this.
    pub function_tolerance: f64,

    /// Halvings tried by the line search before giving up.
    pub max_backtracks: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            method: SolverMethod::LBfgsB,
            max_iterations: None,
            history: 10,
            gradient_tolerance: 1e-5,
            function_tolerance: 1e7 * f64::EPSILON,
            max_backtracks: 60,
        }
    }
}

/// Outcome of a minimisation.
///
/// `x` always holds the best point found, also when `success` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub x: Vec<f64>,
    pub success: bool,
    pub objective: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub message: String,
}

impl OptimizationResult {
    /// A successful result that did not need the solver.
    pub fn trivial(x: Vec<f64>, message: impl Into<String>) -> Self {
        Self {
            x,
            success: true,
            objective: 0.0,
            iterations: 0,
            evaluations: 0,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    GradientTolerance,
    FunctionTolerance,
    IterationLimit,
    LineSearchFailed,
    NonFiniteStart,
}

impl Termination {
    fn success(self) -> bool {
        matches!(
            self,
            Termination::GradientTolerance | Termination::FunctionTolerance
        )
    }

    fn message(self) -> &'static str {
        match self {
            Termination::GradientTolerance => "converged: gradient norm below tolerance",
            Termination::FunctionTolerance => {
                "converged: relative reduction of objective below tolerance"
            }
            Termination::IterationLimit => "iteration limit reached",
            Termination::LineSearchFailed => "line search could not decrease the objective",
            Termination::NonFiniteStart => "objective is not finite at the starting point",
        }
    }
}

/// Objective wrapper that counts evaluations.
struct Objective<F> {
    f: F,
    evaluations: usize,
}

impl<F> Objective<F>
where
    F: FnMut(&[f64]) -> (f64, Vec<f64>),
{
    #[inline]
    fn eval(&mut self, x: &[f64]) -> (f64, Vec<f64>) {
        self.evaluations += 1;
        (self.f)(x)
    }

    fn finish(
        &self,
        x: Vec<f64>,
        objective: f64,
        iterations: usize,
        termination: Termination,
    ) -> OptimizationResult {
        OptimizationResult {
            x,
            success: termination.success(),
            objective,
            iterations,
            evaluations: self.evaluations,
            message: termination.message().to_string(),
        }
    }
}

/// An accepted line-search step.
struct Step {
    x: Vec<f64>,
    f: f64,
    g: Vec<f64>,
    alpha: f64,
}

/// Minimise `objective` starting at `x0`.
///
/// `bounds` holds one `(low, high)` pair per variable. Methods without bound
/// support ignore them; a bounds slice of the wrong length is ignored too.
pub fn minimize<F>(
    objective: F,
    x0: &[f64],
    bounds: Option<&[(f64, f64)]>,
    options: &SolverOptions,
) -> OptimizationResult
where
    F: FnMut(&[f64]) -> (f64, Vec<f64>),
{
    if x0.is_empty() {
        return OptimizationResult::trivial(Vec::new(), "no optimization variables");
    }

    let bounds = match bounds {
        Some(b) if b.len() != x0.len() => {
            log::warn!(
                "ignoring {} bounds for {} variables",
                b.len(),
                x0.len()
            );
            None
        }
        Some(_) if !options.method.supports_bounds() => {
            log::debug!("{} ignores bounds", options.method.name());
            None
        }
        other => other,
    };

    let mut objective = Objective { f: objective, evaluations: 0 };

    match options.method {
        SolverMethod::LBfgsB => lbfgsb(&mut objective, x0, bounds, options),
        SolverMethod::ConjugateGradient => conjugate_gradient(&mut objective, x0, options),
    }
}

// ═══════════════════════════════════════════════════════════════════
// Projected L-BFGS
// ═══════════════════════════════════════════════════════════════════

fn lbfgsb<F>(
    objective: &mut Objective<F>,
    x0: &[f64],
    bounds: Option<&[(f64, f64)]>,
    options: &SolverOptions,
) -> OptimizationResult
where
    F: FnMut(&[f64]) -> (f64, Vec<f64>),
{
    let n = x0.len();
    let project = |i: usize, v: f64| match bounds {
        Some(b) => v.max(b[i].0).min(b[i].1),
        None => v,
    };

    let mut x: Vec<f64> = x0.iter().enumerate().map(|(i, &v)| project(i, v)).collect();
    let (mut f, mut g) = objective.eval(&x);
    if !f.is_finite() {
        return objective.finish(x, f, 0, Termination::NonFiniteStart);
    }

    let memory = options.history.max(1);
    let mut history: VecDeque<(Vec<f64>, Vec<f64>)> = VecDeque::with_capacity(memory + 1);
    let mut iterations = 0;

    loop {
        let projected_gradient = (0..n)
            .map(|i| (project(i, x[i] - g[i]) - x[i]).abs())
            .fold(0.0, f64::max);
        if projected_gradient <= options.gradient_tolerance {
            return objective.finish(x, f, iterations, Termination::GradientTolerance);
        }
        if options.max_iterations.is_some_and(|max| iterations >= max) {
            return objective.finish(x, f, iterations, Termination::IterationLimit);
        }

        // Variables pinned at a bound with the gradient pushing outwards.
        let active: Vec<bool> = match bounds {
            Some(b) => (0..n)
                .map(|i| (x[i] <= b[i].0 && g[i] > 0.0) || (x[i] >= b[i].1 && g[i] < 0.0))
                .collect(),
            None => vec![false; n],
        };

        let mut accepted = None;
        for _ in 0..2 {
            let mut direction = lbfgs_direction(&g, &active, &history);
            if dot(&g, &direction) >= 0.0 {
                history.clear();
                direction = lbfgs_direction(&g, &active, &history);
            }

            accepted = backtrack(
                objective,
                &x,
                f,
                &g,
                &direction,
                1.0,
                &project,
                options.max_backtracks,
            );
            if accepted.is_some() || history.is_empty() {
                break;
            }
            // Retry once along steepest descent.
            history.clear();
        }

        let Some(step) = accepted else {
            return objective.finish(x, f, iterations, Termination::LineSearchFailed);
        };
        iterations += 1;

        let s: Vec<f64> = step.x.iter().zip(&x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = step.g.iter().zip(&g).map(|(a, b)| a - b).collect();
        if dot(&s, &y) > f64::EPSILON * dot(&y, &y) {
            history.push_back((s, y));
            if history.len() > memory {
                history.pop_front();
            }
        }

        let converged = relative_reduction(f, step.f) <= options.function_tolerance;
        x = step.x;
        f = step.f;
        g = step.g;
        if converged {
            return objective.finish(x, f, iterations, Termination::FunctionTolerance);
        }
    }
}

/// Two-loop recursion restricted to the free variables.
///
/// Without history the direction is the unit-length steepest descent.
fn lbfgs_direction(g: &[f64], active: &[bool], history: &VecDeque<(Vec<f64>, Vec<f64>)>) -> Vec<f64> {
    let mut q: Vec<f64> = g
        .iter()
        .zip(active)
        .map(|(&gi, &pinned)| if pinned { 0.0 } else { gi })
        .collect();

    let mut alphas = Vec::with_capacity(history.len());
    for (s, y) in history.iter().rev() {
        let rho = 1.0 / dot(y, s);
        let alpha = rho * dot(s, &q);
        axpy(&mut q, -alpha, y);
        alphas.push(alpha);
    }

    match history.back() {
        Some((s, y)) => {
            let gamma = dot(s, y) / dot(y, y);
            q.iter_mut().for_each(|v| *v *= gamma);
        }
        None => {
            let norm = dot(&q, &q).sqrt();
            if norm > 0.0 {
                q.iter_mut().for_each(|v| *v /= norm);
            }
        }
    }

    for ((s, y), alpha) in history.iter().zip(alphas.iter().rev()) {
        let rho = 1.0 / dot(y, s);
        let beta = rho * dot(y, &q);
        axpy(&mut q, alpha - beta, s);
    }

    q.iter()
        .zip(active)
        .map(|(&qi, &pinned)| if pinned { 0.0 } else { -qi })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════
// Conjugate gradient
// ═══════════════════════════════════════════════════════════════════

fn conjugate_gradient<F>(
    objective: &mut Objective<F>,
    x0: &[f64],
    options: &SolverOptions,
) -> OptimizationResult
where
    F: FnMut(&[f64]) -> (f64, Vec<f64>),
{
    let mut x = x0.to_vec();
    let (mut f, mut g) = objective.eval(&x);
    if !f.is_finite() {
        return objective.finish(x, f, 0, Termination::NonFiniteStart);
    }

    let mut direction: Vec<f64> = g.iter().map(|v| -v).collect();
    // (step length, slope) of the previous iteration
    let mut previous: Option<(f64, f64)> = None;
    let mut iterations = 0;

    loop {
        if max_norm(&g) <= options.gradient_tolerance {
            return objective.finish(x, f, iterations, Termination::GradientTolerance);
        }
        if options.max_iterations.is_some_and(|max| iterations >= max) {
            return objective.finish(x, f, iterations, Termination::IterationLimit);
        }

        let mut slope = dot(&g, &direction);
        if slope >= 0.0 {
            direction = g.iter().map(|v| -v).collect();
            slope = dot(&g, &direction);
        }

        let initial_step = match previous {
            None => 1.0 / dot(&g, &g).sqrt(),
            Some((alpha, previous_slope)) => (alpha * previous_slope / slope).min(MAX_INITIAL_STEP),
        };

        let Some(step) = backtrack(
            objective,
            &x,
            f,
            &g,
            &direction,
            initial_step,
            &|_, v| v,
            options.max_backtracks,
        ) else {
            return objective.finish(x, f, iterations, Termination::LineSearchFailed);
        };
        previous = Some((step.alpha, slope));
        iterations += 1;

        let g_diff: Vec<f64> = step.g.iter().zip(&g).map(|(a, b)| a - b).collect();
        let beta = (dot(&step.g, &g_diff) / dot(&g, &g)).max(0.0);

        let converged = relative_reduction(f, step.f) <= options.function_tolerance;
        x = step.x;
        f = step.f;
        g = step.g;
        direction = g
            .iter()
            .zip(&direction)
            .map(|(gi, di)| -gi + beta * di)
            .collect();
        if converged {
            return objective.finish(x, f, iterations, Termination::FunctionTolerance);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Shared helpers
// ═══════════════════════════════════════════════════════════════════

/// Halving line search with the Armijo condition measured on the projected step.
#[allow(clippy::too_many_arguments)]
fn backtrack<F, P>(
    objective: &mut Objective<F>,
    x: &[f64],
    f: f64,
    g: &[f64],
    direction: &[f64],
    initial_step: f64,
    project: &P,
    max_backtracks: usize,
) -> Option<Step>
where
    F: FnMut(&[f64]) -> (f64, Vec<f64>),
    P: Fn(usize, f64) -> f64,
{
    let mut alpha = initial_step;
    for _ in 0..max_backtracks {
        let candidate: Vec<f64> = x
            .iter()
            .zip(direction)
            .enumerate()
            .map(|(i, (xi, di))| project(i, xi + alpha * di))
            .collect();
        if candidate.as_slice() == x {
            // Step has shrunk below the resolution of x.
            return None;
        }
        let (fc, gc) = objective.eval(&candidate);
        let predicted: f64 = g
            .iter()
            .zip(candidate.iter().zip(x))
            .map(|(gi, (ci, xi))| gi * (ci - xi))
            .sum();

        // NaN fails this comparison and keeps backtracking.
        if fc <= f + ARMIJO * predicted {
            return Some(Step {
                x: candidate,
                f: fc,
                g: gc,
                alpha,
            });
        }
        alpha *= 0.5;
    }
    None
}

#[inline]
fn relative_reduction(before: f64, after: f64) -> f64 {
    (before - after) / before.abs().max(after.abs()).max(1.0)
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn axpy(target: &mut [f64], factor: f64, v: &[f64]) {
    for (t, vi) in target.iter_mut().zip(v) {
        *t += factor * vi;
    }
}

#[inline]
fn max_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}
