use core::fmt;

use dyn_stack::{GlobalPodBuffer, PodStack};
use faer_cholesky::llt::compute::cholesky_in_place;
use faer_cholesky::llt::solve::solve_in_place_with_conj;
use faer_core::mul::matmul;
use faer_core::solve::solve_upper_triangular_in_place;
use faer_core::{mat, Conj, MatRef, Parallelism};

use crate::problem::{pivots_are_stable, ConstrainedProblem};
use crate::report::{IterationReport, Reporter, SolveStatus, SolverStats};

/// Errors specific to a solve call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveError {
    /// A provided slice does not match the problem dimensions.
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DimensionMismatch {
                what,
                expected,
                actual,
            } => write!(f, "{what} {actual} does not match expected {expected}"),
        }
    }
}

impl std::error::Error for SolveError {}

/// A constraint counts as violated once its slack is below this multiple of
/// the rounding scale of the slack computation.
const VIOLATION_EPS: f64 = 1e3 * f64::EPSILON;
/// Relative size below which a constraint is linearly dependent on the
/// active ones.
const DEPENDENCE_EPS: f64 = 1e-10;
/// Relative slack below which a dependent equality is already satisfied.
const REDUNDANCY_EPS: f64 = 1e-8;

/// Reusable dual active-set solver bound to one [`ConstrainedProblem`].
///
/// The solver works in whitened coordinates `z = L^T x`, where the objective
/// is `||z - z0||^2` and the problem is a projection of `z0` onto the
/// constraint polytope. The iterate is always `z = z0 + K^T u` for
/// multipliers `u` that are non-negative on the inequality rows, so every
/// quantity a step needs comes from the cached Gram matrix
/// `G = K K^T + constraint_norm * I`:
/// - equality rows are added first, each with a full step;
/// - the most violated inequality `p` is then added: the direction in `u`
///   is `-G_AA^-1 G_Ap` on the active rows `A` and `+1` on `p`;
/// - the step length is the smaller of the step that makes `p` tight and the
///   ratio test step at which an active inequality multiplier reaches zero;
///   in the latter case that row is dropped and `p` is retried.
///
/// Every step either adds a row or drops one while strictly raising the dual
/// objective, so the active set never cycles. The solve stops when no
/// inequality is violated, when a step moves `x` by at most the tolerance,
/// or at the problem's iteration cap. All scratch is allocated up front; a
/// solver must not be shared between threads while solving, so parallel
/// callers create one per worker.
pub struct ConstrainedSolver<'p> {
    problem: &'p ConstrainedProblem,
    stack: GlobalPodBuffer,
    unconstrained: Vec<f64>,
    whitened: Vec<f64>,
    previous: Vec<f64>,
    deficit: Vec<f64>,
    multipliers: Vec<f64>,
    active: Vec<bool>,
    active_rows: Vec<usize>,
    system: Vec<f64>,
    direction: Vec<f64>,
}

/// Outcome of one step towards making a constraint tight.
enum Step {
    Added,
    Dropped,
    Infeasible,
    Singular,
}

impl<'p> ConstrainedSolver<'p> {
    /// Create a solver with workspace sized for `problem`.
    pub fn new(problem: &'p ConstrainedProblem) -> Self {
        let n = problem.num_parameters();
        let r = problem.num_constraints();
        Self {
            problem,
            stack: GlobalPodBuffer::new(problem.workspace()),
            unconstrained: vec![0.0; n],
            whitened: vec![0.0; n],
            previous: vec![0.0; n],
            deficit: vec![0.0; r],
            multipliers: vec![0.0; r],
            active: vec![false; r],
            active_rows: Vec::with_capacity(r),
            system: vec![0.0; r * r],
            direction: vec![0.0; r],
        }
    }

    pub fn problem(&self) -> &'p ConstrainedProblem {
        self.problem
    }

    /// Solve for the measurements `y`, writing the solution into `x`.
    ///
    /// Failing to converge is not an error: the last iterate is written and
    /// the returned stats say so.
    pub fn solve(&mut self, measurements: &[f64], x: &mut [f64]) -> Result<SolverStats, SolveError> {
        self.solve_with_reporter(measurements, x, None)
    }

    /// Like [`Self::solve`], feeding per-iteration diagnostics to `reporter`.
    pub fn solve_with_reporter(
        &mut self,
        measurements: &[f64],
        x: &mut [f64],
        mut reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolverStats, SolveError> {
        let problem = self.problem;
        let m = problem.num_measurements();
        let n = problem.num_parameters();
        let r = problem.num_constraints();
        check_len("measurement vector length", m, measurements.len())?;
        check_len("solution vector length", n, x.len())?;

        // z0 = W y, and the deficit g = t - K z0; the slack of row i is (G u - g)_i.
        matmul(
            mat::from_column_major_slice_mut::<f64>(&mut self.unconstrained, n, 1),
            problem.whitening(),
            mat::from_column_major_slice::<f64>(measurements, m, 1),
            None,
            1.0,
            Parallelism::None,
        );
        matmul(
            mat::from_column_major_slice_mut::<f64>(&mut self.deficit, r, 1),
            problem.whitened_constraints().transpose(),
            mat::from_column_major_slice::<f64>(&self.unconstrained, n, 1),
            None,
            -1.0,
            Parallelism::None,
        );
        for (g, &t) in self.deficit.iter_mut().zip(problem.thresholds()) {
            *g += t;
        }
        self.multipliers.fill(0.0);
        self.active.fill(false);
        self.active_rows.clear();

        for row in problem.num_inequalities()..r {
            match self.add_equality(row) {
                Step::Added | Step::Dropped => {}
                Step::Infeasible => {
                    self.update_solution(x);
                    return Ok(self.finish(SolveStatus::Infeasible, 0, 0.0, x, &mut reporter));
                }
                Step::Singular => {
                    self.update_solution(x);
                    return Ok(self.finish(SolveStatus::NumericalFailure, 0, 0.0, x, &mut reporter));
                }
            }
        }
        self.update_solution(x);

        let max_iterations = problem.max_iterations();
        let tolerance = problem.tolerance();
        let mut iterations = 0;
        let mut step_norm = 0.0;
        loop {
            let Some((row, violation)) = self.most_violated() else {
                let status = SolveStatus::ConvergedActiveSet;
                return Ok(self.finish(status, iterations, step_norm, x, &mut reporter));
            };

            // Partial steps drop blocking rows until `row` itself becomes tight.
            loop {
                if iterations == max_iterations {
                    let status = SolveStatus::MaxIterations;
                    return Ok(self.finish(status, iterations, step_norm, x, &mut reporter));
                }
                let step = self.add_inequality(row);
                let status = match step {
                    Step::Infeasible => Some(SolveStatus::Infeasible),
                    Step::Singular => Some(SolveStatus::NumericalFailure),
                    Step::Added | Step::Dropped => None,
                };
                if let Some(status) = status {
                    return Ok(self.finish(status, iterations, step_norm, x, &mut reporter));
                }

                self.previous.copy_from_slice(x);
                self.update_solution(x);
                step_norm = distance(x, &self.previous);
                iterations += 1;

                let added = matches!(step, Step::Added);
                if let Some(reporter) = reporter.as_mut() {
                    reporter.on_iteration(&IterationReport {
                        iteration: iterations - 1,
                        active: self.active_rows.len(),
                        added: usize::from(added),
                        removed: usize::from(!added),
                        max_violation: violation,
                        step_norm,
                    });
                }
                if step_norm > 0.0 && step_norm <= tolerance {
                    let status = SolveStatus::ConvergedTolerance;
                    return Ok(self.finish(status, iterations, step_norm, x, &mut reporter));
                }
                if added {
                    break;
                }
            }
        }
    }

    fn gram(&self, i: usize, j: usize) -> f64 {
        let value = self.problem.gram().read(i, j);
        if i == j {
            value + self.problem.constraint_norm()
        } else {
            value
        }
    }

    /// Slack `(G u - g)_i` of row `i` together with the magnitude of the
    /// terms it was summed from.
    fn slack(&self, i: usize) -> (f64, f64) {
        let mut slack = -self.deficit[i];
        let mut scale = self.deficit[i].abs();
        for (j, &u) in self.multipliers.iter().enumerate() {
            if u != 0.0 {
                let term = self.gram(i, j) * u;
                slack += term;
                scale += term.abs();
            }
        }
        (slack, scale)
    }

    /// The inactive inequality with the most negative slack, if any is
    /// violated, and its violation.
    fn most_violated(&self) -> Option<(usize, f64)> {
        let mut worst: Option<(usize, f64)> = None;
        for i in 0..self.problem.num_inequalities() {
            if self.active[i] {
                continue;
            }
            let (slack, scale) = self.slack(i);
            if slack < -VIOLATION_EPS * (1.0 + scale)
                && worst.map_or(true, |(_, violation)| -slack > violation)
            {
                worst = Some((i, -slack));
            }
        }
        worst
    }

    /// Solve `G_AA d = G_Ap` into `direction` and return the change in the
    /// slack of `row` per unit step, `G_pp - G_pA d`. `None` if the active
    /// block cannot be factored.
    fn step_direction(&mut self, row: usize) -> Option<f64> {
        let k = self.active_rows.len();
        if k == 0 {
            return Some(self.gram(row, row));
        }
        let problem = self.problem;
        let system = &mut self.system[..k * k];
        let rows = &self.active_rows;
        let max_diag = gather_system(system, problem.gram(), rows, problem.constraint_norm(), 0.0);
        if !factor_system(system, k, max_diag, &mut self.stack) {
            let jitter = f64::EPSILON.sqrt() * max_diag.max(1.0);
            let max_diag = gather_system(system, problem.gram(), rows, problem.constraint_norm(), jitter);
            if !factor_system(system, k, max_diag, &mut self.stack) {
                return None;
            }
        }

        for a in 0..k {
            self.direction[a] = self.gram(self.active_rows[a], row);
        }
        solve_in_place_with_conj(
            mat::from_column_major_slice::<f64>(&self.system[..k * k], k, k),
            Conj::No,
            mat::from_column_major_slice_mut::<f64>(&mut self.direction[..k], k, 1),
            Parallelism::None,
            PodStack::new(&mut self.stack),
        );

        let mut rate = self.gram(row, row);
        for a in 0..k {
            rate -= self.gram(row, self.active_rows[a]) * self.direction[a];
        }
        Some(rate)
    }

    /// Move the multipliers by `t` along the current direction for `row`.
    fn take_step(&mut self, row: usize, t: f64) {
        for (a, &active) in self.active_rows.iter().enumerate() {
            self.multipliers[active] -= t * self.direction[a];
        }
        self.multipliers[row] += t;
    }

    fn activate(&mut self, row: usize) {
        self.active[row] = true;
        self.active_rows.push(row);
    }

    /// Make the equality `row` tight with a full step. Dependent rows that are
    /// already satisfied are skipped.
    fn add_equality(&mut self, row: usize) -> Step {
        let Some(rate) = self.step_direction(row) else {
            return Step::Singular;
        };
        let (slack, scale) = self.slack(row);
        if rate <= DEPENDENCE_EPS * self.gram(row, row) {
            return if slack.abs() <= REDUNDANCY_EPS * (1.0 + scale) {
                Step::Added
            } else {
                Step::Infeasible
            };
        }
        self.take_step(row, -slack / rate);
        self.activate(row);
        Step::Added
    }

    /// One step towards making the violated inequality `row` tight.
    fn add_inequality(&mut self, row: usize) -> Step {
        let Some(rate) = self.step_direction(row) else {
            return Step::Singular;
        };
        let (slack, _) = self.slack(row);

        // Ratio test over the active inequality multipliers.
        let num_inequalities = self.problem.num_inequalities();
        let mut partial = f64::INFINITY;
        let mut blocking = None;
        for (a, &active) in self.active_rows.iter().enumerate() {
            let d = self.direction[a];
            if active < num_inequalities && d > 0.0 {
                let t = self.multipliers[active] / d;
                if t < partial {
                    partial = t;
                    blocking = Some(a);
                }
            }
        }
        let full = if rate > DEPENDENCE_EPS * self.gram(row, row) {
            -slack / rate
        } else {
            f64::INFINITY
        };

        match blocking {
            Some(a) if partial < full => {
                self.take_step(row, partial);
                let dropped = self.active_rows.remove(a);
                self.active[dropped] = false;
                self.multipliers[dropped] = 0.0;
                Step::Dropped
            }
            _ if full.is_finite() => {
                self.take_step(row, full);
                self.activate(row);
                Step::Added
            }
            _ => Step::Infeasible,
        }
    }

    /// `x = L^-T (z0 + K^T u)` for the current multipliers.
    fn update_solution(&mut self, x: &mut [f64]) {
        let problem = self.problem;
        let n = problem.num_parameters();
        let kt = problem.whitened_constraints();
        self.whitened.copy_from_slice(&self.unconstrained);
        for (row, &u) in self.multipliers.iter().enumerate() {
            if u != 0.0 {
                for (i, z) in self.whitened.iter_mut().enumerate() {
                    *z += u * kt.read(i, row);
                }
            }
        }

        x.copy_from_slice(&self.whitened);
        solve_upper_triangular_in_place(
            problem.factor().transpose(),
            mat::from_column_major_slice_mut::<f64>(&mut x[..], n, 1),
            Parallelism::None,
        );
    }

    fn finish(
        &self,
        status: SolveStatus,
        iterations: usize,
        step_norm: f64,
        x: &[f64],
        reporter: &mut Option<&mut dyn Reporter>,
    ) -> SolverStats {
        if let Some(reporter) = reporter.as_mut() {
            reporter.on_finish();
        }
        SolverStats {
            status,
            iterations,
            active_constraints: self.active_rows.len(),
            step_norm,
            max_violation: max_violation(self.problem, x),
        }
    }
}

/// Fill `system` (column-major, `k x k`) with the Gram block of the active
/// rows plus the diagonal regularization. Returns the largest diagonal entry.
fn gather_system(
    system: &mut [f64],
    gram: MatRef<'_, f64>,
    rows: &[usize],
    constraint_norm: f64,
    jitter: f64,
) -> f64 {
    let k = rows.len();
    let mut max_diag = 0.0f64;
    for (b, &col) in rows.iter().enumerate() {
        for (a, &row) in rows.iter().enumerate() {
            system[a + b * k] = gram.read(row, col);
        }
        let diag = system[b + b * k] + constraint_norm + jitter;
        system[b + b * k] = diag;
        max_diag = max_diag.max(diag);
    }
    max_diag
}

fn factor_system(system: &mut [f64], k: usize, max_diag: f64, stack: &mut GlobalPodBuffer) -> bool {
    let factored = cholesky_in_place(
        mat::from_column_major_slice_mut::<f64>(&mut system[..], k, k),
        Default::default(),
        Parallelism::None,
        PodStack::new(stack),
        Default::default(),
    );
    factored.is_ok() && pivots_are_stable(mat::from_column_major_slice::<f64>(&system[..], k, k), max_diag)
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), SolveError> {
    if expected == actual {
        Ok(())
    } else {
        Err(SolveError::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let d = x - y;
        sum += d * d;
    }
    sum.sqrt()
}

fn max_violation(problem: &ConstrainedProblem, x: &[f64]) -> f64 {
    let c = problem.constraint_matrix();
    let thresholds = problem.thresholds();
    let mut worst = 0.0f64;
    for i in 0..problem.num_inequalities() {
        let mut deficit = thresholds[i];
        for (j, &xj) in x.iter().enumerate() {
            deficit -= c.read(i, j) * xj;
        }
        worst = worst.max(deficit);
    }
    worst
}
