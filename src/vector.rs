use std::time::{Duration, Instant};

use crate::problem::ConstrainedProblem;
use crate::report::{emit_line, format_duration, SolverStats};
use crate::solver::{ConstrainedSolver, SolveError};

/// Result of solving a single measurement vector.
#[derive(Debug, Clone)]
pub struct VectorFit {
    pub solution: Vec<f64>,
    pub stats: SolverStats,
    /// Wall time of solver setup and solve.
    pub elapsed: Duration,
}

impl VectorFit {
    pub fn converged(&self) -> bool {
        self.stats.converged()
    }

    /// `converged in N iterations (runtime: ...)`, or the failure equivalent.
    pub fn summary(&self) -> String {
        let outcome = if self.converged() {
            "converged"
        } else {
            "failed to converge"
        };
        format!(
            "{outcome} in {} iterations (runtime: {})",
            self.stats.iterations,
            format_duration(self.elapsed)
        )
    }
}

/// Solve one measurement vector and report the outcome.
///
/// The convergence line and the solution components are emitted on the
/// console (or the `info` log when enabled); non-convergence is a warning.
pub fn fit_vector(problem: &ConstrainedProblem, measurements: &[f64]) -> Result<VectorFit, SolveError> {
    let start = Instant::now();
    let mut solver = ConstrainedSolver::new(problem);
    let mut solution = vec![0.0; problem.num_parameters()];
    let stats = solver.solve(measurements, &mut solution)?;
    let fit = VectorFit {
        solution,
        stats,
        elapsed: start.elapsed(),
    };

    if fit.converged() {
        emit_line(&fit.summary());
    } else {
        log::warn!("{}", fit.summary());
    }
    let components: Vec<String> = fit.solution.iter().map(|v| v.to_string()).collect();
    emit_line(&components.join(" "));
    Ok(fit)
}
