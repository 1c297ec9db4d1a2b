//! Inequality-constrained linear least squares, solved independently for
//! every voxel of a multi-channel volume.
//!
//! For each measurement vector `y` this crate solves
//! `min ||Hx - y||^2 + solution_norm * ||x||^2` subject to `Cx >= t` on the
//! inequality rows and `Cx = t` on the equality rows.
//!
//! How it works (high level):
//! - `ConstrainedProblem` validates the matrices once and caches the Cholesky
//!   factor of the normal equations and the whitened constraint rows.
//! - `ConstrainedSolver` runs a primal-dual active-set iteration against the
//!   cached quantities, reusing its scratch across calls.
//! - `VoxelApplier` drives one solver per rayon worker over every voxel of a
//!   4-D volume, with optional mask and prediction output.
//!
//! Non-convergence is never an error: the last iterate is returned and
//! `SolverStats::status` reports `MaxIterations`.
//!
//! Example:
//! ```rust,no_run
//! use icls_rs::{ConstrainedProblem, ConstrainedSolver, ProblemOptions};
//! use faer_core::Mat;
//!
//! let h = Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 0.0 });
//! let problem = ConstrainedProblem::non_negative(h, ProblemOptions::default()).unwrap();
//! let mut solver = ConstrainedSolver::new(&problem);
//! let mut x = vec![0.0; 2];
//! let stats = solver.solve(&[-1.0, 2.0], &mut x).unwrap();
//! assert!(stats.converged());
//! ```

mod apply;
mod problem;
mod report;
mod solver;
pub mod text;
mod vector;

pub use apply::{ApplyError, ApplyReport, MatrixApplier, VolumeFit, VoxelApplier};
pub use problem::{ConstrainedProblem, ProblemBuilder, ProblemError, ProblemOptions};
pub use report::{IterationReport, Reporter, SolveStatus, SolverStats, TableReporter};
pub use solver::{ConstrainedSolver, SolveError};
pub use vector::{fit_vector, VectorFit};
