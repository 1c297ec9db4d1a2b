//! Per-voxel application of a solver or a fixed matrix over 4-D volumes.
//!
//! Volumes are indexed `[x, y, z, channel]`. Every spatial voxel is processed
//! independently, in parallel, with one worker state (solver scratch plus
//! gather/scatter buffers) per rayon job rather than per voxel.

use core::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use faer_core::mul::matmul;
use faer_core::{mat, Mat, MatRef, Parallelism};
use ndarray::parallel::prelude::*;
use ndarray::{aview0, Array4, ArrayView1, ArrayView3, ArrayView4, ArrayViewMut1, Axis, Zip};

use crate::problem::ConstrainedProblem;
use crate::report::{format_duration, SolveStatus};
use crate::solver::ConstrainedSolver;

/// Setup errors of a volume run. Raised before any voxel is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The input channel count does not match the matrix.
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    /// The mask does not cover the same spatial grid as the input.
    MaskMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },
    /// The matrix to apply has no rows or no columns.
    EmptyMatrix { nrows: usize, ncols: usize },
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DimensionMismatch {
                what,
                expected,
                actual,
            } => write!(f, "{what} {actual} does not match expected {expected}"),
            Self::MaskMismatch { expected, actual } => write!(
                f,
                "mask dimensions {actual:?} do not match input spatial dimensions {expected:?}"
            ),
            Self::EmptyMatrix { nrows, ncols } => {
                write!(f, "matrix is empty: nrows={nrows}, ncols={ncols}")
            }
        }
    }
}

impl std::error::Error for ApplyError {}

/// Counts gathered over a volume run.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    /// Spatial voxels in the input.
    pub voxels: usize,
    /// Voxels left at zero because the mask excluded them.
    pub skipped: usize,
    /// Voxels whose solve hit the iteration cap.
    pub not_converged: usize,
    /// Voxels whose active constraint system could not be factored.
    pub numerical_failures: usize,
    /// Voxels whose constraints admit no solution.
    pub infeasible: usize,
    pub elapsed: Duration,
}

/// Output of [`VoxelApplier::run`].
#[derive(Debug, Clone)]
pub struct VolumeFit {
    /// Per-voxel solution, channel length `num_parameters`.
    pub solution: Array4<f32>,
    /// Per-voxel `H x`, channel length `num_measurements`, when requested.
    pub prediction: Option<Array4<f32>>,
    pub report: ApplyReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionMode {
    Solution,
    SolutionAndPrediction,
}

#[derive(Default)]
struct Tally {
    skipped: AtomicUsize,
    not_converged: AtomicUsize,
    numerical_failures: AtomicUsize,
    infeasible: AtomicUsize,
}

struct VoxelWorker<'p> {
    solver: ConstrainedSolver<'p>,
    measurements: Vec<f64>,
    solution: Vec<f64>,
    fitted: Vec<f64>,
}

impl<'p> VoxelWorker<'p> {
    fn new(problem: &'p ConstrainedProblem) -> Self {
        Self {
            solver: ConstrainedSolver::new(problem),
            measurements: vec![0.0; problem.num_measurements()],
            solution: vec![0.0; problem.num_parameters()],
            fitted: vec![0.0; problem.num_measurements()],
        }
    }

    /// Solve one voxel and scatter the solution. Returns `false` when the
    /// solver rejected the voxel, leaving `output` untouched.
    fn fit(
        &mut self,
        (i, j, k): (usize, usize, usize),
        input: ArrayView1<'_, f32>,
        mut output: ArrayViewMut1<'_, f32>,
        tally: &Tally,
    ) -> bool {
        if input.len() != self.measurements.len() {
            log::error!(
                "voxel at [ {i} {j} {k} ]: {} channels, expected {}",
                input.len(),
                self.measurements.len()
            );
            tally.numerical_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        for (dst, &value) in self.measurements.iter_mut().zip(input.iter()) {
            *dst = f64::from(value);
        }

        match self.solver.solve(&self.measurements, &mut self.solution) {
            Ok(stats) => match stats.status {
                SolveStatus::MaxIterations => {
                    log::info!("voxel at [ {i} {j} {k} ] failed to converge");
                    tally.not_converged.fetch_add(1, Ordering::Relaxed);
                }
                SolveStatus::NumericalFailure => {
                    log::debug!("voxel at [ {i} {j} {k} ]: singular active constraint system");
                    tally.numerical_failures.fetch_add(1, Ordering::Relaxed);
                }
                SolveStatus::Infeasible => {
                    log::debug!("voxel at [ {i} {j} {k} ]: constraints are infeasible");
                    tally.infeasible.fetch_add(1, Ordering::Relaxed);
                }
                SolveStatus::ConvergedActiveSet | SolveStatus::ConvergedTolerance => {}
            },
            Err(err) => {
                log::error!("voxel at [ {i} {j} {k} ]: {err}");
                tally.numerical_failures.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        for (dst, &value) in output.iter_mut().zip(&self.solution) {
            *dst = value as f32;
        }
        true
    }

    fn predict(&mut self, mut prediction: ArrayViewMut1<'_, f32>) {
        if let Err(err) = self
            .solver
            .problem()
            .predict(&self.solution, &mut self.fitted)
        {
            log::error!("prediction failed: {err}");
            return;
        }
        for (dst, &value) in prediction.iter_mut().zip(&self.fitted) {
            *dst = value as f32;
        }
    }
}

/// Runs a [`ConstrainedSolver`] over every voxel of a volume.
///
/// ```rust,no_run
/// use icls_rs::{ConstrainedProblem, ProblemOptions, VoxelApplier};
/// use faer_core::Mat;
/// use ndarray::{Array3, Array4};
///
/// let h = Mat::from_fn(6, 3, |i, j| ((i + 1) * (j + 2)) as f64);
/// let problem = ConstrainedProblem::non_negative(h, ProblemOptions::default()).unwrap();
/// let input = Array4::<f32>::zeros((4, 4, 4, 6));
/// let mask = Array3::from_elem((4, 4, 4), true);
/// let fit = VoxelApplier::new(&problem)
///     .mask(mask.view())
///     .with_prediction(true)
///     .run(input.view())
///     .unwrap();
/// assert_eq!(fit.solution.dim(), (4, 4, 4, 3));
/// ```
#[derive(Debug, Clone)]
pub struct VoxelApplier<'a> {
    problem: &'a ConstrainedProblem,
    mask: Option<ArrayView3<'a, bool>>,
    prediction: bool,
}

impl<'a> VoxelApplier<'a> {
    pub fn new(problem: &'a ConstrainedProblem) -> Self {
        Self {
            problem,
            mask: None,
            prediction: false,
        }
    }

    /// Only process voxels where `mask` is true.
    pub fn mask(mut self, mask: ArrayView3<'a, bool>) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Also produce the predicted measurements `H x` per voxel.
    pub fn with_prediction(mut self, enabled: bool) -> Self {
        self.prediction = enabled;
        self
    }

    pub fn run(&self, input: ArrayView4<'_, f32>) -> Result<VolumeFit, ApplyError> {
        let problem = self.problem;
        let (nx, ny, nz, channels) = input.dim();
        if channels != problem.num_measurements() {
            return Err(ApplyError::DimensionMismatch {
                what: "input channel count",
                expected: problem.num_measurements(),
                actual: channels,
            });
        }
        let spatial = (nx, ny, nz);
        // Both arms reborrow, so the view lifetime is local to this call.
        let keep_all = aview0(&true);
        let mask = match &self.mask {
            Some(mask) => {
                if mask.dim() != spatial {
                    return Err(ApplyError::MaskMismatch {
                        expected: spatial,
                        actual: mask.dim(),
                    });
                }
                mask.view()
            }
            None => keep_all
                .broadcast(spatial)
                .ok_or(ApplyError::MaskMismatch {
                    expected: spatial,
                    actual: (1, 1, 1),
                })?,
        };
        let mode = if self.prediction {
            ExecutionMode::SolutionAndPrediction
        } else {
            ExecutionMode::Solution
        };

        let voxels = nx * ny * nz;
        log::info!(
            "performing constrained least-squares fit: {voxels} voxels, {} measurements, {} parameters, {} constraints, {} threads",
            problem.num_measurements(),
            problem.num_parameters(),
            problem.num_constraints(),
            rayon::current_num_threads(),
        );
        let start = Instant::now();
        let tally = Tally::default();
        let mut solution = Array4::<f32>::zeros((nx, ny, nz, problem.num_parameters()));

        let prediction = match mode {
            ExecutionMode::Solution => {
                Zip::indexed(solution.lanes_mut(Axis(3)))
                    .and(input.lanes(Axis(3)))
                    .and(mask)
                    .into_par_iter()
                    .for_each_init(
                        || VoxelWorker::new(problem),
                        |worker, (index, output, measurements, &keep)| {
                            if !keep {
                                tally.skipped.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                            worker.fit(index, measurements, output, &tally);
                        },
                    );
                None
            }
            ExecutionMode::SolutionAndPrediction => {
                let mut prediction = Array4::<f32>::zeros((nx, ny, nz, channels));
                Zip::indexed(solution.lanes_mut(Axis(3)))
                    .and(prediction.lanes_mut(Axis(3)))
                    .and(input.lanes(Axis(3)))
                    .and(mask)
                    .into_par_iter()
                    .for_each_init(
                        || VoxelWorker::new(problem),
                        |worker, (index, output, fitted, measurements, &keep)| {
                            if !keep {
                                tally.skipped.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                            if worker.fit(index, measurements, output, &tally) {
                                worker.predict(fitted);
                            }
                        },
                    );
                Some(prediction)
            }
        };

        let report = ApplyReport {
            voxels,
            skipped: tally.skipped.into_inner(),
            not_converged: tally.not_converged.into_inner(),
            numerical_failures: tally.numerical_failures.into_inner(),
            infeasible: tally.infeasible.into_inner(),
            elapsed: start.elapsed(),
        };
        if report.infeasible > 0 {
            log::warn!(
                "{} of {} voxels have infeasible constraints",
                report.infeasible,
                voxels - report.skipped,
            );
        }
        if report.not_converged > 0 {
            log::warn!(
                "{} of {} voxels failed to converge within {} iterations",
                report.not_converged,
                voxels - report.skipped,
                problem.max_iterations(),
            );
        }
        log::info!(
            "constrained least-squares fit done: {} voxels fitted, {} masked out, in {}",
            voxels - report.skipped,
            report.skipped,
            format_duration(report.elapsed),
        );

        Ok(VolumeFit {
            solution,
            prediction,
            report,
        })
    }
}

/// Multiplies every voxel's channel vector by a fixed matrix.
#[derive(Debug, Clone)]
pub struct MatrixApplier {
    matrix: Mat<f64>,
}

impl MatrixApplier {
    pub fn new(matrix: Mat<f64>) -> Result<Self, ApplyError> {
        if matrix.nrows() == 0 || matrix.ncols() == 0 {
            return Err(ApplyError::EmptyMatrix {
                nrows: matrix.nrows(),
                ncols: matrix.ncols(),
            });
        }
        Ok(Self { matrix })
    }

    pub fn matrix(&self) -> MatRef<'_, f64> {
        self.matrix.as_ref()
    }

    /// Returns a volume with `matrix.nrows()` channels.
    pub fn run(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>, ApplyError> {
        let (nx, ny, nz, channels) = input.dim();
        let (rows, cols) = (self.matrix.nrows(), self.matrix.ncols());
        if channels != cols {
            return Err(ApplyError::DimensionMismatch {
                what: "input channel count",
                expected: cols,
                actual: channels,
            });
        }

        log::info!("performing matrix multiplication: {} voxels, {cols} -> {rows} channels", nx * ny * nz);
        let matrix = self.matrix.as_ref();
        let mut output = Array4::<f32>::zeros((nx, ny, nz, rows));
        Zip::from(output.lanes_mut(Axis(3)))
            .and(input.lanes(Axis(3)))
            .into_par_iter()
            .for_each_init(
                || (vec![0.0f64; cols], vec![0.0f64; rows]),
                |(vec_in, vec_out), (mut out, values)| {
                    for (dst, &value) in vec_in.iter_mut().zip(values.iter()) {
                        *dst = f64::from(value);
                    }
                    matmul(
                        mat::from_column_major_slice_mut::<f64>(&mut vec_out[..], rows, 1),
                        matrix,
                        mat::from_column_major_slice::<f64>(&vec_in[..], cols, 1),
                        None,
                        1.0,
                        Parallelism::None,
                    );
                    for (dst, &value) in out.iter_mut().zip(vec_out.iter()) {
                        *dst = value as f32;
                    }
                },
            );
        Ok(output)
    }
}
