use core::fmt;

use dyn_stack::{GlobalPodBuffer, PodStack, StackReq};
use faer_cholesky::llt::compute::{cholesky_in_place, cholesky_in_place_req};
use faer_cholesky::llt::solve::solve_in_place_req;
use faer_core::mul::matmul;
use faer_core::solve::solve_lower_triangular_in_place;
use faer_core::{mat, Mat, MatRef, Parallelism};

use crate::solver::SolveError;

/// Errors while validating or preparing a constrained problem.
#[derive(Debug, Clone, PartialEq)]
pub enum ProblemError {
    /// The problem matrix has no rows or no columns.
    Empty { nrows: usize, ncols: usize },
    /// Two quantities that must agree in size do not.
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    /// More trailing equalities were requested than the constraint block has rows.
    TooManyEqualities { requested: usize, available: usize },
    /// A regularization weight is negative or not finite.
    InvalidRegularization { name: &'static str, value: f64 },
    /// The convergence tolerance is negative or not finite.
    InvalidTolerance { value: f64 },
    /// `H^T H + solution_norm * I` is not positive definite.
    RankDeficient { solution_norm: f64 },
    /// Workspace requirement overflowed.
    WorkspaceOverflow,
    /// Workspace allocation failed.
    WorkspaceAlloc,
}

impl fmt::Display for ProblemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty { nrows, ncols } => {
                write!(f, "problem matrix is empty: nrows={nrows}, ncols={ncols}")
            }
            Self::DimensionMismatch {
                what,
                expected,
                actual,
            } => write!(f, "{what}: expected {expected}, got {actual}"),
            Self::TooManyEqualities {
                requested,
                available,
            } => write!(
                f,
                "cannot treat {requested} constraints as equalities: constraint matrix has {available} rows"
            ),
            Self::InvalidRegularization { name, value } => {
                write!(f, "{name} regularization must be finite and >= 0 (got {value})")
            }
            Self::InvalidTolerance { value } => {
                write!(f, "tolerance must be finite and >= 0 (got {value})")
            }
            Self::RankDeficient { solution_norm } => write!(
                f,
                "problem matrix is rank-deficient with solution_norm={solution_norm}; increase the solution norm regularization"
            ),
            Self::WorkspaceOverflow => write!(f, "workspace size overflow"),
            Self::WorkspaceAlloc => write!(f, "workspace allocation failed"),
        }
    }
}

impl std::error::Error for ProblemError {}

/// Scalar settings shared by every solve against a problem.
#[derive(Debug, Clone)]
pub struct ProblemOptions {
    /// Maximum number of active-set updates per solve; `0` selects `10 * num_parameters`.
    pub max_iterations: usize,
    /// Stop once an update moves the solution by at most this much (Euclidean norm).
    pub tolerance: f64,
    /// Penalty on `||x||^2` added to the normal equations.
    pub solution_norm: f64,
    /// Penalty added to the diagonal of the active constraint system.
    pub constraint_norm: f64,
}

impl Default for ProblemOptions {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            tolerance: 0.0,
            solution_norm: 0.0,
            constraint_norm: 0.0,
        }
    }
}

/// Least squares `min ||Hx - y||^2` subject to `Cx >= t` on the inequality
/// rows and `Cx = t` on the equality rows.
///
/// The problem is built once and shared read-only by every solver. Besides the
/// user matrices it caches the quantities each solve needs:
/// - `L`, the lower Cholesky factor of `H^T H + solution_norm * I`;
/// - `W = L^-1 H^T`, so the unconstrained solution in whitened coordinates
///   `z = L^T x` is `z0 = W y`;
/// - `K^T = L^-1 C^T`, the constraint rows in whitened coordinates;
/// - `K K^T`, the Gram matrix from which every active block is gathered.
///
/// Constraint rows are stored in canonical order: inequalities first, then
/// equalities.
#[derive(Debug, Clone)]
pub struct ConstrainedProblem {
    problem_matrix: Mat<f64>,
    constraint_matrix: Mat<f64>,
    thresholds: Vec<f64>,
    num_inequalities: usize,
    factor: Mat<f64>,
    whitening: Mat<f64>,
    whitened_constraints: Mat<f64>,
    gram: Mat<f64>,
    max_iterations: usize,
    tolerance: f64,
    solution_norm: f64,
    constraint_norm: f64,
    workspace: StackReq,
}

/// Assembles a [`ConstrainedProblem`] from any of the supported constraint
/// layouts.
///
/// - No inequality block: `C = I`, `t = 0` (non-negative solution).
/// - An inequality block with thresholds, optionally with its last
///   `num_equalities` rows treated as equalities.
/// - An explicit equality block `B x = s`, appended after the above.
#[derive(Debug, Clone)]
pub struct ProblemBuilder {
    problem_matrix: Mat<f64>,
    inequality: Option<Mat<f64>>,
    threshold: Option<Vec<f64>>,
    num_equalities: usize,
    equality: Option<Mat<f64>>,
    equality_values: Option<Vec<f64>>,
    options: ProblemOptions,
}

impl ProblemBuilder {
    /// Constraint matrix `A` of `Ax >= t`. Defaults to the identity.
    pub fn inequality(mut self, matrix: Mat<f64>) -> Self {
        self.inequality = Some(matrix);
        self
    }

    /// Thresholds `t` of `Ax >= t`. Defaults to zero.
    pub fn threshold(mut self, values: Vec<f64>) -> Self {
        self.threshold = Some(values);
        self
    }

    /// Treat the last `count` rows of `A`/`t` as equalities.
    pub fn num_equalities(mut self, count: usize) -> Self {
        self.num_equalities = count;
        self
    }

    /// Equality block `B` of `Bx = s`.
    pub fn equality(mut self, matrix: Mat<f64>) -> Self {
        self.equality = Some(matrix);
        self
    }

    /// Right-hand side `s` of `Bx = s`. Defaults to zero.
    pub fn equality_values(mut self, values: Vec<f64>) -> Self {
        self.equality_values = Some(values);
        self
    }

    pub fn options(mut self, options: ProblemOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the inputs and precompute the shared factorizations.
    pub fn build(self) -> Result<ConstrainedProblem, ProblemError> {
        let h = self.problem_matrix;
        let (m, n) = (h.nrows(), h.ncols());
        if m == 0 || n == 0 {
            return Err(ProblemError::Empty { nrows: m, ncols: n });
        }

        let a = self.inequality.unwrap_or_else(|| identity(n));
        check_len("constraint matrix columns", n, a.ncols())?;
        let t = self.threshold.unwrap_or_else(|| vec![0.0; a.nrows()]);
        check_len("threshold vector length", a.nrows(), t.len())?;
        if self.num_equalities > a.nrows() {
            return Err(ProblemError::TooManyEqualities {
                requested: self.num_equalities,
                available: a.nrows(),
            });
        }

        let b = self.equality.unwrap_or_else(|| Mat::zeros(0, n));
        check_len("equality constraint matrix columns", n, b.ncols())?;
        let s = self
            .equality_values
            .unwrap_or_else(|| vec![0.0; b.nrows()]);
        check_len("equality values length", b.nrows(), s.len())?;

        let p = a.nrows();
        let constraint_matrix = Mat::from_fn(p + b.nrows(), n, |i, j| {
            if i < p {
                a.read(i, j)
            } else {
                b.read(i - p, j)
            }
        });
        let mut thresholds = t;
        thresholds.extend_from_slice(&s);

        ConstrainedProblem::from_canonical(
            h,
            constraint_matrix,
            thresholds,
            p - self.num_equalities,
            self.options,
        )
    }
}

impl ConstrainedProblem {
    /// Start assembling a problem around the measurement matrix `H` (`m x n`).
    pub fn builder(problem_matrix: Mat<f64>) -> ProblemBuilder {
        ProblemBuilder {
            problem_matrix,
            inequality: None,
            threshold: None,
            num_equalities: 0,
            equality: None,
            equality_values: None,
            options: ProblemOptions::default(),
        }
    }

    /// Least squares with every solution component constrained to be `>= 0`.
    pub fn non_negative(
        problem_matrix: Mat<f64>,
        options: ProblemOptions,
    ) -> Result<Self, ProblemError> {
        Self::builder(problem_matrix).options(options).build()
    }

    fn from_canonical(
        problem_matrix: Mat<f64>,
        constraint_matrix: Mat<f64>,
        thresholds: Vec<f64>,
        num_inequalities: usize,
        options: ProblemOptions,
    ) -> Result<Self, ProblemError> {
        check_regularization("solution norm", options.solution_norm)?;
        check_regularization("constraint norm", options.constraint_norm)?;
        if !(options.tolerance.is_finite() && options.tolerance >= 0.0) {
            return Err(ProblemError::InvalidTolerance {
                value: options.tolerance,
            });
        }

        let n = problem_matrix.ncols();
        let m = problem_matrix.nrows();
        let r = constraint_matrix.nrows();
        let parallelism = Parallelism::None;

        // Normal equations H^T H + solution_norm * I, factored in place.
        let mut factor = Mat::<f64>::zeros(n, n);
        matmul(
            factor.as_mut(),
            problem_matrix.as_ref().transpose(),
            problem_matrix.as_ref(),
            None,
            1.0,
            parallelism,
        );
        let mut max_diag = 0.0f64;
        for i in 0..n {
            let d = factor.read(i, i) + options.solution_norm;
            factor.write(i, i, d);
            max_diag = max_diag.max(d);
        }

        let req = cholesky_in_place_req::<f64>(n, parallelism, Default::default())
            .map_err(|_| ProblemError::WorkspaceOverflow)?;
        let mut buffer = GlobalPodBuffer::try_new(req).map_err(|_| ProblemError::WorkspaceAlloc)?;
        let rank_deficient = ProblemError::RankDeficient {
            solution_norm: options.solution_norm,
        };
        cholesky_in_place(
            factor.as_mut(),
            Default::default(),
            parallelism,
            PodStack::new(&mut buffer),
            Default::default(),
        )
        .map_err(|_| rank_deficient.clone())?;
        if !pivots_are_stable(factor.as_ref(), max_diag) {
            return Err(rank_deficient);
        }
        for j in 1..n {
            for i in 0..j {
                factor.write(i, j, 0.0);
            }
        }

        let mut whitening = Mat::from_fn(n, m, |i, j| problem_matrix.read(j, i));
        solve_lower_triangular_in_place(factor.as_ref(), whitening.as_mut(), parallelism);

        let mut whitened_constraints = Mat::from_fn(n, r, |i, j| constraint_matrix.read(j, i));
        solve_lower_triangular_in_place(
            factor.as_ref(),
            whitened_constraints.as_mut(),
            parallelism,
        );

        let mut gram = Mat::<f64>::zeros(r, r);
        matmul(
            gram.as_mut(),
            whitened_constraints.as_ref().transpose(),
            whitened_constraints.as_ref(),
            None,
            1.0,
            parallelism,
        );

        let factor_req = cholesky_in_place_req::<f64>(r, parallelism, Default::default())
            .map_err(|_| ProblemError::WorkspaceOverflow)?;
        let solve_req = solve_in_place_req::<f64>(r, 1, parallelism)
            .map_err(|_| ProblemError::WorkspaceOverflow)?;
        let workspace = factor_req
            .try_or(solve_req)
            .map_err(|_| ProblemError::WorkspaceOverflow)?;

        let max_iterations = if options.max_iterations == 0 {
            10 * n
        } else {
            options.max_iterations
        };

        Ok(Self {
            problem_matrix,
            constraint_matrix,
            thresholds,
            num_inequalities,
            factor,
            whitening,
            whitened_constraints,
            gram,
            max_iterations,
            tolerance: options.tolerance,
            solution_norm: options.solution_norm,
            constraint_norm: options.constraint_norm,
            workspace,
        })
    }

    /// Number of measurements `m` (rows of `H`).
    pub fn num_measurements(&self) -> usize {
        self.problem_matrix.nrows()
    }

    /// Number of parameters `n` (columns of `H`).
    pub fn num_parameters(&self) -> usize {
        self.problem_matrix.ncols()
    }

    /// Total number of constraint rows, inequalities and equalities.
    pub fn num_constraints(&self) -> usize {
        self.constraint_matrix.nrows()
    }

    pub fn num_inequalities(&self) -> usize {
        self.num_inequalities
    }

    pub fn num_equalities(&self) -> usize {
        self.num_constraints() - self.num_inequalities
    }

    /// Iteration cap with the `10 * n` default already applied.
    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn solution_norm(&self) -> f64 {
        self.solution_norm
    }

    pub fn constraint_norm(&self) -> f64 {
        self.constraint_norm
    }

    /// The measurement matrix `H`.
    pub fn problem_matrix(&self) -> MatRef<'_, f64> {
        self.problem_matrix.as_ref()
    }

    /// Canonical constraint matrix: inequality rows, then equality rows.
    pub fn constraint_matrix(&self) -> MatRef<'_, f64> {
        self.constraint_matrix.as_ref()
    }

    /// Thresholds in the same row order as [`Self::constraint_matrix`].
    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    /// Compute the predicted measurements `H x` into `out`.
    pub fn predict(&self, x: &[f64], out: &mut [f64]) -> Result<(), SolveError> {
        let (m, n) = (self.num_measurements(), self.num_parameters());
        if x.len() != n {
            return Err(SolveError::DimensionMismatch {
                what: "solution vector length",
                expected: n,
                actual: x.len(),
            });
        }
        if out.len() != m {
            return Err(SolveError::DimensionMismatch {
                what: "prediction vector length",
                expected: m,
                actual: out.len(),
            });
        }
        matmul(
            mat::from_column_major_slice_mut::<f64>(out, m, 1),
            self.problem_matrix.as_ref(),
            mat::from_column_major_slice::<f64>(x, n, 1),
            None,
            1.0,
            Parallelism::None,
        );
        Ok(())
    }

    pub(crate) fn factor(&self) -> MatRef<'_, f64> {
        self.factor.as_ref()
    }

    pub(crate) fn whitening(&self) -> MatRef<'_, f64> {
        self.whitening.as_ref()
    }

    pub(crate) fn whitened_constraints(&self) -> MatRef<'_, f64> {
        self.whitened_constraints.as_ref()
    }

    pub(crate) fn gram(&self) -> MatRef<'_, f64> {
        self.gram.as_ref()
    }

    pub(crate) fn workspace(&self) -> StackReq {
        self.workspace
    }
}

fn identity(n: usize) -> Mat<f64> {
    Mat::from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 })
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), ProblemError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ProblemError::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}

fn check_regularization(name: &'static str, value: f64) -> Result<(), ProblemError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ProblemError::InvalidRegularization { name, value })
    }
}

/// Rejects factorizations whose smallest pivot is lost in rounding relative to
/// the largest diagonal entry of the factored matrix.
pub(crate) fn pivots_are_stable(factor: MatRef<'_, f64>, max_diag: f64) -> bool {
    let n = factor.nrows();
    let floor = f64::EPSILON * n as f64 * max_diag;
    (0..n).all(|i| {
        let pivot = factor.read(i, i);
        pivot.is_finite() && pivot * pivot > floor
    })
}
