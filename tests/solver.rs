use faer_core::Mat;
use icls_rs::{
    ConstrainedProblem, ConstrainedSolver, IterationReport, ProblemError, ProblemOptions,
    Reporter, SolveStatus, TableReporter,
};

fn dense(rows: &[&[f64]]) -> Mat<f64> {
    Mat::from_fn(rows.len(), rows[0].len(), |i, j| rows[i][j])
}

fn identity(n: usize) -> Mat<f64> {
    Mat::from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 })
}

struct Lcg(u64);

impl Lcg {
    /// Uniform in [-1, 1).
    fn next(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
    }
}

fn near_identity(m: usize, n: usize, noise: f64, rng: &mut Lcg) -> Mat<f64> {
    let mut values = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            let diagonal = if i == j { 1.0 } else { 0.0 };
            values[i * n + j] = diagonal + noise * rng.next();
        }
    }
    Mat::from_fn(m, n, |i, j| values[i * n + j])
}

fn solve(problem: &ConstrainedProblem, y: &[f64]) -> (Vec<f64>, SolveStatus, usize) {
    let mut solver = ConstrainedSolver::new(problem);
    let mut x = vec![0.0; problem.num_parameters()];
    let stats = solver.solve(y, &mut x).unwrap();
    (x, stats.status, stats.iterations)
}

fn assert_converged(status: SolveStatus) {
    assert!(status.is_converged(), "unexpected status: {status:?}");
}

/// Gaussian elimination with partial pivoting on a row-major square system.
fn dense_solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&r, &s| a[r][col].abs().total_cmp(&a[s][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in 0..n {
            if row != col {
                let factor = a[row][col] / a[col][col];
                for k in col..n {
                    a[row][k] -= factor * a[col][k];
                }
                b[row] -= factor * b[col];
            }
        }
    }
    Some((0..n).map(|i| b[i] / a[i][i]).collect())
}

/// Best feasible KKT point over every subset of active inequality rows.
fn exhaustive_solution(problem: &ConstrainedProblem, y: &[f64]) -> Vec<f64> {
    let h = problem.problem_matrix();
    let c = problem.constraint_matrix();
    let t = problem.thresholds();
    let (m, n) = (h.nrows(), h.ncols());
    let p = problem.num_inequalities();
    let r = problem.num_constraints();

    let mut best: Option<(f64, Vec<f64>)> = None;
    for subset in 0..(1usize << p) {
        let rows: Vec<usize> = (0..p)
            .filter(|i| subset >> i & 1 == 1)
            .chain(p..r)
            .collect();
        let size = n + rows.len();
        let mut a = vec![vec![0.0; size]; size];
        let mut b = vec![0.0; size];
        for i in 0..n {
            for j in 0..n {
                a[i][j] = (0..m).map(|k| h.read(k, i) * h.read(k, j)).sum();
            }
            b[i] = (0..m).map(|k| h.read(k, i) * y[k]).sum();
        }
        for (q, &row) in rows.iter().enumerate() {
            for j in 0..n {
                a[n + q][j] = c.read(row, j);
                a[j][n + q] = c.read(row, j);
            }
            b[n + q] = t[row];
        }
        let Some(solution) = dense_solve(a, b) else {
            continue;
        };
        let x = solution[..n].to_vec();
        let feasible = (0..r).all(|i| {
            let value: f64 = (0..n).map(|j| c.read(i, j) * x[j]).sum();
            value >= t[i] - 1e-9
        });
        if !feasible {
            continue;
        }
        let cost: f64 = (0..m)
            .map(|k| {
                let fitted: f64 = (0..n).map(|j| h.read(k, j) * x[j]).sum();
                (fitted - y[k]).powi(2)
            })
            .sum();
        if best.as_ref().map_or(true, |(best_cost, _)| cost < *best_cost) {
            best = Some((cost, x));
        }
    }
    best.expect("no feasible subset").1
}

#[test]
fn clips_negative_component_to_boundary() {
    let problem = ConstrainedProblem::non_negative(identity(2), ProblemOptions::default()).unwrap();
    let (x, status, iterations) = solve(&problem, &[-1.0, 2.0]);
    assert_converged(status);
    assert_eq!(iterations, 1);
    assert!(x[0].abs() <= 1e-12);
    assert!((x[1] - 2.0).abs() <= 1e-12);
}

#[test]
fn trailing_rows_become_equalities() {
    let problem = ConstrainedProblem::builder(identity(2))
        .inequality(identity(2))
        .threshold(vec![0.0, 1.0])
        .num_equalities(1)
        .build()
        .unwrap();
    let (x, status, _) = solve(&problem, &[-1.0, 5.0]);
    assert_converged(status);
    assert!(x[0].abs() <= 1e-12);
    assert!((x[1] - 1.0).abs() <= 1e-12);
}

#[test]
fn explicit_equality_block() {
    let problem = ConstrainedProblem::builder(identity(2))
        .equality(dense(&[&[1.0, 1.0]]))
        .equality_values(vec![1.0])
        .build()
        .unwrap();
    assert_eq!(problem.num_inequalities(), 2);
    assert_eq!(problem.num_equalities(), 1);
    let (x, status, _) = solve(&problem, &[2.0, -3.0]);
    assert_converged(status);
    assert!((x[0] - 1.0).abs() <= 1e-12);
    assert!(x[1].abs() <= 1e-12);
}

#[test]
fn column_mismatch_fails_at_setup() {
    let h = Mat::from_fn(5, 3, |i, j| (i + j) as f64);
    let err = ConstrainedProblem::builder(h)
        .inequality(identity(4))
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        ProblemError::DimensionMismatch {
            expected: 3,
            actual: 4,
            ..
        }
    ));
}

#[test]
fn matches_exhaustive_active_set_search() {
    let mut rng = Lcg(42);
    let h = near_identity(5, 3, 0.2, &mut rng);
    let a = Mat::from_fn(4, 3, |i, j| match i {
        3 => -1.0,
        _ if i == j => 1.0,
        _ => 0.0,
    });
    let problem = ConstrainedProblem::builder(h)
        .inequality(a)
        .threshold(vec![0.0, 0.0, 0.0, -1.5])
        .build()
        .unwrap();

    for _ in 0..20 {
        let y: Vec<f64> = (0..5).map(|_| 2.0 * rng.next()).collect();
        let (x, status, _) = solve(&problem, &y);
        assert_converged(status);
        let expected = exhaustive_solution(&problem, &y);
        for (got, want) in x.iter().zip(&expected) {
            assert!((got - want).abs() <= 1e-9, "x={x:?} expected={expected:?}");
        }
        for (i, &xi) in x.iter().enumerate() {
            assert!(xi >= -1e-12, "component {i} negative: {x:?}");
        }
        assert!(x.iter().sum::<f64>() <= 1.5 + 1e-12);
    }
}

#[test]
fn equality_rows_hold_exactly() {
    let mut rng = Lcg(7);
    let h = near_identity(5, 3, 0.2, &mut rng);
    let a = Mat::from_fn(4, 3, |i, j| if i == 3 || i == j { 1.0 } else { 0.0 });
    let problem = ConstrainedProblem::builder(h)
        .inequality(a)
        .threshold(vec![0.0, 0.0, 0.0, 1.0])
        .num_equalities(1)
        .build()
        .unwrap();

    for _ in 0..20 {
        let y: Vec<f64> = (0..5).map(|_| 2.0 * rng.next()).collect();
        let (x, status, _) = solve(&problem, &y);
        assert_converged(status);
        assert!((x.iter().sum::<f64>() - 1.0).abs() <= 1e-12, "x={x:?}");
        let expected = exhaustive_solution(&problem, &y);
        for (got, want) in x.iter().zip(&expected) {
            assert!((got - want).abs() <= 1e-9);
        }
    }
}

#[test]
fn repeated_solves_are_identical() {
    let mut rng = Lcg(3);
    let h = near_identity(6, 4, 0.3, &mut rng);
    let problem = ConstrainedProblem::non_negative(h, ProblemOptions::default()).unwrap();
    let y: Vec<f64> = (0..6).map(|_| rng.next()).collect();

    let mut solver = ConstrainedSolver::new(&problem);
    let mut first = vec![0.0; 4];
    let mut second = vec![0.0; 4];
    let stats_first = solver.solve(&y, &mut first).unwrap();
    let stats_second = solver.solve(&y, &mut second).unwrap();
    assert_eq!(first, second);
    assert_eq!(stats_first.iterations, stats_second.iterations);

    let (fresh, _, iterations) = solve(&problem, &y);
    assert_eq!(first, fresh);
    assert_eq!(stats_first.iterations, iterations);
}

#[test]
fn tighter_tolerance_never_stops_earlier() {
    let mut rng = Lcg(11);
    let h = near_identity(8, 5, 0.5, &mut rng);
    let ys: Vec<Vec<f64>> = (0..10)
        .map(|_| (0..8).map(|_| 2.0 * rng.next()).collect())
        .collect();

    let tolerances = [1.0, 0.5, 0.1, 1e-3, 0.0];
    for y in &ys {
        let mut previous = 0;
        for &tolerance in &tolerances {
            let problem = ConstrainedProblem::non_negative(
                h.clone(),
                ProblemOptions {
                    tolerance,
                    ..ProblemOptions::default()
                },
            )
            .unwrap();
            let (_, _, iterations) = solve(&problem, y);
            assert!(
                iterations >= previous,
                "tolerance {tolerance} stopped after {iterations} < {previous}"
            );
            previous = iterations;
        }
    }
}

#[test]
fn feasible_measurement_matches_unconstrained_least_squares() {
    let h = dense(&[&[1.0, 0.5], &[0.2, 1.0], &[1.0, 1.0], &[0.0, 2.0]]);
    let x_true = [1.0, 2.0];
    let y: Vec<f64> = (0..4)
        .map(|i| h.read(i, 0) * x_true[0] + h.read(i, 1) * x_true[1])
        .collect();
    let problem = ConstrainedProblem::non_negative(h, ProblemOptions::default()).unwrap();
    let (x, status, iterations) = solve(&problem, &y);
    assert_eq!(status, SolveStatus::ConvergedActiveSet);
    assert_eq!(iterations, 0);
    assert!((x[0] - 1.0).abs() <= 1e-10);
    assert!((x[1] - 2.0).abs() <= 1e-10);
}

#[test]
fn solution_norm_shrinks_solution() {
    let problem = ConstrainedProblem::non_negative(
        identity(2),
        ProblemOptions {
            solution_norm: 1.0,
            ..ProblemOptions::default()
        },
    )
    .unwrap();
    let (x, status, _) = solve(&problem, &[2.0, 2.0]);
    assert_converged(status);
    assert!((x[0] - 1.0).abs() <= 1e-12);
    assert!((x[1] - 1.0).abs() <= 1e-12);
}

#[test]
fn constraint_norm_relaxes_active_constraints() {
    let problem = ConstrainedProblem::non_negative(
        identity(2),
        ProblemOptions {
            constraint_norm: 1.0,
            ..ProblemOptions::default()
        },
    )
    .unwrap();
    let mut solver = ConstrainedSolver::new(&problem);
    let mut x = [0.0; 2];
    let stats = solver.solve(&[-1.0, 2.0], &mut x).unwrap();
    assert_converged(stats.status);
    assert!((x[0] + 0.5).abs() <= 1e-12);
    assert!((x[1] - 2.0).abs() <= 1e-12);
    assert!((stats.max_violation - 0.5).abs() <= 1e-12);
}

#[test]
fn duplicate_equalities_are_skipped() {
    let problem = ConstrainedProblem::builder(identity(2))
        .inequality(dense(&[&[1.0, 0.0], &[1.0, 0.0]]))
        .threshold(vec![1.0, 1.0])
        .num_equalities(2)
        .build()
        .unwrap();
    let (x, status, _) = solve(&problem, &[3.0, 4.0]);
    assert_converged(status);
    assert!((x[0] - 1.0).abs() <= 1e-12);
    assert!((x[1] - 4.0).abs() <= 1e-12);
}

#[test]
fn iteration_cap_reports_non_convergence() {
    let problem = ConstrainedProblem::non_negative(
        identity(3),
        ProblemOptions {
            max_iterations: 1,
            ..ProblemOptions::default()
        },
    )
    .unwrap();
    let (x, status, iterations) = solve(&problem, &[-1.0, 2.0, -3.0]);
    assert_eq!(status, SolveStatus::MaxIterations);
    assert_eq!(iterations, problem.max_iterations());
    // The last iterate is still returned: only the worst row was clipped.
    assert!((x[0] + 1.0).abs() <= 1e-12);
    assert!((x[1] - 2.0).abs() <= 1e-12);
    assert!(x[2].abs() <= 1e-12);
}

/// `H` with entries in [0, 1) and `A_ij = cos(0.37 i j)`; `x = 0` is always
/// feasible but many more rows than parameters compete for the active set.
fn cosine_problem(m: usize, n: usize, p: usize, rng: &mut Lcg) -> ConstrainedProblem {
    let mut values = vec![0.0; m * n];
    for value in values.iter_mut() {
        *value = 0.5 * (rng.next() + 1.0);
    }
    let h = Mat::from_fn(m, n, |i, j| values[i * n + j]);
    let a = Mat::from_fn(p, n, |i, j| (0.37 * (i * j) as f64).cos());
    ConstrainedProblem::builder(h)
        .inequality(a)
        .build()
        .unwrap()
}

fn worst_violation(problem: &ConstrainedProblem, x: &[f64]) -> f64 {
    let c = problem.constraint_matrix();
    let t = problem.thresholds();
    (0..c.nrows())
        .map(|i| t[i] - (0..c.ncols()).map(|j| c.read(i, j) * x[j]).sum::<f64>())
        .fold(0.0, f64::max)
}

#[test]
fn wide_constraint_block_matches_exhaustive_search() {
    let mut rng = Lcg(5);
    let problem = cosine_problem(6, 3, 8, &mut rng);
    for _ in 0..30 {
        let y: Vec<f64> = (0..6).map(|_| rng.next()).collect();
        let (x, status, _) = solve(&problem, &y);
        assert_converged(status);
        let expected = exhaustive_solution(&problem, &y);
        for (got, want) in x.iter().zip(&expected) {
            assert!((got - want).abs() <= 1e-8, "x={x:?} expected={expected:?}");
        }
    }
}

#[test]
fn wide_constraint_blocks_converge_to_feasible_points() {
    for (seed, m, n, p, count) in [(17, 30, 6, 40, 200), (19, 20, 15, 100, 40)] {
        let mut rng = Lcg(seed);
        let problem = cosine_problem(m, n, p, &mut rng);
        let mut solver = ConstrainedSolver::new(&problem);
        let mut x = vec![0.0; n];
        for _ in 0..count {
            let y: Vec<f64> = (0..m).map(|_| rng.next()).collect();
            let stats = solver.solve(&y, &mut x).unwrap();
            assert_eq!(stats.status, SolveStatus::ConvergedActiveSet, "{m}x{n}, {p} rows");
            assert!(stats.iterations < problem.max_iterations());
            assert!(worst_violation(&problem, &x) <= 1e-9, "x={x:?}");
            assert!(stats.max_violation <= 1e-9);
        }
    }
}

#[derive(Default)]
struct Collect {
    rows: Vec<IterationReport>,
    finished: usize,
}

impl Reporter for Collect {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self) {
        self.finished += 1;
    }
}

#[test]
fn reporter_sees_each_update() {
    let problem = ConstrainedProblem::non_negative(identity(3), ProblemOptions::default()).unwrap();
    let mut solver = ConstrainedSolver::new(&problem);
    let mut x = [0.0; 3];
    let mut collect = Collect::default();
    let stats = solver
        .solve_with_reporter(&[-1.0, 2.0, -3.0], &mut x, Some(&mut collect))
        .unwrap();
    assert_eq!(stats.iterations, 2);
    assert_eq!(stats.active_constraints, 2);
    assert_eq!(collect.finished, 1);
    assert_eq!(collect.rows.len(), 2);
    let first = &collect.rows[0];
    assert_eq!((first.iteration, first.active, first.added, first.removed), (0, 1, 1, 0));
    assert!((first.max_violation - 3.0).abs() <= 1e-12);
    let second = &collect.rows[1];
    assert_eq!((second.iteration, second.active, second.added, second.removed), (1, 2, 1, 0));
    assert!((second.max_violation - 1.0).abs() <= 1e-12);

    let mut table = TableReporter::new();
    let again = solver
        .solve_with_reporter(&[-1.0, 2.0, -3.0], &mut x, Some(&mut table))
        .unwrap();
    assert_eq!(again.iterations, 2);
}

#[test]
fn ratio_test_drops_blocking_constraint() {
    let problem = ConstrainedProblem::builder(identity(2))
        .inequality(dense(&[&[2.0, 2.0], &[-1.0, 1.0], &[0.0, 1.0]]))
        .threshold(vec![1.0, 1.0, 1.0])
        .build()
        .unwrap();
    let mut solver = ConstrainedSolver::new(&problem);
    let mut x = [0.0; 2];
    let mut collect = Collect::default();
    let stats = solver
        .solve_with_reporter(&[1.0, -2.0], &mut x, Some(&mut collect))
        .unwrap();
    assert_eq!(stats.status, SolveStatus::ConvergedActiveSet);
    assert_eq!(stats.iterations, 4);
    assert_eq!(collect.rows.iter().map(|row| row.removed).sum::<usize>(), 1);
    assert!(x[0].abs() <= 1e-12);
    assert!((x[1] - 1.0).abs() <= 1e-12);

    let expected = exhaustive_solution(&problem, &[1.0, -2.0]);
    assert!((x[0] - expected[0]).abs() <= 1e-10);
    assert!((x[1] - expected[1]).abs() <= 1e-10);
}
