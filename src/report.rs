use std::time::Duration;

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets};

/// How a solve ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// The active constraint set stopped changing.
    ConvergedActiveSet,
    /// The last update moved the solution by no more than the tolerance.
    ConvergedTolerance,
    /// The iteration cap was reached; the last iterate is returned.
    MaxIterations,
    /// An active constraint system could not be factored; the last good
    /// iterate is returned.
    NumericalFailure,
    /// The constraints admit no solution; the last iterate is returned.
    Infeasible,
}

impl SolveStatus {
    pub fn is_converged(self) -> bool {
        matches!(self, Self::ConvergedActiveSet | Self::ConvergedTolerance)
    }
}

#[derive(Debug, Clone)]
pub struct SolverStats {
    pub status: SolveStatus,
    /// Constraints added to or dropped from the active set. Equals the
    /// problem's iteration cap when the solve ran out of iterations.
    pub iterations: usize,
    /// Constraints (equalities included) active in the returned solution.
    pub active_constraints: usize,
    /// Norm of the last change in the solution.
    pub step_norm: f64,
    /// Largest inequality violation `max(t - Cx, 0)` of the returned solution.
    pub max_violation: f64,
}

impl SolverStats {
    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }
}

#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    pub active: usize,
    pub added: usize,
    pub removed: usize,
    /// Violation of the constraint being added, before the step.
    pub max_violation: f64,
    pub step_norm: f64,
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

pub(crate) fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3} us", secs * 1e6)
    } else {
        format!("{:.0} ns", secs * 1e9)
    }
}

pub trait Reporter {
    fn on_iteration(&mut self, report: &IterationReport);
    fn on_finish(&mut self) {}
}

/// Collects iteration reports and prints them as a table when the solve ends.
pub struct TableReporter {
    rows: Vec<IterationReport>,
}

impl TableReporter {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }
}

impl Default for TableReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for TableReporter {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        if !log::log_enabled!(log::Level::Info) {
            println!();
        }
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(["iter", "active", "added", "removed", "violation", "step"].map(right));
        for row in &self.rows {
            table.add_row(vec![
                right(row.iteration),
                right(row.active),
                right(row.added),
                right(row.removed),
                right(format!("{:.3e}", row.max_violation)),
                right(format!("{:.3e}", row.step_norm)),
            ]);
        }

        for line in table.to_string().lines() {
            emit_line(line);
        }
        self.rows.clear();
    }
}

fn right<T: ToString>(content: T) -> Cell {
    Cell::new(content).set_alignment(CellAlignment::Right)
}
