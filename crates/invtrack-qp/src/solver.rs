//! QP solve primitive.
//!
//! Clarabel solves `min 1/2 x^T P x + q^T x` s.t. `A x + s = b`, `s` in a
//! product of cones. Equalities go into a zero cone. The `A x >= b` rows are
//! negated into `-A x + s = -b` with `s` in the nonnegative cone.

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettings, DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
    SupportedConeT::{self, NonnegativeConeT, ZeroConeT},
};
use invtrack_core::{QpError, QpSettings, QpStatus};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::problem::QpProblem;

/// Result of a QP solve.
#[derive(Clone, Debug, PartialEq)]
pub struct QpSolution {
    /// Solution vector (meaningful only when `status.is_solved()`).
    pub x: DVector<f64>,
    pub status: QpStatus,
    pub iterations: u32,
}

impl QpSolution {
    /// Convert to the solution vector, failing on a non-success status.
    pub fn into_result(self) -> Result<DVector<f64>, QpError> {
        if self.status.is_solved() {
            Ok(self.x)
        } else {
            Err(QpError::NotSolved(self.status))
        }
    }
}

/// A solver for dense convex QPs.
pub trait QpSolver {
    /// Solve `problem`. Setup failures are errors; convergence failures are
    /// reported through [`QpSolution::status`].
    fn solve(&mut self, problem: &QpProblem) -> Result<QpSolution, QpError>;
}

// ---------------------------------------------------------------------------
// ClarabelQpSolver
// ---------------------------------------------------------------------------

/// Interior-point QP solver backed by Clarabel.
#[derive(Clone, Debug, Default)]
pub struct ClarabelQpSolver {
    settings: QpSettings,
}

impl ClarabelQpSolver {
    pub const fn new(settings: QpSettings) -> Self {
        Self { settings }
    }

    pub const fn settings(&self) -> &QpSettings {
        &self.settings
    }

    fn clarabel_settings(&self) -> Result<DefaultSettings<f64>, QpError> {
        DefaultSettingsBuilder::default()
            .max_iter(self.settings.max_iter)
            .verbose(self.settings.verbose)
            .tol_gap_abs(self.settings.tol_gap)
            .tol_gap_rel(self.settings.tol_gap)
            .tol_feas(self.settings.tol_feas)
            .build()
            .map_err(|e| QpError::Setup(e.to_string()))
    }
}

impl QpSolver for ClarabelQpSolver {
    fn solve(&mut self, problem: &QpProblem) -> Result<QpSolution, QpError> {
        let n = problem.num_vars();
        check_shapes(problem)?;
        if n == 0 {
            return Ok(QpSolution {
                x: DVector::zeros(0),
                status: QpStatus::Solved,
                iterations: 0,
            });
        }

        let n_eq = problem.num_equalities();
        let n_ineq = problem.num_inequalities();

        // Stack [Aeq; -A] with rhs [beq; -b].
        let mut a_all = DMatrix::zeros(n_eq + n_ineq, n);
        let mut b_all = Vec::with_capacity(n_eq + n_ineq);
        a_all.view_mut((0, 0), (n_eq, n)).copy_from(&problem.aeq);
        a_all
            .view_mut((n_eq, 0), (n_ineq, n))
            .copy_from(&(-&problem.a));
        b_all.extend(problem.beq.iter().copied());
        b_all.extend(problem.b.iter().map(|v| -v));

        let mut cones: Vec<SupportedConeT<f64>> = Vec::with_capacity(2);
        if n_eq > 0 {
            cones.push(ZeroConeT(n_eq));
        }
        if n_ineq > 0 {
            cones.push(NonnegativeConeT(n_ineq));
        }

        let p_csc = dmatrix_to_csc_upper_tri(&symmetrize(&problem.q));
        let a_csc = dmatrix_to_csc(&a_all);
        let q_slice: Vec<f64> = problem.p.iter().copied().collect();

        let settings = self.clarabel_settings()?;
        let mut solver = DefaultSolver::new(&p_csc, &q_slice, &a_csc, &b_all, &cones, settings)
            .map_err(|e| QpError::Setup(format!("{e:?}")))?;
        solver.solve();

        let sol = &solver.solution;
        let status = map_status(sol.status);
        let mut x = DVector::from_column_slice(&sol.x);
        let snapped = if status.is_solved() {
            snap_to_bounds(problem, &mut x, self.settings.bound_snap)
        } else {
            0
        };
        debug!(
            n,
            n_eq,
            n_ineq,
            iterations = sol.iterations,
            snapped,
            ?status,
            "clarabel solve finished"
        );

        Ok(QpSolution {
            x,
            status,
            iterations: sol.iterations,
        })
    }
}

fn check_shapes(problem: &QpProblem) -> Result<(), QpError> {
    let n = problem.num_vars();
    if problem.q.shape() != (n, n) {
        return Err(QpError::DimensionMismatch(format!(
            "Q is {:?}, expected ({n}, {n})",
            problem.q.shape()
        )));
    }
    if problem.a.ncols() != n || problem.a.nrows() != problem.b.len() {
        return Err(QpError::DimensionMismatch(format!(
            "A is {:?} with {} bounds",
            problem.a.shape(),
            problem.b.len()
        )));
    }
    if problem.aeq.ncols() != n || problem.aeq.nrows() != problem.beq.len() {
        return Err(QpError::DimensionMismatch(format!(
            "Aeq is {:?} with {} values",
            problem.aeq.shape(),
            problem.beq.len()
        )));
    }
    Ok(())
}

/// Move components of `x` onto single-variable inequality bounds lying
/// within `tol` of them. The interior-point iterates stop strictly inside
/// the feasible set, so a bound that is active at the optimum is otherwise
/// only approached. Returns the number of components moved.
fn snap_to_bounds(problem: &QpProblem, x: &mut DVector<f64>, tol: f64) -> usize {
    if tol <= 0.0 {
        return 0;
    }
    let mut snapped = 0;
    for (row, &bound) in problem.a.row_iter().zip(problem.b.iter()) {
        let mut nonzero = row
            .iter()
            .enumerate()
            .filter(|(_, c)| c.abs() > 1e-15);
        let (Some((j, &coef)), None) = (nonzero.next(), nonzero.next()) else {
            continue;
        };
        let target = bound / coef;
        if (x[j] - target).abs() <= tol {
            x[j] = target;
            snapped += 1;
        }
    }
    snapped
}

#[allow(clippy::match_same_arms)]
fn map_status(status: SolverStatus) -> QpStatus {
    match status {
        SolverStatus::Solved => QpStatus::Solved,
        SolverStatus::AlmostSolved => QpStatus::AlmostSolved,
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
            QpStatus::PrimalInfeasible
        }
        SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => {
            QpStatus::DualInfeasible
        }
        SolverStatus::MaxIterations => QpStatus::MaxIterations,
        SolverStatus::MaxTime => QpStatus::MaxTime,
        _ => QpStatus::NumericalError,
    }
}

fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Convert a nalgebra `DMatrix<f64>` to a Clarabel `CscMatrix<f64>` (full matrix).
fn dmatrix_to_csc(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v.abs() > 1e-15 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Upper triangle of a symmetric `DMatrix<f64>` as a Clarabel `CscMatrix<f64>`.
fn dmatrix_to_csc_upper_tri(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let n = m.ncols();
    let mut colptr = vec![0usize; n + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..n {
        for i in 0..=j {
            let v = m[(i, j)];
            if v.abs() > 1e-15 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(n, n, colptr, rowval, nzval)
}
