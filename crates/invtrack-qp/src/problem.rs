//! Dense QP data.

use nalgebra::{DMatrix, DVector};

/// Dense quadratic program `min 1/2 x^T Q x + p^T x` s.t. `A x >= b`,
/// `Aeq x = beq`.
#[derive(Clone, Debug, PartialEq)]
pub struct QpProblem {
    /// Quadratic cost (n x n), symmetric positive semidefinite.
    pub q: DMatrix<f64>,
    /// Linear cost (n).
    pub p: DVector<f64>,
    /// Inequality matrix (rows x n).
    pub a: DMatrix<f64>,
    /// Inequality lower bounds.
    pub b: DVector<f64>,
    /// Equality matrix (rows x n).
    pub aeq: DMatrix<f64>,
    /// Equality right-hand side.
    pub beq: DVector<f64>,
}

impl QpProblem {
    /// Unconstrained problem with zero cost over `n` variables.
    pub fn new(n: usize) -> Self {
        Self::with_rows(n, 0, 0)
    }

    /// Zero problem with the given number of inequality and equality rows.
    pub fn with_rows(n: usize, n_ineq: usize, n_eq: usize) -> Self {
        Self {
            q: DMatrix::zeros(n, n),
            p: DVector::zeros(n),
            a: DMatrix::zeros(n_ineq, n),
            b: DVector::zeros(n_ineq),
            aeq: DMatrix::zeros(n_eq, n),
            beq: DVector::zeros(n_eq),
        }
    }

    /// Resize all buffers and fill them with zeros.
    ///
    /// Buffers whose shape already matches are zeroed in place.
    pub fn reset(&mut self, n: usize, n_ineq: usize, n_eq: usize) {
        reset_matrix(&mut self.q, n, n);
        reset_vector(&mut self.p, n);
        reset_matrix(&mut self.a, n_ineq, n);
        reset_vector(&mut self.b, n_ineq);
        reset_matrix(&mut self.aeq, n_eq, n);
        reset_vector(&mut self.beq, n_eq);
    }

    pub fn num_vars(&self) -> usize {
        self.p.len()
    }

    pub fn num_inequalities(&self) -> usize {
        self.b.len()
    }

    pub fn num_equalities(&self) -> usize {
        self.beq.len()
    }

    /// Objective value at `x`.
    pub fn objective(&self, x: &DVector<f64>) -> f64 {
        0.5 * x.dot(&(&self.q * x)) + self.p.dot(x)
    }

    /// Largest constraint violation at `x` (zero if feasible).
    pub fn max_violation(&self, x: &DVector<f64>) -> f64 {
        let ineq = (&self.b - &self.a * x).iter().fold(0.0_f64, |m, &r| m.max(r));
        let eq = (&self.aeq * x - &self.beq)
            .iter()
            .fold(0.0_f64, |m, &r| m.max(r.abs()));
        ineq.max(eq)
    }
}

fn reset_matrix(m: &mut DMatrix<f64>, rows: usize, cols: usize) {
    if m.shape() == (rows, cols) {
        m.fill(0.0);
    } else {
        *m = DMatrix::zeros(rows, cols);
    }
}

fn reset_vector(v: &mut DVector<f64>, len: usize) {
    if v.len() == len {
        v.fill(0.0);
    } else {
        *v = DVector::zeros(len);
    }
}
