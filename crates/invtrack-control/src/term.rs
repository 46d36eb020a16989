//! QP term abstraction.
//!
//! A term contributes either to the quadratic cost (`CostTerm`) or to the
//! linear constraints (`ConstraintTerm`) of the per-step QP. Most terms are
//! least-squares terms: they build a matrix `H` and vector `b` and ask for
//! `H x ~= b`. As a cost this folds into
//!
//! ```text
//! Q += w * H^T H
//! p -= w * H^T b
//! ```
//!
//! so the contribution is linear in the weight `w`. Formulations that scale
//! `H` and `b` by the weight before folding are quadratic in it instead: a
//! weight `w'` from such a setup corresponds to `w = w'^2` here. As a
//! constraint the rows `w*H`, `w*b` are copied into `A`/`b` or `Aeq`/`beq`.

use std::any::Any;

use invtrack_core::{is_session_start, ConstraintType, ControlError, ExcitationMode, MechModel};
use nalgebra::{DMatrix, DVector};

use crate::actuator::ActuatorSet;
use crate::response::ExcitationResponse;

// ---------------------------------------------------------------------------
// TermBase
// ---------------------------------------------------------------------------

/// Name, weight and enable flag shared by every term.
#[derive(Clone, Debug, PartialEq)]
pub struct TermBase {
    pub name: String,
    pub weight: f64,
    pub enabled: bool,
    /// Divide `H` and `b` by the Frobenius norm of `H` before weighting.
    pub normalize_h: bool,
}

impl TermBase {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            enabled: true,
            normalize_h: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Common interface of QP terms.
pub trait Term: Any {
    fn base(&self) -> &TermBase;

    fn base_mut(&mut self) -> &mut TermBase;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn name(&self) -> &str {
        &self.base().name
    }

    fn weight(&self) -> f64 {
        self.base().weight
    }

    fn set_weight(&mut self, weight: f64) {
        self.base_mut().weight = weight;
    }

    fn is_enabled(&self) -> bool {
        self.base().enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.base_mut().enabled = enabled;
    }

    /// Fix dimensions that depend on the number of actuators. Idempotent.
    fn set_size(&mut self, _num_vars: usize) {}
}

/// A term that adds to the quadratic and linear cost.
pub trait CostTerm: Term {
    /// Add this term's contribution to `q` (n x n) and `p` (n).
    fn add_cost(
        &mut self,
        q: &mut DMatrix<f64>,
        p: &mut DVector<f64>,
        ctx: &mut TermContext<'_>,
    ) -> Result<(), ControlError>;
}

/// A term that writes linear constraint rows.
pub trait ConstraintTerm: Term {
    fn constraint_type(&self) -> ConstraintType;

    /// Number of rows [`add_constraints`](Self::add_constraints) will write
    /// for `num_vars` QP variables.
    fn num_constraints(&self, num_vars: usize) -> usize;

    /// Write rows starting at `row_offset` and return the next free row.
    ///
    /// Rows of `a`/`b` outside the written range must not be touched.
    fn add_constraints(
        &mut self,
        a: &mut DMatrix<f64>,
        b: &mut DVector<f64>,
        row_offset: usize,
        ctx: &mut TermContext<'_>,
    ) -> Result<usize, ControlError>;
}

// ---------------------------------------------------------------------------
// TermContext
// ---------------------------------------------------------------------------

/// Everything a term may read while contributing to one step's QP.
pub struct TermContext<'a> {
    pub t0: f64,
    pub t1: f64,
    pub h: f64,
    pub mode: ExcitationMode,
    /// Current actuator excitations.
    pub excitations: &'a DVector<f64>,
    pub response: &'a ExcitationResponse,
    pub actuators: &'a ActuatorSet,
    pub model: &'a mut dyn MechModel,
}

impl TermContext<'_> {
    /// Number of QP variables.
    pub fn num_vars(&self) -> usize {
        self.actuators.len()
    }

    /// Whether `t0` is the start of a session.
    pub fn is_session_start(&self) -> bool {
        is_session_start(self.t0)
    }

    /// Value to add to the QP variable to get the absolute excitation:
    /// zero in holistic mode, the current excitation in incremental mode.
    pub fn excitation_offset(&self) -> DVector<f64> {
        match self.mode {
            ExcitationMode::Holistic => DVector::zeros(self.excitations.len()),
            ExcitationMode::Incremental { .. } => self.excitations.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Least-squares helpers
// ---------------------------------------------------------------------------

/// Divide `h` and `b` by `||h||_F` (no-op for a zero matrix).
pub fn normalize(h: &mut DMatrix<f64>, b: &mut DVector<f64>) {
    let fnorm = h.norm();
    if fnorm > 0.0 {
        *h /= fnorm;
        *b /= fnorm;
    }
}

/// Fold the least-squares pair `(h, b)` into `(q, p)` with weight `w`.
pub fn fold_least_squares(
    q: &mut DMatrix<f64>,
    p: &mut DVector<f64>,
    h: &DMatrix<f64>,
    b: &DVector<f64>,
    weight: f64,
) {
    *q += h.tr_mul(h) * weight;
    *p -= h.tr_mul(b) * weight;
}

/// Copy `w*h`, `w*rhs` into rows `row_offset..` of `(a, b)` and return the
/// next free row.
pub fn copy_rows(
    a: &mut DMatrix<f64>,
    b: &mut DVector<f64>,
    row_offset: usize,
    h: &DMatrix<f64>,
    rhs: &DVector<f64>,
    weight: f64,
) -> usize {
    let rows = h.nrows();
    a.view_mut((row_offset, 0), (rows, h.ncols()))
        .copy_from(&(h * weight));
    b.rows_mut(row_offset, rows).copy_from(&(rhs * weight));
    row_offset + rows
}

/// Fold a least-squares pair as a cost, honoring the base's normalize flag.
pub fn add_least_squares_cost(
    base: &TermBase,
    q: &mut DMatrix<f64>,
    p: &mut DVector<f64>,
    mut h: DMatrix<f64>,
    mut b: DVector<f64>,
) {
    if base.normalize_h {
        normalize(&mut h, &mut b);
    }
    fold_least_squares(q, p, &h, &b, base.weight);
}

/// Copy a least-squares pair as constraint rows, honoring the base's
/// normalize flag.
pub fn add_least_squares_rows(
    base: &TermBase,
    a: &mut DMatrix<f64>,
    b: &mut DVector<f64>,
    row_offset: usize,
    mut h: DMatrix<f64>,
    mut rhs: DVector<f64>,
) -> usize {
    if base.normalize_h {
        normalize(&mut h, &mut rhs);
    }
    copy_rows(a, b, row_offset, &h, &rhs, base.weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn fold_is_linear_in_weight() {
        let h = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, -1.0]);

        let mut q1 = DMatrix::zeros(2, 2);
        let mut p1 = DVector::zeros(2);
        fold_least_squares(&mut q1, &mut p1, &h, &b, 1.0);

        let mut q3 = DMatrix::zeros(2, 2);
        let mut p3 = DVector::zeros(2);
        fold_least_squares(&mut q3, &mut p3, &h, &b, 3.0);

        assert_relative_eq!(q3, &q1 * 3.0, epsilon = 1e-12);
        assert_relative_eq!(p3, &p1 * 3.0, epsilon = 1e-12);
        assert_relative_eq!(q1[(0, 1)], 2.0);
        assert_relative_eq!(p1[1], -(2.0 - 3.0));
    }

    #[test]
    fn normalize_scales_by_frobenius_norm() {
        let mut h = DMatrix::from_row_slice(1, 2, &[3.0, 4.0]);
        let mut b = DVector::from_vec(vec![10.0]);
        normalize(&mut h, &mut b);
        assert_relative_eq!(h.norm(), 1.0);
        assert_relative_eq!(b[0], 2.0);

        let mut zero = DMatrix::zeros(1, 2);
        let mut b0 = DVector::from_vec(vec![1.0]);
        normalize(&mut zero, &mut b0);
        assert_relative_eq!(b0[0], 1.0);
    }

    #[test]
    fn copy_rows_touches_only_its_block() {
        let mut a = DMatrix::from_element(4, 2, 9.0);
        let mut b = DVector::from_element(4, 9.0);
        let h = DMatrix::identity(2, 2);
        let rhs = DVector::from_vec(vec![1.0, 2.0]);
        let next = copy_rows(&mut a, &mut b, 1, &h, &rhs, 2.0);
        assert_eq!(next, 3);
        assert_relative_eq!(a[(0, 0)], 9.0);
        assert_relative_eq!(a[(1, 0)], 2.0);
        assert_relative_eq!(a[(2, 1)], 2.0);
        assert_relative_eq!(b[2], 4.0);
        assert_relative_eq!(b[3], 9.0);
    }
}
