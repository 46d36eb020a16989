//! Dense factorization of the constrained dynamics KKT system.

use invtrack_core::{DynamicsError, KktSolution};
use nalgebra::{DMatrix, DVector, Dyn, LU};

/// Pivot ratio below which the KKT matrix is treated as singular.
const SINGULAR_PIVOT_RATIO: f64 = 1e-13;

/// LU factorization of `[S -G^T; G 0]`.
///
/// The multiplier block is an impulse; [`solve`](Self::solve) divides it by
/// the step size so callers see constraint forces.
#[derive(Clone, Debug)]
pub struct KktFactorization {
    lu: LU<f64, Dyn, Dyn>,
    n: usize,
    h: f64,
}

impl KktFactorization {
    /// Factor the KKT matrix for system matrix `s` (n x n) and constraint
    /// Jacobian `g` (c x n).
    pub fn factor(s: &DMatrix<f64>, g: &DMatrix<f64>, h: f64) -> Result<Self, DynamicsError> {
        let n = s.nrows();
        if g.ncols() != n {
            return Err(DynamicsError::DimensionMismatch {
                expected: n,
                got: g.ncols(),
            });
        }
        let c = g.nrows();
        let size = n + c;

        let mut kkt = DMatrix::zeros(size, size);
        kkt.view_mut((0, 0), (n, n)).copy_from(s);
        kkt.view_mut((0, n), (n, c)).copy_from(&(-g.transpose()));
        kkt.view_mut((n, 0), (c, n)).copy_from(g);

        let lu = kkt.lu();
        if size > 0 {
            let pivots = lu.u().diagonal().map(f64::abs);
            let max = pivots.max();
            let min = pivots.min();
            if !(max > 0.0 && min / max > SINGULAR_PIVOT_RATIO) {
                return Err(DynamicsError::SingularKkt { size });
            }
        }
        Ok(Self { lu, n, h })
    }

    /// Number of velocity rows.
    pub const fn vel_size(&self) -> usize {
        self.n
    }

    /// Solve for velocity and constraint forces given the momentum
    /// right-hand side and the constraint velocity right-hand side.
    pub fn solve(
        &self,
        rhs: &DVector<f64>,
        constraint_rhs: &DVector<f64>,
    ) -> Result<KktSolution, DynamicsError> {
        if rhs.len() != self.n {
            return Err(DynamicsError::DimensionMismatch {
                expected: self.n,
                got: rhs.len(),
            });
        }
        let c = constraint_rhs.len();
        let mut full = DVector::zeros(self.n + c);
        full.rows_mut(0, self.n).copy_from(rhs);
        full.rows_mut(self.n, c).copy_from(constraint_rhs);

        let sol = self.lu.solve(&full).ok_or(DynamicsError::SingularKkt {
            size: self.n + c,
        })?;
        if sol.iter().any(|v| !v.is_finite()) {
            return Err(DynamicsError::SingularKkt { size: self.n + c });
        }

        let velocity = sol.rows(0, self.n).into_owned();
        let lambda = if self.h > 0.0 {
            sol.rows(self.n, c) / self.h
        } else {
            sol.rows(self.n, c).into_owned()
        };
        Ok(KktSolution { velocity, lambda })
    }
}
