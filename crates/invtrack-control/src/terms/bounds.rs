//! Box bounds on the excitations.
//!
//! Both terms write `2*m` inequality rows, `x >= lb` then `-x >= -ub`. In
//! incremental mode the QP variable is an increment, so the bounds are
//! shifted by the current excitation.

use std::any::Any;

use invtrack_core::{ConfigError, ConstraintType, ControlError};
use nalgebra::{DMatrix, DVector};

use crate::term::{ConstraintTerm, Term, TermBase, TermContext};

fn write_bounds(
    a: &mut DMatrix<f64>,
    b: &mut DVector<f64>,
    row_offset: usize,
    lower: &DVector<f64>,
    upper: &DVector<f64>,
    offset: &DVector<f64>,
    weight: f64,
) -> usize {
    let m = lower.len();
    for j in 0..m {
        a[(row_offset + j, j)] = weight;
        b[row_offset + j] = weight * (lower[j] - offset[j]);
        a[(row_offset + m + j, j)] = -weight;
        b[row_offset + m + j] = -weight * (upper[j] - offset[j]);
    }
    row_offset + 2 * m
}

// ---------------------------------------------------------------------------
// BoundsTerm
// ---------------------------------------------------------------------------

/// The same `[lower, upper]` bounds on every excitation.
#[derive(Clone, Debug)]
pub struct BoundsTerm {
    base: TermBase,
    lower: f64,
    upper: f64,
}

impl BoundsTerm {
    pub fn new(lower: f64, upper: f64) -> Result<Self, ConfigError> {
        if lower > upper {
            return Err(ConfigError::InvalidBounds { lower, upper });
        }
        Ok(Self {
            base: TermBase::new("bounds", 1.0),
            lower,
            upper,
        })
    }

    pub const fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    pub fn set_bounds(&mut self, lower: f64, upper: f64) -> Result<(), ConfigError> {
        if lower > upper {
            return Err(ConfigError::InvalidBounds { lower, upper });
        }
        self.lower = lower;
        self.upper = upper;
        Ok(())
    }
}

impl Term for BoundsTerm {
    fn base(&self) -> &TermBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TermBase {
        &mut self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ConstraintTerm for BoundsTerm {
    fn constraint_type(&self) -> ConstraintType {
        ConstraintType::Inequality
    }

    fn num_constraints(&self, num_vars: usize) -> usize {
        2 * num_vars
    }

    fn add_constraints(
        &mut self,
        a: &mut DMatrix<f64>,
        b: &mut DVector<f64>,
        row_offset: usize,
        ctx: &mut TermContext<'_>,
    ) -> Result<usize, ControlError> {
        let m = ctx.num_vars();
        let lower = DVector::from_element(m, self.lower);
        let upper = DVector::from_element(m, self.upper);
        let offset = ctx.excitation_offset();
        Ok(write_bounds(
            a,
            b,
            row_offset,
            &lower,
            &upper,
            &offset,
            self.base.weight,
        ))
    }
}

// ---------------------------------------------------------------------------
// NonuniformBoundsTerm
// ---------------------------------------------------------------------------

/// Per-excitation bounds.
#[derive(Clone, Debug)]
pub struct NonuniformBoundsTerm {
    base: TermBase,
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl Default for NonuniformBoundsTerm {
    fn default() -> Self {
        Self {
            base: TermBase::new("excitation bounds", 1.0),
            lower: DVector::zeros(0),
            upper: DVector::zeros(0),
        }
    }
}

impl NonuniformBoundsTerm {
    pub fn new(lower: DVector<f64>, upper: DVector<f64>) -> Result<Self, ConfigError> {
        let mut term = Self::default();
        term.set_bounds(lower, upper)?;
        Ok(term)
    }

    pub fn set_bounds(&mut self, lower: DVector<f64>, upper: DVector<f64>) -> Result<(), ConfigError> {
        if lower.len() != upper.len() {
            return Err(ConfigError::ExcitationSizeMismatch {
                expected: lower.len(),
                got: upper.len(),
            });
        }
        if let Some((&l, &u)) = lower.iter().zip(upper.iter()).find(|(l, u)| l > u) {
            return Err(ConfigError::InvalidBounds { lower: l, upper: u });
        }
        self.lower = lower;
        self.upper = upper;
        Ok(())
    }

    pub const fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    pub const fn upper(&self) -> &DVector<f64> {
        &self.upper
    }
}

impl Term for NonuniformBoundsTerm {
    fn base(&self) -> &TermBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TermBase {
        &mut self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    /// New entries default to `[0, 1]`.
    fn set_size(&mut self, num_vars: usize) {
        if self.lower.len() != num_vars {
            self.lower = self.lower.clone().resize_vertically(num_vars, 0.0);
            self.upper = self.upper.clone().resize_vertically(num_vars, 1.0);
        }
    }
}

impl ConstraintTerm for NonuniformBoundsTerm {
    fn constraint_type(&self) -> ConstraintType {
        ConstraintType::Inequality
    }

    fn num_constraints(&self, num_vars: usize) -> usize {
        2 * num_vars
    }

    fn add_constraints(
        &mut self,
        a: &mut DMatrix<f64>,
        b: &mut DVector<f64>,
        row_offset: usize,
        ctx: &mut TermContext<'_>,
    ) -> Result<usize, ControlError> {
        let m = ctx.num_vars();
        if self.lower.len() != m {
            return Err(ConfigError::ExcitationSizeMismatch {
                expected: m,
                got: self.lower.len(),
            }
            .into());
        }
        let offset = ctx.excitation_offset();
        Ok(write_bounds(
            a,
            b,
            row_offset,
            &self.lower,
            &self.upper,
            &offset,
            self.base.weight,
        ))
    }
}
