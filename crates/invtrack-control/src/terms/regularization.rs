//! Excitation regularization terms.

use invtrack_core::{ControlError, ExcitationMode};
use nalgebra::{DMatrix, DVector};

use crate::term::{add_least_squares_cost, CostTerm, TermBase, TermContext};

// ---------------------------------------------------------------------------
// L2RegularizationTerm
// ---------------------------------------------------------------------------

/// Penalizes `sum_j r_j a_j^2` of the absolute excitations, with the
/// per-actuator regularization weights `r`.
#[derive(Clone, Debug)]
pub struct L2RegularizationTerm {
    base: TermBase,
}

impl L2RegularizationTerm {
    pub fn new(weight: f64) -> Self {
        Self {
            base: TermBase::new("l2 regularization", weight),
        }
    }
}

impl_term!(L2RegularizationTerm);

impl CostTerm for L2RegularizationTerm {
    fn add_cost(
        &mut self,
        q: &mut DMatrix<f64>,
        p: &mut DVector<f64>,
        ctx: &mut TermContext<'_>,
    ) -> Result<(), ControlError> {
        let sqrt_r = ctx.actuators.regularization_weights().map(f64::sqrt);
        let h = DMatrix::from_diagonal(&sqrt_r);
        // Penalize the absolute excitation `offset + x`.
        let b = -ctx.excitation_offset().component_mul(&sqrt_r);
        add_least_squares_cost(&self.base, q, p, h, b);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DampingTerm
// ---------------------------------------------------------------------------

/// Penalizes the excitation change over the step, `||a_next - a|| / sqrt(h)`.
#[derive(Clone, Debug)]
pub struct DampingTerm {
    base: TermBase,
}

impl DampingTerm {
    pub fn new(weight: f64) -> Self {
        Self {
            base: TermBase::new("damping", weight),
        }
    }
}

impl_term!(DampingTerm);

impl CostTerm for DampingTerm {
    fn add_cost(
        &mut self,
        q: &mut DMatrix<f64>,
        p: &mut DVector<f64>,
        ctx: &mut TermContext<'_>,
    ) -> Result<(), ControlError> {
        let m = ctx.num_vars();
        let scale = 1.0 / ctx.h.sqrt();
        let h = DMatrix::identity(m, m) * scale;
        let b = match ctx.mode {
            ExcitationMode::Holistic => ctx.excitations * scale,
            ExcitationMode::Incremental { .. } => DVector::zeros(m),
        };
        add_least_squares_cost(&self.base, q, p, h, b);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProportionalTerm
// ---------------------------------------------------------------------------

/// Linear cost `w * r^T x`, pushing excitations toward their lower bound.
#[derive(Clone, Debug)]
pub struct ProportionalTerm {
    base: TermBase,
}

impl ProportionalTerm {
    pub fn new(weight: f64) -> Self {
        Self {
            base: TermBase::new("proportional", weight),
        }
    }
}

impl_term!(ProportionalTerm);

impl CostTerm for ProportionalTerm {
    fn add_cost(
        &mut self,
        _q: &mut DMatrix<f64>,
        p: &mut DVector<f64>,
        ctx: &mut TermContext<'_>,
    ) -> Result<(), ControlError> {
        *p += ctx.actuators.regularization_weights() * self.base.weight;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use invtrack_core::ExciterId;
    use invtrack_test_utils::mocks::NullModel;

    use crate::actuator::{Actuator, ActuatorSet};
    use crate::response::ExcitationResponse;

    fn actuators(weights: &[f64]) -> ActuatorSet {
        let mut set = ActuatorSet::new();
        for (i, &w) in weights.iter().enumerate() {
            set.add(Actuator::new(ExciterId(i), format!("a{i}")).with_regularization_weight(w))
                .unwrap();
        }
        set
    }

    fn fold(
        term: &mut dyn CostTerm,
        mode: ExcitationMode,
        excitations: &DVector<f64>,
        set: &ActuatorSet,
    ) -> (DMatrix<f64>, DVector<f64>) {
        let m = set.len();
        let response = ExcitationResponse::default();
        let mut model = NullModel;
        let mut ctx = TermContext {
            t0: 0.1,
            t1: 0.11,
            h: 0.01,
            mode,
            excitations,
            response: &response,
            actuators: set,
            model: &mut model,
        };
        let mut q = DMatrix::zeros(m, m);
        let mut p = DVector::zeros(m);
        term.add_cost(&mut q, &mut p, &mut ctx).unwrap();
        (q, p)
    }

    #[test]
    fn l2_uses_regularization_weights() {
        let set = actuators(&[1.0, 4.0]);
        let a = DVector::zeros(2);
        let (q, p) = fold(&mut L2RegularizationTerm::new(0.5), ExcitationMode::Holistic, &a, &set);
        assert_relative_eq!(q[(0, 0)], 0.5);
        assert_relative_eq!(q[(1, 1)], 2.0);
        assert_relative_eq!(p, DVector::zeros(2));
    }

    #[test]
    fn l2_incremental_penalizes_absolute_value() {
        let set = actuators(&[1.0]);
        let a = DVector::from_element(1, 0.3);
        let mode = ExcitationMode::Incremental { delta: 1e-3 };
        let (q, p) = fold(&mut L2RegularizationTerm::new(1.0), mode, &a, &set);
        // minimizer of (0.3 + dx)^2 is dx = -0.3
        assert_relative_eq!(-p[0] / q[(0, 0)], -0.3, epsilon = 1e-12);
    }

    #[test]
    fn damping_holistic_pulls_toward_current() {
        let set = actuators(&[1.0]);
        let a = DVector::from_element(1, 0.4);
        let (q, p) = fold(&mut DampingTerm::new(2.0), ExcitationMode::Holistic, &a, &set);
        assert_relative_eq!(q[(0, 0)], 2.0 / 0.01, epsilon = 1e-9);
        assert_relative_eq!(-p[0] / q[(0, 0)], 0.4, epsilon = 1e-12);
    }

    #[test]
    fn damping_incremental_pulls_toward_zero_increment() {
        let set = actuators(&[1.0]);
        let a = DVector::from_element(1, 0.4);
        let mode = ExcitationMode::Incremental { delta: 1e-3 };
        let (_, p) = fold(&mut DampingTerm::new(1.0), mode, &a, &set);
        assert_relative_eq!(p[0], 0.0);
    }

    #[test]
    fn proportional_is_linear_only() {
        let set = actuators(&[1.0, 3.0]);
        let a = DVector::zeros(2);
        let (q, p) = fold(&mut ProportionalTerm::new(0.1), ExcitationMode::Holistic, &a, &set);
        assert_relative_eq!(q, DMatrix::zeros(2, 2));
        assert_relative_eq!(p[1], 0.3, epsilon = 1e-12);
    }
}
