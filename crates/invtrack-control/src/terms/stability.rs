//! Keeps the symmetric stiffness above a target determinant.
//!
//! The determinant of `K_sym = (K + K^T) / 2` is linearized in the
//! excitations by forward differences and written as a single inequality
//! row. When `K_sym` is not positive definite at the current excitations or
//! at any perturbation, or no target is set, the row is the sentinel `0 x >= 0`.

use invtrack_core::{ConstraintType, ControlError, ExcitationMode, MechModel};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::actuator::ActuatorSet;
use crate::term::{ConstraintTerm, TermBase, TermContext};

const DEFAULT_DELTA: f64 = 1e-3;

#[derive(Clone, Debug)]
pub struct StabilityTerm {
    base: TermBase,
    target_determinant: Option<f64>,
    delta: f64,
    last_determinant: Option<f64>,
}

impl Default for StabilityTerm {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StabilityTerm {
    pub fn new(target_determinant: Option<f64>) -> Self {
        Self {
            base: TermBase::new("stability", 1.0),
            target_determinant,
            delta: DEFAULT_DELTA,
            last_determinant: None,
        }
    }

    /// Excitation step of the finite-difference gradient.
    #[must_use]
    pub const fn with_delta(mut self, delta: f64) -> Self {
        self.delta = delta;
        self
    }

    pub const fn target_determinant(&self) -> Option<f64> {
        self.target_determinant
    }

    pub fn set_target_determinant(&mut self, target: Option<f64>) {
        self.target_determinant = target;
    }

    /// Determinant of the symmetric stiffness at the last step, if it was
    /// positive definite.
    pub const fn last_determinant(&self) -> Option<f64> {
        self.last_determinant
    }

    /// Gradient of `det(K_sym)` with respect to the actuator values, or
    /// `None` when a perturbation leaves the positive-definite cone.
    fn gradient(
        &self,
        model: &mut dyn MechModel,
        actuators: &ActuatorSet,
        current: &DVector<f64>,
        d0: f64,
    ) -> Result<Option<DVector<f64>>, ControlError> {
        let upper = actuators.upper_bounds();
        let mut g = DVector::zeros(current.len());
        for j in 0..current.len() {
            let delta = if current[j] + self.delta > upper[j] {
                -self.delta
            } else {
                self.delta
            };
            actuators.write_one(model, j, current[j] + delta)?;
            let d = spd_determinant(&model.stiffness_matrix());
            actuators.write_one(model, j, current[j])?;
            let Some(d) = d else {
                debug!(actuator = j, delta, "stiffness not positive definite at perturbation");
                return Ok(None);
            };
            g[j] = (d - d0) / delta;
        }
        Ok(Some(g))
    }
}

/// `det(K_sym)` through a Cholesky factorization, or `None` when `K_sym` is
/// not positive definite.
pub fn spd_determinant(k: &DMatrix<f64>) -> Option<f64> {
    if k.is_empty() {
        return None;
    }
    let sym = (k + k.transpose()) * 0.5;
    let chol = sym.cholesky()?;
    let prod: f64 = chol.l_dirty().diagonal().iter().product();
    Some(prod * prod)
}

impl_term!(StabilityTerm);

impl ConstraintTerm for StabilityTerm {
    fn constraint_type(&self) -> ConstraintType {
        ConstraintType::Inequality
    }

    fn num_constraints(&self, _num_vars: usize) -> usize {
        1
    }

    fn add_constraints(
        &mut self,
        a: &mut DMatrix<f64>,
        b: &mut DVector<f64>,
        row_offset: usize,
        ctx: &mut TermContext<'_>,
    ) -> Result<usize, ControlError> {
        let m = ctx.num_vars();
        a.view_mut((row_offset, 0), (1, m)).fill(0.0);
        b[row_offset] = 0.0;

        self.last_determinant = spd_determinant(&ctx.model.stiffness_matrix());
        let (Some(target), Some(d0)) = (self.target_determinant, self.last_determinant) else {
            return Ok(row_offset + 1);
        };

        let snapshot = ctx.actuators.snapshot(&*ctx.model)?;
        let grad = self.gradient(&mut *ctx.model, ctx.actuators, ctx.excitations, d0);
        ctx.actuators.restore(&mut *ctx.model, &snapshot)?;
        let Some(grad) = grad? else {
            return Ok(row_offset + 1);
        };

        let w = self.base.weight;
        let mut rhs = target - d0;
        if ctx.mode == ExcitationMode::Holistic {
            rhs += grad.dot(ctx.excitations);
        }
        for j in 0..m {
            a[(row_offset, j)] = w * grad[j];
        }
        b[row_offset] = w * rhs;
        debug!(d0, target, "stability row");
        Ok(row_offset + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use invtrack_core::{
        ConnectorId, DynamicsError, EffectorId, ExciterId, ForceLinearization, Integrator,
        MotionSource, SourcePose,
    };

    use crate::actuator::Actuator;
    use crate::response::ExcitationResponse;

    /// Two exciters, stiffness `diag(1 + e0, 1 + e1)`.
    struct TunedSprings {
        excitations: [f64; 2],
    }

    impl MechModel for TunedSprings {
        fn active_vel_state_size(&self) -> usize {
            2
        }
        fn active_velocity(&self) -> DVector<f64> {
            DVector::zeros(2)
        }
        fn integrator(&self) -> Integrator {
            Integrator::BackwardEuler
        }
        fn num_exciters(&self) -> usize {
            2
        }
        fn excitation(&self, id: ExciterId) -> Result<f64, DynamicsError> {
            self.excitations
                .get(id.0)
                .copied()
                .ok_or(DynamicsError::UnknownComponent(id.0))
        }
        fn set_excitation(&mut self, id: ExciterId, value: f64) -> Result<(), DynamicsError> {
            let slot = self
                .excitations
                .get_mut(id.0)
                .ok_or(DynamicsError::UnknownComponent(id.0))?;
            *slot = value;
            Ok(())
        }
        fn update_constraints(&mut self, _t: f64) {}
        fn update_forces(&mut self, _t: f64) {}
        fn active_forces(&self) -> DVector<f64> {
            DVector::zeros(2)
        }
        fn set_active_forces(&mut self, _forces: &DVector<f64>) {}
        fn num_bilateral_constraints(&self) -> usize {
            0
        }
        fn source_pose(&self, _source: MotionSource) -> Result<SourcePose, DynamicsError> {
            Err(DynamicsError::UnknownComponent(0))
        }
        fn source_velocity(&self, _source: MotionSource) -> Result<DVector<f64>, DynamicsError> {
            Err(DynamicsError::UnknownComponent(0))
        }
        fn velocity_jacobian(
            &self,
            _sources: &[MotionSource],
        ) -> Result<DMatrix<f64>, DynamicsError> {
            Ok(DMatrix::zeros(0, 2))
        }
        fn connector_size(&self, c: ConnectorId) -> Result<usize, DynamicsError> {
            Err(DynamicsError::UnknownComponent(c.0))
        }
        fn constraint_force_jacobian(
            &self,
            _connectors: &[ConnectorId],
        ) -> Result<DMatrix<f64>, DynamicsError> {
            Ok(DMatrix::zeros(0, 0))
        }
        fn force_linearization(
            &self,
            e: EffectorId,
        ) -> Result<ForceLinearization, DynamicsError> {
            Err(DynamicsError::UnknownComponent(e.0))
        }
        fn stiffness_matrix(&self) -> DMatrix<f64> {
            DMatrix::from_diagonal(&DVector::from_iterator(
                2,
                self.excitations.iter().map(|e| 1.0 + e),
            ))
        }
    }

    fn stability_row(
        term: &mut StabilityTerm,
        model: &mut TunedSprings,
        mode: ExcitationMode,
    ) -> (DMatrix<f64>, DVector<f64>) {
        let mut set = ActuatorSet::new();
        set.add(Actuator::new(ExciterId(0), "a0")).unwrap();
        set.add(Actuator::new(ExciterId(1), "a1")).unwrap();
        let excitations = DVector::from_column_slice(&model.excitations);
        let response = ExcitationResponse::default();
        let mut ctx = TermContext {
            t0: 0.01,
            t1: 0.02,
            h: 0.01,
            mode,
            excitations: &excitations,
            response: &response,
            actuators: &set,
            model,
        };
        let mut a = DMatrix::from_element(1, 2, 9.0);
        let mut b = DVector::from_element(1, 9.0);
        let next = term.add_constraints(&mut a, &mut b, 0, &mut ctx).unwrap();
        assert_eq!(next, 1);
        (a, b)
    }

    #[test]
    fn determinant_of_spd() {
        let k = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 3.0]);
        assert_relative_eq!(spd_determinant(&k).unwrap(), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn determinant_uses_symmetric_part() {
        let k = DMatrix::from_row_slice(2, 2, &[2.0, 2.0, 0.0, 3.0]);
        // K_sym = [[2, 1], [1, 3]]
        assert_relative_eq!(spd_determinant(&k).unwrap(), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn indefinite_or_empty_has_no_determinant() {
        let k = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        assert!(spd_determinant(&k).is_none());
        assert!(spd_determinant(&DMatrix::zeros(0, 0)).is_none());
    }

    #[test]
    fn gradient_row_holistic() {
        let mut model = TunedSprings {
            excitations: [0.5, 0.5],
        };
        let mut term = StabilityTerm::new(Some(3.0));
        let (a, b) = stability_row(&mut term, &mut model, ExcitationMode::Holistic);

        // det = (1 + e0)(1 + e1), gradient (1.5, 1.5) at e = (0.5, 0.5)
        assert_relative_eq!(term.last_determinant().unwrap(), 2.25, epsilon = 1e-12);
        assert_relative_eq!(a[(0, 0)], 1.5, epsilon = 1e-9);
        assert_relative_eq!(a[(0, 1)], 1.5, epsilon = 1e-9);
        assert_relative_eq!(b[0], 3.0 - 2.25 + 1.5, epsilon = 1e-9);
        assert_eq!(model.excitations, [0.5, 0.5]);
    }

    #[test]
    fn gradient_row_incremental_flips_at_bound() {
        let mut model = TunedSprings {
            excitations: [1.0, 0.0],
        };
        let mut term = StabilityTerm::new(Some(3.0));
        let mode = ExcitationMode::Incremental { delta: 1e-3 };
        let (a, b) = stability_row(&mut term, &mut model, mode);

        assert_relative_eq!(a[(0, 0)], 1.0, epsilon = 1e-9);
        assert_relative_eq!(a[(0, 1)], 2.0, epsilon = 1e-9);
        assert_relative_eq!(b[0], 3.0 - 2.0, epsilon = 1e-9);
        assert_eq!(model.excitations, [1.0, 0.0]);
    }

    #[test]
    fn sentinel_row_without_target() {
        let mut model = TunedSprings {
            excitations: [0.5, 0.5],
        };
        let mut term = StabilityTerm::default();
        let (a, b) = stability_row(&mut term, &mut model, ExcitationMode::Holistic);
        assert_relative_eq!(a, DMatrix::zeros(1, 2));
        assert_relative_eq!(b[0], 0.0);
        assert!(term.last_determinant().is_some());
    }

    #[test]
    fn sentinel_row_when_perturbation_is_indefinite() {
        let mut model = TunedSprings {
            excitations: [1.0, 0.0],
        };
        // The downward step of the first actuator reaches 1 + e0 = -0.5.
        let mut term = StabilityTerm::new(Some(3.0)).with_delta(2.5);
        let (a, b) = stability_row(&mut term, &mut model, ExcitationMode::Holistic);
        assert_relative_eq!(a, DMatrix::zeros(1, 2));
        assert_relative_eq!(b[0], 0.0);
        assert_relative_eq!(term.last_determinant().unwrap(), 2.0, epsilon = 1e-12);
        assert_eq!(model.excitations, [1.0, 0.0]);
    }

    #[test]
    fn always_one_row() {
        let term = StabilityTerm::default();
        assert_eq!(term.num_constraints(0), 1);
        assert_eq!(term.num_constraints(5), 1);
        assert_eq!(term.constraint_type(), ConstraintType::Inequality);
    }
}
