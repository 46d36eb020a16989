//! Excitation-response linearization.
//!
//! Each step the response model computes the end-of-step velocity `u0` and
//! constraint forces `lam0` with the baseline excitation, then one column
//! `Hu[:, j]`, `Hlam[:, j]` per actuator describing how the velocity and
//! constraint forces change per unit excitation of actuator `j`:
//!
//! ```text
//! u(x)   = u0   + Hu   * x
//! lam(x) = lam0 + Hlam * x
//! ```
//!
//! In holistic mode the baseline is zero excitation and `x` is the absolute
//! excitation. In incremental mode the baseline is the current excitation,
//! `x` is an increment, and the columns are forward differences of size
//! `delta`.

use invtrack_core::{
    step_size, ControlError, DynamicsError, ExcitationMode, Integrator, IntegratorChoice,
    KktCoefficients, MechSystem,
};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::actuator::ActuatorSet;

/// Response quantities of one step.
#[derive(Clone, Debug)]
pub struct ExcitationResponse {
    /// Step size, rounded to the nanosecond.
    pub h: f64,
    pub mode: ExcitationMode,
    pub integrator: Integrator,
    /// Active velocity at the start of the step.
    pub current_velocity: DVector<f64>,
    /// Baseline end-of-step velocity.
    pub u0: DVector<f64>,
    /// Baseline constraint forces.
    pub lam0: DVector<f64>,
    /// Velocity response columns (n x m).
    pub hu: DMatrix<f64>,
    /// Constraint force response columns (c x m).
    pub hlam: DMatrix<f64>,
    /// `J * u0` for the motion Jacobian supplied to the update.
    pub v0: DVector<f64>,
    /// `J * Hu` for the motion Jacobian supplied to the update.
    pub hv: DMatrix<f64>,
}

impl Default for ExcitationResponse {
    fn default() -> Self {
        Self {
            h: 0.0,
            mode: ExcitationMode::Holistic,
            integrator: Integrator::BackwardEuler,
            current_velocity: DVector::zeros(0),
            u0: DVector::zeros(0),
            lam0: DVector::zeros(0),
            hu: DMatrix::zeros(0, 0),
            hlam: DMatrix::zeros(0, 0),
            v0: DVector::zeros(0),
            hv: DMatrix::zeros(0, 0),
        }
    }
}

impl ExcitationResponse {
    pub fn num_actuators(&self) -> usize {
        self.hu.ncols()
    }

    /// Predicted end-of-step velocity for QP variable `x`.
    pub fn predicted_velocity(&self, x: &DVector<f64>) -> DVector<f64> {
        &self.u0 + &self.hu * x
    }

    /// Predicted constraint forces for QP variable `x`.
    pub fn predicted_lambda(&self, x: &DVector<f64>) -> DVector<f64> {
        &self.lam0 + &self.hlam * x
    }
}

/// Computes [`ExcitationResponse`] from a [`MechSystem`].
#[derive(Clone, Debug, Default)]
pub struct ExcitationResponseModel {
    integrator: IntegratorChoice,
    response: ExcitationResponse,
}

impl ExcitationResponseModel {
    pub fn new(integrator: IntegratorChoice) -> Self {
        Self {
            integrator,
            response: ExcitationResponse::default(),
        }
    }

    pub const fn integrator_choice(&self) -> IntegratorChoice {
        self.integrator
    }

    pub fn set_integrator_choice(&mut self, integrator: IntegratorChoice) {
        self.integrator = integrator;
    }

    /// Response of the last successful update.
    pub const fn response(&self) -> &ExcitationResponse {
        &self.response
    }

    /// Recompute the response for the step `t0 -> t1`.
    ///
    /// Actuator excitations are restored to their pre-call values before
    /// returning, on success and on failure, and forces are recomputed at
    /// `t1` with the restored excitations.
    pub fn update<S: MechSystem>(
        &mut self,
        sys: &mut S,
        actuators: &ActuatorSet,
        t0: f64,
        t1: f64,
        mode: ExcitationMode,
        motion_jacobian: Option<&DMatrix<f64>>,
    ) -> Result<&ExcitationResponse, ControlError> {
        let snapshot = actuators.snapshot(&*sys)?;
        let result = self.compute(sys, actuators, t0, t1, mode);
        actuators.restore(&mut *sys, &snapshot)?;
        sys.update_forces(t1);

        let mut response = result?;
        match motion_jacobian {
            Some(jm) => {
                if jm.ncols() != response.u0.len() {
                    return Err(DynamicsError::DimensionMismatch {
                        expected: response.u0.len(),
                        got: jm.ncols(),
                    }
                    .into());
                }
                response.v0 = jm * &response.u0;
                response.hv = jm * &response.hu;
            }
            None => {
                response.v0 = DVector::zeros(0);
                response.hv = DMatrix::zeros(0, response.hu.ncols());
            }
        }
        self.response = response;
        Ok(&self.response)
    }

    fn compute<S: MechSystem>(
        &self,
        sys: &mut S,
        actuators: &ActuatorSet,
        t0: f64,
        t1: f64,
        mode: ExcitationMode,
    ) -> Result<ExcitationResponse, ControlError> {
        let h = step_size(t0, t1);
        sys.update_state_sizes();
        let m = actuators.len();

        let current = actuators.read(&*sys)?;
        let baseline = match mode {
            ExcitationMode::Holistic => DVector::zeros(m),
            ExcitationMode::Incremental { .. } => current,
        };
        let vel = sys.active_velocity();

        sys.update_mass_matrix(t0);
        sys.update_constraints(t1);
        actuators.write(&mut *sys, &baseline)?;
        let fp = net_forces(sys, t0, t1);

        let integrator = self.integrator.resolve(sys.integrator());
        let coeffs = KktCoefficients::for_integrator(integrator, h);
        let bf = sys.mul_active_inertias(&vel) + &fp * h;
        let base = sys.kkt_factor_and_solve(&bf, &vel, h, coeffs)?;

        let n = base.velocity.len();
        let c = base.lambda.len();
        let mut hu = DMatrix::zeros(n, m);
        let mut hlam = DMatrix::zeros(c, m);
        let upper = actuators.upper_bounds();

        for j in 0..m {
            let delta = step_delta(mode, baseline[j], upper[j]);
            actuators.write_one(&mut *sys, j, baseline[j] + delta)?;
            let f = net_forces(sys, t0, t1);
            actuators.write_one(&mut *sys, j, baseline[j])?;

            let sol = sys.kkt_solve(&((f - &fp) * h))?;
            hu.set_column(j, &(sol.velocity / delta));
            hlam.set_column(j, &(sol.lambda / delta));
        }

        debug!(
            h,
            n,
            m,
            constraints = c,
            ?integrator,
            incremental = mode.is_incremental(),
            "excitation response updated"
        );

        Ok(ExcitationResponse {
            h,
            mode,
            integrator,
            current_velocity: vel,
            u0: base.velocity,
            lam0: base.lambda,
            hu,
            hlam,
            v0: DVector::zeros(0),
            hv: DMatrix::zeros(0, m),
        })
    }
}

/// Excitation step used to perturb one actuator from `baseline`: a unit step
/// in holistic mode, `delta` in incremental mode, flipped downward when it
/// would cross `upper`. The lower bound is not checked.
pub fn step_delta(mode: ExcitationMode, baseline: f64, upper: f64) -> f64 {
    match mode {
        ExcitationMode::Holistic => 1.0,
        ExcitationMode::Incremental { delta } if baseline + delta > upper => -delta,
        ExcitationMode::Incremental { delta } => delta,
    }
}

/// Active forces at `t1` plus fictitious forces at `t0`.
fn net_forces<S: MechSystem>(sys: &mut S, t0: f64, t1: f64) -> DVector<f64> {
    sys.update_forces(t1);
    let mut f = sys.active_forces();
    sys.add_mass_forces(&mut f, t0);
    f
}

/// Relative difference `|a - b| / mean(|a|, |b|)`, or the absolute
/// difference when both are near zero.
pub fn relative_error(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    let mag = (a.norm() + b.norm()) / 2.0;
    let err = (a - b).norm();
    if mag > 1e-8 {
        err / mag
    } else {
        err
    }
}
