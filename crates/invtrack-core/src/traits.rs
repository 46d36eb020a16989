use nalgebra::{DMatrix, DVector};

use crate::error::DynamicsError;
use crate::types::{
    ConnectorId, EffectorId, ExciterId, ForceLinearization, Integrator, KktCoefficients,
    MotionSource, SourcePose,
};

// ---------------------------------------------------------------------------
// MechModel
// ---------------------------------------------------------------------------

/// The mechanical model whose actuators the controller drives.
///
/// Positions and velocities are the model's *active* state: the dynamic
/// components, with attachments already folded in.
pub trait MechModel {
    /// Size of the active velocity state.
    fn active_vel_state_size(&self) -> usize;

    /// Current active velocity.
    fn active_velocity(&self) -> DVector<f64>;

    /// Integrator the model advances with.
    fn integrator(&self) -> Integrator;

    /// Number of exciter channels.
    fn num_exciters(&self) -> usize;

    /// Excitation of an exciter channel.
    fn excitation(&self, id: ExciterId) -> Result<f64, DynamicsError>;

    /// Set the excitation of an exciter channel. Cached forces are not
    /// recomputed until the next [`update_forces`](Self::update_forces).
    fn set_excitation(&mut self, id: ExciterId, value: f64) -> Result<(), DynamicsError>;

    /// Recompute bilateral constraint Jacobians for time `t`.
    fn update_constraints(&mut self, t: f64);

    /// Recompute the active forces at time `t` from the current state and
    /// excitations.
    fn update_forces(&mut self, t: f64);

    /// Cached active forces.
    fn active_forces(&self) -> DVector<f64>;

    /// Overwrite the cached active forces.
    fn set_active_forces(&mut self, forces: &DVector<f64>);

    /// Number of bilateral constraint rows.
    fn num_bilateral_constraints(&self) -> usize;

    /// Current position of a motion source.
    fn source_pose(&self, source: MotionSource) -> Result<SourcePose, DynamicsError>;

    /// Current velocity of a motion source (3 or 6 components).
    fn source_velocity(&self, source: MotionSource) -> Result<DVector<f64>, DynamicsError>;

    /// Stacked velocity Jacobian of `sources` with respect to the active
    /// velocity, attachments reduced onto their masters.
    fn velocity_jacobian(&self, sources: &[MotionSource]) -> Result<DMatrix<f64>, DynamicsError>;

    /// Number of constraint force components of a connector.
    fn connector_size(&self, connector: ConnectorId) -> Result<usize, DynamicsError>;

    /// Selection matrix mapping all bilateral constraint forces to the
    /// stacked forces of `connectors`.
    fn constraint_force_jacobian(
        &self,
        connectors: &[ConnectorId],
    ) -> Result<DMatrix<f64>, DynamicsError>;

    /// Current force of an effector with its position/velocity derivatives.
    fn force_linearization(&self, effector: EffectorId) -> Result<ForceLinearization, DynamicsError>;

    /// Stiffness matrix `-df/dx` of the active state at the current
    /// excitations. Not necessarily symmetric.
    fn stiffness_matrix(&self) -> DMatrix<f64>;
}

// ---------------------------------------------------------------------------
// DynamicsSolver
// ---------------------------------------------------------------------------

/// Velocity and constraint forces returned by a KKT solve.
#[derive(Debug, Clone, PartialEq)]
pub struct KktSolution {
    pub velocity: DVector<f64>,
    /// Bilateral constraint forces.
    pub lambda: DVector<f64>,
}

/// Constrained linear solves on the model's dynamics.
pub trait DynamicsSolver {
    /// Refresh cached state sizes after structural changes.
    fn update_state_sizes(&mut self);

    /// Assemble the active mass matrix at time `t`.
    fn update_mass_matrix(&mut self, t: f64);

    /// `M * v` for the active mass matrix.
    fn mul_active_inertias(&self, v: &DVector<f64>) -> DVector<f64>;

    /// Add fictitious (velocity-dependent inertial) forces to `f`.
    fn add_mass_forces(&self, f: &mut DVector<f64>, t: f64);

    /// Factor `[S G^T; G 0]` with `S = M + a0*Dv + a1*Dx` and solve for the
    /// end-of-step velocity, given the right-hand side `M*v + h*f` and the
    /// start-of-step velocity `vel0`.
    fn kkt_factor_and_solve(
        &mut self,
        rhs: &DVector<f64>,
        vel0: &DVector<f64>,
        h: f64,
        coeffs: KktCoefficients,
    ) -> Result<KktSolution, DynamicsError>;

    /// Solve with the last factorization and a homogeneous constraint
    /// right-hand side.
    fn kkt_solve(&self, rhs: &DVector<f64>) -> Result<KktSolution, DynamicsError>;

    /// Constraint forces of the last factor-and-solve.
    fn lambda(&self) -> DVector<f64>;
}

/// A model that can also be linearized by the controller.
pub trait MechSystem: MechModel + DynamicsSolver {}

impl<T: MechModel + DynamicsSolver> MechSystem for T {}
