//! The tracking controller.
//!
//! Each call to [`TrackingController::apply`] runs one step:
//!
//! 1. linearize the excitation response of the model over `t0 -> t1`,
//! 2. assemble the QP from the motion term, user terms and the permanent
//!    bounds term, and solve it,
//! 3. clip the result to the actuator bounds and write it to the model.
//!
//! Numerical failures (a singular KKT system, a QP that does not converge)
//! are logged and leave the previous excitations in place.

use invtrack_core::{
    is_session_start, step_size, ConfigError, ControlError, ControllerConfig, ExcitationMode,
    ExciterId, MechModel, MechSystem, MotionSource, SourcePose,
};
use invtrack_qp::{ClarabelQpSolver, QpProblem, QpSolution, QpSolver};
use nalgebra::DVector;
use tracing::{debug, warn};

use crate::actuator::{Actuator, ActuatorHandle, ActuatorSet};
use crate::assembler::QpAssembler;
use crate::response::{ExcitationResponse, ExcitationResponseModel};
use crate::term::{ConstraintTerm, CostTerm, Term, TermContext};
use crate::terms::{
    DampingTerm, L2RegularizationTerm, MotionTarget, MotionTargetTerm, NonuniformBoundsTerm,
};

/// Weight of the L2 term added when motion is a hard constraint and no L2
/// weight is configured.
const CONSTRAINT_MODE_L2_WEIGHT: f64 = 1e-3;

/// Handle of a term registered with a [`TrackingController`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TermId(pub usize);

enum TermSlot {
    Cost(Box<dyn CostTerm>),
    Constraint(Box<dyn ConstraintTerm>),
}

impl TermSlot {
    fn term(&self) -> &dyn std::any::Any {
        match self {
            Self::Cost(t) => t.as_any(),
            Self::Constraint(t) => t.as_any(),
        }
    }

    fn term_mut(&mut self) -> &mut dyn std::any::Any {
        match self {
            Self::Cost(t) => t.as_any_mut(),
            Self::Constraint(t) => t.as_any_mut(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Cost(t) => t.name(),
            Self::Constraint(t) => t.name(),
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        match self {
            Self::Cost(t) => t.set_enabled(enabled),
            Self::Constraint(t) => t.set_enabled(enabled),
        }
    }
}

/// Result of one controller step.
#[derive(Debug)]
pub enum StepOutcome {
    /// New excitations were written to the model.
    Applied { excitations: DVector<f64> },
    /// The controller is disabled or has no actuators.
    Skipped,
    /// A numerical failure; the previous excitations were kept.
    Retained { reason: ControlError },
}

impl StepOutcome {
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Computes actuator excitations that make the model track its targets.
pub struct TrackingController {
    config: ControllerConfig,
    actuators: ActuatorSet,
    excitations: DVector<f64>,
    initial_excitations: Option<DVector<f64>>,
    response: ExcitationResponseModel,
    assembler: QpAssembler,
    motion_term: MotionTargetTerm,
    bounds_term: NonuniformBoundsTerm,
    terms: Vec<(TermId, TermSlot)>,
    next_id: usize,
    l2_term: Option<TermId>,
}

impl std::fmt::Debug for TrackingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingController")
            .field("config", &self.config)
            .field("actuators", &self.actuators)
            .field("excitations", &self.excitations)
            .field(
                "terms",
                &self.terms.iter().map(|(_, s)| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl TrackingController {
    /// Create a controller that solves with Clarabel.
    pub fn new(config: ControllerConfig) -> Result<Self, ConfigError> {
        let solver = ClarabelQpSolver::new(config.qp.clone());
        Self::with_solver(config, Box::new(solver))
    }

    /// Create a controller with a custom QP solve primitive.
    pub fn with_solver(
        config: ControllerConfig,
        solver: Box<dyn QpSolver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut ctl = Self {
            response: ExcitationResponseModel::new(config.integrator),
            motion_term: MotionTargetTerm::new(&config.motion),
            assembler: QpAssembler::new(solver),
            actuators: ActuatorSet::new(),
            excitations: DVector::zeros(0),
            initial_excitations: None,
            bounds_term: NonuniformBoundsTerm::default(),
            terms: Vec::new(),
            next_id: 0,
            l2_term: None,
            config,
        };
        let reg = ctl.config.regularization.clone();
        let l2 = match reg.l2 {
            None if ctl.config.motion_as_constraint => Some(CONSTRAINT_MODE_L2_WEIGHT),
            w => w,
        };
        ctl.add_regularization_terms(l2, reg.damping);
        Ok(ctl)
    }

    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub const fn excitation_mode(&self) -> ExcitationMode {
        self.config.mode
    }

    pub fn set_excitation_mode(&mut self, mode: ExcitationMode) -> Result<(), ConfigError> {
        let mut config = self.config.clone();
        config.mode = mode;
        config.validate()?;
        self.config.mode = mode;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Actuators
    // -----------------------------------------------------------------------

    /// Drive `exciter` with the given gain, using the global excitation
    /// bounds.
    pub fn add_exciter(
        &mut self,
        model: &dyn MechModel,
        exciter: ExciterId,
        gain: f64,
    ) -> Result<ActuatorHandle, ControlError> {
        let [lower, upper] = self.config.excitation_bounds;
        let actuator = Actuator::new(exciter, format!("exciter {}", exciter.0))
            .with_gain(gain)
            .with_bounds(lower, upper);
        self.add_actuator(model, actuator)
    }

    pub fn add_actuator(
        &mut self,
        model: &dyn MechModel,
        actuator: Actuator,
    ) -> Result<ActuatorHandle, ControlError> {
        actuator.validate()?;
        let current = model.excitation(actuator.exciter)? / actuator.gain;
        let value = actuator.clamp(current);
        let handle = self.actuators.add(actuator)?;
        let m = self.actuators.len();
        self.excitations = self.excitations.clone().resize_vertically(m, value);
        if let Some(init) = self.initial_excitations.take() {
            self.initial_excitations = Some(init.resize_vertically(m, 0.0));
        }
        Ok(handle)
    }

    /// Remove every actuator.
    pub fn clear_exciters(&mut self) {
        self.actuators.clear();
        self.excitations = DVector::zeros(0);
        self.initial_excitations = None;
    }

    pub fn num_excitations(&self) -> usize {
        self.actuators.len()
    }

    pub const fn actuators(&self) -> &ActuatorSet {
        &self.actuators
    }

    /// Current excitations, one per actuator.
    pub const fn excitations(&self) -> &DVector<f64> {
        &self.excitations
    }

    /// Use the model's current excitations as the values at session start.
    pub fn initialize_excitations(&mut self, model: &dyn MechModel) -> Result<(), ControlError> {
        let values = self.actuators.clamp(&self.actuators.read(model)?);
        self.excitations.clone_from(&values);
        self.initial_excitations = Some(values);
        Ok(())
    }

    /// Excitations to restart from at session start.
    pub fn set_initial_excitations(&mut self, values: &[f64]) -> Result<(), ConfigError> {
        if values.len() != self.actuators.len() {
            return Err(ConfigError::ExcitationSizeMismatch {
                expected: self.actuators.len(),
                got: values.len(),
            });
        }
        self.initial_excitations = Some(DVector::from_column_slice(values));
        Ok(())
    }

    pub fn initial_excitations(&self) -> DVector<f64> {
        self.initial_excitations
            .clone()
            .unwrap_or_else(|| DVector::zeros(self.actuators.len()))
    }

    /// Set the bounds of every actuator and of actuators added later.
    pub fn set_excitation_bounds(&mut self, lower: f64, upper: f64) -> Result<(), ConfigError> {
        self.actuators.set_bounds(lower, upper)?;
        self.config.excitation_bounds = [lower, upper];
        Ok(())
    }

    pub fn set_actuator_bounds(
        &mut self,
        handle: ActuatorHandle,
        lower: f64,
        upper: f64,
    ) -> Result<(), ConfigError> {
        self.actuators.set_actuator_bounds(handle, lower, upper)
    }

    pub const fn max_excitation_jump(&self) -> f64 {
        self.config.max_excitation_jump
    }

    pub fn set_max_excitation_jump(&mut self, jump: f64) -> Result<(), ConfigError> {
        if jump.is_nan() || jump <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "max_excitation_jump".into(),
                message: format!("{jump} (must be > 0)"),
            });
        }
        self.config.max_excitation_jump = jump;
        Ok(())
    }

    /// Clamp per-step excitation changes to the max jump.
    pub fn set_enforce_max_excitation_jump(&mut self, enforce: bool) {
        self.config.enforce_max_excitation_jump = enforce;
    }

    // -----------------------------------------------------------------------
    // Motion targets
    // -----------------------------------------------------------------------

    pub fn add_motion_target(
        &mut self,
        model: &dyn MechModel,
        source: MotionSource,
        weight: f64,
    ) -> Result<usize, ControlError> {
        self.motion_term.add_target(model, source, weight)
    }

    pub fn remove_motion_target(&mut self, source: MotionSource) -> bool {
        self.motion_term.remove_target(source)
    }

    pub fn clear_motion_targets(&mut self) {
        self.motion_term.clear_targets();
    }

    pub fn set_motion_target_weights(&mut self, weights: &[f64]) -> Result<(), ConfigError> {
        self.motion_term.set_target_weights(weights)
    }

    pub fn set_motion_target_position(
        &mut self,
        index: usize,
        pose: SourcePose,
    ) -> Result<(), ConfigError> {
        self.motion_term.set_target_position(index, pose)
    }

    pub fn motion_targets(&self) -> &[MotionTarget] {
        self.motion_term.targets()
    }

    pub fn motion_sources(&self) -> Vec<MotionSource> {
        self.motion_term.sources()
    }

    pub const fn motion_term(&self) -> &MotionTargetTerm {
        &self.motion_term
    }

    pub fn motion_term_mut(&mut self) -> &mut MotionTargetTerm {
        &mut self.motion_term
    }

    /// Scale of the motion term.
    pub fn set_motion_target_weight(&mut self, weight: f64) {
        self.motion_term.set_weight(weight);
    }

    // -----------------------------------------------------------------------
    // Terms
    // -----------------------------------------------------------------------

    fn push_slot(&mut self, slot: TermSlot) -> TermId {
        let id = TermId(self.next_id);
        self.next_id += 1;
        self.terms.push((id, slot));
        id
    }

    pub fn add_cost_term(&mut self, term: Box<dyn CostTerm>) -> TermId {
        self.push_slot(TermSlot::Cost(term))
    }

    pub fn add_constraint_term(&mut self, term: Box<dyn ConstraintTerm>) -> TermId {
        self.push_slot(TermSlot::Constraint(term))
    }

    pub fn remove_term(&mut self, id: TermId) -> bool {
        let before = self.terms.len();
        self.terms.retain(|(i, _)| *i != id);
        if self.l2_term == Some(id) {
            self.l2_term = None;
        }
        self.terms.len() != before
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    /// Names of the registered terms, in solve order.
    pub fn term_names(&self) -> Vec<&str> {
        self.terms.iter().map(|(_, s)| s.name()).collect()
    }

    /// Typed access to a registered term.
    pub fn term<T: 'static>(&self, id: TermId) -> Option<&T> {
        self.terms
            .iter()
            .find(|(i, _)| *i == id)
            .and_then(|(_, s)| s.term().downcast_ref())
    }

    pub fn term_mut<T: 'static>(&mut self, id: TermId) -> Option<&mut T> {
        self.terms
            .iter_mut()
            .find(|(i, _)| *i == id)
            .and_then(|(_, s)| s.term_mut().downcast_mut())
    }

    /// Enable or disable a term. Returns whether the term exists.
    pub fn set_term_enabled(&mut self, id: TermId, enabled: bool) -> bool {
        match self.terms.iter_mut().find(|(i, _)| *i == id) {
            Some((_, slot)) => {
                slot.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Add the L2 excitation term, or update its weight if present.
    pub fn add_l2_regularization_term(&mut self, weight: f64) -> TermId {
        if let Some(id) = self.l2_term {
            if let Some(term) = self.term_mut::<L2RegularizationTerm>(id) {
                term.set_weight(weight);
                return id;
            }
        }
        let id = self.add_cost_term(Box::new(L2RegularizationTerm::new(weight)));
        self.l2_term = Some(id);
        id
    }

    pub fn add_damping_term(&mut self, weight: f64) -> TermId {
        self.add_cost_term(Box::new(DampingTerm::new(weight)))
    }

    pub fn add_regularization_terms(&mut self, l2: Option<f64>, damping: Option<f64>) {
        if let Some(w) = l2 {
            self.add_l2_regularization_term(w);
        }
        if let Some(w) = damping {
            self.add_damping_term(w);
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Response of the last step.
    pub const fn response(&self) -> &ExcitationResponse {
        self.response.response()
    }

    /// The last assembled QP.
    pub const fn last_problem(&self) -> &QpProblem {
        self.assembler.problem()
    }

    pub const fn last_solution(&self) -> Option<&QpSolution> {
        self.assembler.last_solution()
    }

    // -----------------------------------------------------------------------
    // Step
    // -----------------------------------------------------------------------

    /// Compute and apply excitations for the step `t0 -> t1`.
    pub fn apply<S: MechSystem>(
        &mut self,
        sys: &mut S,
        t0: f64,
        t1: f64,
    ) -> Result<StepOutcome, ControlError> {
        if !self.config.enabled || self.actuators.is_empty() {
            return Ok(StepOutcome::Skipped);
        }
        let h = step_size(t0, t1);
        if h <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "step".into(),
                message: format!("t1 ({t1}) must be after t0 ({t0})"),
            }
            .into());
        }

        let saved_forces = sys.active_forces();
        if is_session_start(t0) {
            self.excitations = self.initial_excitations();
            self.actuators.write(&mut *sys, &self.excitations)?;
        }

        match self.solve_step(sys, t0, t1, h) {
            Ok(x) => {
                let outcome = self.commit(sys, &x);
                sys.set_active_forces(&saved_forces);
                outcome
            }
            Err(e) if e.is_numerical() => {
                warn!(t0, t1, error = %e, "controller step failed, keeping previous excitations");
                sys.set_active_forces(&saved_forces);
                Ok(StepOutcome::Retained { reason: e })
            }
            Err(e) => {
                sys.set_active_forces(&saved_forces);
                Err(e)
            }
        }
    }

    fn solve_step<S: MechSystem>(
        &mut self,
        sys: &mut S,
        t0: f64,
        t1: f64,
        h: f64,
    ) -> Result<DVector<f64>, ControlError> {
        let mode = self.config.mode;
        let motion_active = self.motion_term.is_enabled() && self.motion_term.num_targets() > 0;
        let jacobian = if motion_active {
            Some(self.motion_term.velocity_jacobian(&*sys)?)
        } else {
            None
        };
        self.response
            .update(sys, &self.actuators, t0, t1, mode, jacobian.as_ref())?;
        self.bounds_term
            .set_bounds(self.actuators.lower_bounds(), self.actuators.upper_bounds())?;

        let mut costs: Vec<&mut dyn CostTerm> = Vec::new();
        let mut constraints: Vec<&mut dyn ConstraintTerm> = Vec::new();
        if self.config.motion_as_constraint {
            constraints.push(&mut self.motion_term);
        } else {
            costs.push(&mut self.motion_term);
        }
        for (_, slot) in &mut self.terms {
            match slot {
                TermSlot::Cost(t) => costs.push(t.as_mut()),
                TermSlot::Constraint(t) => constraints.push(t.as_mut()),
            }
        }
        constraints.push(&mut self.bounds_term);

        let mut ctx = TermContext {
            t0,
            t1,
            h,
            mode,
            excitations: &self.excitations,
            response: self.response.response(),
            actuators: &self.actuators,
            model: sys,
        };
        self.assembler.solve(&mut costs, &mut constraints, &mut ctx)
    }

    fn commit<S: MechSystem>(
        &mut self,
        sys: &mut S,
        x: &DVector<f64>,
    ) -> Result<StepOutcome, ControlError> {
        let proposed = if self.config.mode.is_incremental() {
            &self.excitations + x
        } else {
            x.clone()
        };
        let mut next = self.actuators.clamp(&proposed);

        if self.config.enforce_max_excitation_jump {
            let max = self.config.max_excitation_jump;
            let mut limited = 0;
            for (e, &prev) in next.iter_mut().zip(self.excitations.iter()) {
                let jump = *e - prev;
                if jump.abs() > max {
                    *e = prev + max.copysign(jump);
                    limited += 1;
                }
            }
            if limited > 0 {
                warn!(limited, max_jump = max, "excitation jump limited");
            }
        }

        self.actuators.write(&mut *sys, &next)?;
        debug!(
            m = next.len(),
            max = next.iter().copied().fold(0.0, f64::max),
            "excitations applied"
        );
        self.excitations.clone_from(&next);
        Ok(StepOutcome::Applied { excitations: next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invtrack_core::QpError;
    use invtrack_test_utils::mocks::FailingQpSolver;

    use crate::terms::{BoundsTerm, ProportionalTerm};

    #[test]
    fn configured_regularization_terms_installed() {
        let mut config = ControllerConfig::default();
        config.regularization.l2 = Some(0.1);
        config.regularization.damping = Some(0.01);
        let ctl = TrackingController::new(config).unwrap();
        assert_eq!(ctl.term_names(), vec!["l2 regularization", "damping"]);
    }

    #[test]
    fn constraint_mode_adds_l2() {
        let config = ControllerConfig {
            motion_as_constraint: true,
            ..ControllerConfig::default()
        };
        let ctl = TrackingController::new(config).unwrap();
        assert_eq!(ctl.term_names(), vec!["l2 regularization"]);
    }

    #[test]
    fn l2_term_is_single_instance() {
        let mut ctl = TrackingController::new(ControllerConfig::default()).unwrap();
        let a = ctl.add_l2_regularization_term(1.0);
        let b = ctl.add_l2_regularization_term(2.0);
        assert_eq!(a, b);
        assert_eq!(ctl.num_terms(), 1);
        let w = ctl.term::<L2RegularizationTerm>(a).unwrap().weight();
        assert!((w - 2.0).abs() < f64::EPSILON);

        assert!(ctl.remove_term(a));
        let c = ctl.add_l2_regularization_term(1.0);
        assert_ne!(a, c);
    }

    #[test]
    fn typed_access_checks_type() {
        let mut ctl = TrackingController::new(ControllerConfig::default()).unwrap();
        let id = ctl.add_cost_term(Box::new(ProportionalTerm::new(0.5)));
        assert!(ctl.term::<ProportionalTerm>(id).is_some());
        assert!(ctl.term::<BoundsTerm>(id).is_none());
        assert!(ctl.set_term_enabled(id, false));
        assert!(!ctl.term::<ProportionalTerm>(id).unwrap().is_enabled());
        assert!(!ctl.set_term_enabled(TermId(99), false));
    }

    #[test]
    fn initial_excitations_size_checked() {
        let mut ctl = TrackingController::new(ControllerConfig::default()).unwrap();
        assert!(matches!(
            ctl.set_initial_excitations(&[0.1]),
            Err(ConfigError::ExcitationSizeMismatch {
                expected: 0,
                got: 1
            })
        ));
    }

    #[test]
    fn invalid_config_rejected() {
        let config = ControllerConfig {
            excitation_bounds: [1.0, 0.0],
            ..ControllerConfig::default()
        };
        assert!(TrackingController::with_solver(config, Box::new(FailingQpSolver::default())).is_err());
    }

    #[test]
    fn max_jump_must_be_positive() {
        let mut ctl = TrackingController::new(ControllerConfig::default()).unwrap();
        assert!(ctl.set_max_excitation_jump(0.0).is_err());
        assert!(ctl.set_max_excitation_jump(f64::NAN).is_err());
        ctl.set_max_excitation_jump(0.2).unwrap();
        assert!((ctl.max_excitation_jump() - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn numerical_error_classification() {
        let e = ControlError::from(QpError::NotSolved(invtrack_core::QpStatus::MaxIterations));
        assert!(e.is_numerical());
    }
}
