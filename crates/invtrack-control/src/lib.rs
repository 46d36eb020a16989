//! Inverse-dynamics tracking controller.
//!
//! Each step the controller computes actuator excitations that make a
//! mechanical model follow motion and force targets:
//!
//! 1. **Excitation response**: linearize end-of-step velocities and
//!    constraint forces in the excitations by probing one actuator at a time
//!    through the model's KKT system.
//! 2. **QP assembly**: every term (motion tracking, force tracking,
//!    regularization, bounds, stability) contributes a cost or constraint
//!    rows to a small dense QP over the excitations.
//! 3. **Apply**: solve, clip to the actuator bounds and write the result.
//!
//! The model is accessed only through the
//! [`MechModel`](invtrack_core::MechModel) and
//! [`DynamicsSolver`](invtrack_core::DynamicsSolver) traits.

pub mod actuator;
pub mod assembler;
pub mod controller;
pub mod response;
pub mod term;
pub mod terms;

pub use actuator::{Actuator, ActuatorHandle, ActuatorSet};
pub use assembler::QpAssembler;
pub use controller::{StepOutcome, TermId, TrackingController};
pub use response::{relative_error, ExcitationResponse, ExcitationResponseModel};
pub use term::{ConstraintTerm, CostTerm, Term, TermBase, TermContext};

pub mod prelude {
    pub use crate::actuator::{Actuator, ActuatorHandle};
    pub use crate::controller::{StepOutcome, TermId, TrackingController};
    pub use crate::term::{ConstraintTerm, CostTerm, Term};
    pub use crate::terms::{
        BoundsTerm, DampingTerm, DynamicRegularizationTerm, ForceEffectorTerm,
        ForceMinimizationTerm, ForceTargetTerm, L2RegularizationTerm, MotionTargetTerm,
        NonuniformBoundsTerm, ProportionalTerm, StabilityTerm, WeightMapping,
    };
    pub use invtrack_core::{ControllerConfig, ExcitationMode, MotionSource, SourcePose};
}
