// invtrack-core: errors, configuration, time, shared types and collaborator traits.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use config::{ControllerConfig, IntegratorChoice, MotionConfig, QpSettings, RegularizationConfig};
pub use error::{ConfigError, ControlError, DynamicsError, QpError, QpStatus};
pub use time::{is_session_start, step_size, SimTime, StepClock};
pub use traits::{DynamicsSolver, KktSolution, MechModel, MechSystem};
pub use types::{
    CombinationRule, ConnectorId, ConstraintType, EffectorId, ExcitationMode, ExciterId,
    ForceLinearization, Integrator, KktCoefficients, MotionSource, SourcePose,
};
