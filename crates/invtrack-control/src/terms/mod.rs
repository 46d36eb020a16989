//! Concrete QP terms.

macro_rules! impl_term {
    ($ty:ty) => {
        impl $crate::term::Term for $ty {
            fn base(&self) -> &$crate::term::TermBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut $crate::term::TermBase {
                &mut self.base
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }
        }
    };
}

pub mod bounds;
pub mod dynamic;
pub mod force;
pub mod motion;
pub mod regularization;
pub mod stability;

pub use bounds::{BoundsTerm, NonuniformBoundsTerm};
pub use dynamic::{DynamicRegularizationTerm, WeightMapping};
pub use force::{
    effector_response, EffectorResponse, ForceEffectorTerm, ForceMinimizationTerm,
    ForceTargetTerm,
};
pub use motion::{MotionTarget, MotionTargetTerm};
pub use regularization::{DampingTerm, L2RegularizationTerm, ProportionalTerm};
pub use stability::{spd_determinant, StabilityTerm};
