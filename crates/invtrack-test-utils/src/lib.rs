//! Shared test fixtures and utilities for invtrack crates.
//!
//! Provides small reference systems built on
//! [`MassSpringSystem`](invtrack_mech::MassSpringSystem) and stub
//! implementations of the collaborator traits.

pub mod fixtures;
pub mod mocks;

// ---------------------------------------------------------------------------
// Re-exports for convenience
// ---------------------------------------------------------------------------

pub use fixtures::{
    damped_muscle_particle, frame_with_markers, nonlinear_two_muscle, pinned_muscle_particle,
    planar_two_muscle, single_muscle_particle, unequal_planar_muscles, Fixture,
};
pub use mocks::{FailingQpSolver, NullModel, ScriptedQpSolver};
