//! Dense reference mechanical system for the invtrack controller.
//!
//! [`MassSpringSystem`] models particles and rigid frames connected by axial
//! springs and muscles, with bilateral constraints. It implements
//! [`MechModel`](invtrack_core::MechModel) and
//! [`DynamicsSolver`](invtrack_core::DynamicsSolver) with dense `nalgebra`
//! matrices and an LU-factored KKT system, and can advance itself in time.
//!
//! # Quick Start
//!
//! ```
//! use invtrack_core::{MechModel, MotionSource};
//! use invtrack_mech::{MassSpringSystem, Particle};
//! use nalgebra::Vector3;
//!
//! let mut sys = MassSpringSystem::new();
//! let p = sys.add_particle(Particle::new(1.0, Vector3::zeros()));
//! let anchor = sys.add_anchor(Vector3::new(1.0, 0.0, 0.0));
//! let (_, exciter) = sys.add_simple_muscle("pull", p, anchor, 10.0).unwrap();
//!
//! sys.set_excitation(exciter, 0.5).unwrap();
//! sys.advance(0.0, 0.01).unwrap();
//! let v = sys.source_velocity(MotionSource::Point(p)).unwrap();
//! assert!(v[0] > 0.0);
//! ```

pub mod components;
pub mod kkt;
pub mod system;

pub use components::{Actuation, AxialEffector, Body, Connector, Frame, Particle, Point};
pub use kkt::KktFactorization;
pub use system::{frame_pose, MassSpringSystem};
