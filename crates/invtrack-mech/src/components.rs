//! Bodies, points, effectors and constraints of a [`MassSpringSystem`](crate::MassSpringSystem).

use invtrack_core::{CombinationRule, ExciterId};
use nalgebra::{Isometry3, Unit, Vector3};

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// A dynamic point mass with 3 velocity DOFs.
#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    pub mass: f64,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    /// Mass-proportional velocity damping.
    pub damping: f64,
}

impl Particle {
    pub fn new(mass: f64, position: Vector3<f64>) -> Self {
        Self {
            mass,
            position,
            velocity: Vector3::zeros(),
            damping: 0.0,
        }
    }

    #[must_use]
    pub const fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }
}

/// A rigid frame with 6 velocity DOFs (world linear, world angular) and an
/// isotropic rotational inertia.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub mass: f64,
    pub inertia: f64,
    pub pose: Isometry3<f64>,
    pub velocity: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
    pub damping: f64,
}

impl Frame {
    pub fn new(mass: f64, inertia: f64, pose: Isometry3<f64>) -> Self {
        Self {
            mass,
            inertia,
            pose,
            velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            damping: 0.0,
        }
    }

    #[must_use]
    pub const fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }
}

/// A dynamic body and its offset into the active velocity vector.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Particle(Particle),
    Frame(Frame),
}

impl Body {
    pub const fn vel_size(&self) -> usize {
        match self {
            Self::Particle(_) => 3,
            Self::Frame(_) => 6,
        }
    }
}

// ---------------------------------------------------------------------------
// Points
// ---------------------------------------------------------------------------

/// Where a point gets its position and velocity from.
#[derive(Clone, Debug, PartialEq)]
pub enum Point {
    /// The position of a particle body.
    Particle { body: usize },
    /// A fixed point in space with no DOFs.
    Anchor { position: Vector3<f64> },
    /// A point attached to a frame body at a body-local offset.
    Marker { body: usize, offset: Vector3<f64> },
}

// ---------------------------------------------------------------------------
// Effectors
// ---------------------------------------------------------------------------

/// Excitation-driven part of an axial effector.
#[derive(Clone, Debug, PartialEq)]
pub struct Actuation {
    /// Tension at full excitation and zero stretch.
    pub max_force: f64,
    /// Extra stiffness per unit excitation.
    pub activation_stiffness: f64,
    /// Quadratic shaping `(a + beta*a^2) / (1 + beta)` of the force-excitation
    /// relation; zero is linear.
    pub nonlinearity: f64,
    /// Exciter channels and their gains.
    pub sources: Vec<(ExciterId, f64)>,
    pub rule: CombinationRule,
}

impl Actuation {
    pub fn new(max_force: f64) -> Self {
        Self {
            max_force,
            activation_stiffness: 0.0,
            nonlinearity: 0.0,
            sources: Vec::new(),
            rule: CombinationRule::Sum,
        }
    }

    #[must_use]
    pub const fn with_activation_stiffness(mut self, stiffness: f64) -> Self {
        self.activation_stiffness = stiffness;
        self
    }

    #[must_use]
    pub const fn with_nonlinearity(mut self, beta: f64) -> Self {
        self.nonlinearity = beta;
        self
    }

    #[must_use]
    pub const fn with_rule(mut self, rule: CombinationRule) -> Self {
        self.rule = rule;
        self
    }

    #[must_use]
    pub fn with_source(mut self, exciter: ExciterId, gain: f64) -> Self {
        self.sources.push((exciter, gain));
        self
    }

    /// Force scale for net excitation `a`.
    pub fn force_scale(&self, a: f64) -> f64 {
        (a + self.nonlinearity * a * a) / (1.0 + self.nonlinearity)
    }
}

/// A two-point effector whose tension pulls its end points together.
///
/// `tension = k*(l - l0) + c*ldot + fmax*g(a) + ka*a*(l - l0)`
#[derive(Clone, Debug, PartialEq)]
pub struct AxialEffector {
    pub a: usize,
    pub b: usize,
    pub rest_length: f64,
    pub stiffness: f64,
    pub damping: f64,
    pub actuation: Option<Actuation>,
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// A bilateral velocity constraint.
#[derive(Clone, Debug, PartialEq)]
pub enum Connector {
    /// Point fixed in space (3 rows).
    Pin { point: usize },
    /// Point cannot move along `axis` (1 row).
    Axis { point: usize, axis: Unit<Vector3<f64>> },
    /// Distance between two points is preserved (1 row).
    Rod { a: usize, b: usize },
}

impl Connector {
    pub const fn size(&self) -> usize {
        match self {
            Self::Pin { .. } => 3,
            Self::Axis { .. } | Self::Rod { .. } => 1,
        }
    }
}

/// A named excitation channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Exciter {
    pub name: String,
    pub excitation: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_force_scale() {
        let act = Actuation::new(10.0);
        assert_relative_eq!(act.force_scale(0.3), 0.3);
    }

    #[test]
    fn nonlinear_force_scale_hits_one_at_full_excitation() {
        let act = Actuation::new(10.0).with_nonlinearity(2.0);
        assert_relative_eq!(act.force_scale(1.0), 1.0);
        assert_relative_eq!(act.force_scale(0.5), (0.5 + 0.5) / 3.0);
    }

    #[test]
    fn connector_sizes() {
        assert_eq!(Connector::Pin { point: 0 }.size(), 3);
        assert_eq!(Connector::Rod { a: 0, b: 1 }.size(), 1);
    }
}
