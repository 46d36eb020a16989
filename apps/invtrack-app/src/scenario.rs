//! Tracking scenarios described in TOML.
//!
//! A scenario is a single particle held by muscles running to fixed anchors,
//! a reference trajectory for the particle, and the controller settings. The
//! runner steps the controller and the system together and reports the
//! tracking error.

use std::f64::consts::TAU;

use invtrack_control::{StepOutcome, TrackingController};
use invtrack_core::{
    ConfigError, ControlError, ControllerConfig, DynamicsError, Integrator, MotionSource,
    RegularizationConfig, SourcePose, StepClock,
};
use invtrack_mech::{Actuation, MassSpringSystem, Particle};
use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid scenario: {0}")]
    Invalid(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Dynamics(#[from] DynamicsError),
}

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

const fn default_dt() -> f64 {
    0.01
}
const fn default_steps() -> u32 {
    200
}
const fn default_mass() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A complete scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Step size in seconds.
    #[serde(default = "default_dt")]
    pub dt: f64,

    #[serde(default = "default_steps")]
    pub steps: u32,

    #[serde(default)]
    pub gravity: [f64; 3],

    #[serde(default)]
    pub integrator: Integrator,

    #[serde(default)]
    pub particle: ParticleConfig,

    pub muscles: Vec<MuscleConfig>,

    #[serde(default)]
    pub trajectory: Trajectory,

    #[serde(default)]
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleConfig {
    #[serde(default = "default_mass")]
    pub mass: f64,

    #[serde(default)]
    pub position: [f64; 3],

    /// Viscous damping coefficient.
    #[serde(default)]
    pub damping: f64,
}

impl Default for ParticleConfig {
    fn default() -> Self {
        Self {
            mass: default_mass(),
            position: [0.0; 3],
            damping: 0.0,
        }
    }
}

/// A muscle from the particle to a fixed anchor, with its own exciter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuscleConfig {
    pub name: String,
    pub anchor: [f64; 3],
    pub max_force: f64,

    /// Quadratic coefficient of the force-excitation relation.
    #[serde(default)]
    pub nonlinearity: f64,

    /// Stiffness added per unit excitation.
    #[serde(default)]
    pub activation_stiffness: f64,
}

/// Reference path of the particle, relative to its start position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trajectory {
    /// Stay at the start position.
    #[default]
    Hold,
    /// Move at constant velocity.
    Linear { velocity: [f64; 3] },
    /// Circle in the xy plane through the start position, counter-clockwise.
    Circle { radius: f64, period: f64 },
}

impl Trajectory {
    /// Target position at time `t` for a particle starting at `start`.
    pub fn position(&self, start: &Vector3<f64>, t: f64) -> Vector3<f64> {
        match *self {
            Self::Hold => *start,
            Self::Linear { velocity } => start + Vector3::from(velocity) * t,
            Self::Circle { radius, period } => {
                let center = start - Vector3::x() * radius;
                let angle = TAU * t / period;
                center + Vector3::new(angle.cos(), angle.sin(), 0.0) * radius
            }
        }
    }
}

impl Default for ScenarioConfig {
    /// Planar reach: four muscles in a cross, tracing a small circle.
    fn default() -> Self {
        let muscle = |name: &str, anchor: [f64; 3]| MuscleConfig {
            name: name.into(),
            anchor,
            max_force: 20.0,
            nonlinearity: 0.0,
            activation_stiffness: 0.0,
        };
        Self {
            dt: default_dt(),
            steps: default_steps(),
            gravity: [0.0; 3],
            integrator: Integrator::BackwardEuler,
            particle: ParticleConfig::default(),
            muscles: vec![
                muscle("east", [1.0, 0.0, 0.0]),
                muscle("north", [0.0, 1.0, 0.0]),
                muscle("west", [-1.0, 0.0, 0.0]),
                muscle("south", [0.0, -1.0, 0.0]),
            ],
            trajectory: Trajectory::Circle {
                radius: 0.1,
                period: 2.0,
            },
            controller: ControllerConfig {
                regularization: RegularizationConfig {
                    l2: Some(1e-4),
                    damping: None,
                },
                ..ControllerConfig::default()
            },
        }
    }
}

impl ScenarioConfig {
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if !is_positive(self.dt) {
            return Err(ScenarioError::Invalid(format!("dt = {} (must be > 0)", self.dt)));
        }
        if self.steps == 0 {
            return Err(ScenarioError::Invalid("steps must be > 0".into()));
        }
        if !is_positive(self.particle.mass) {
            return Err(ScenarioError::Invalid("particle mass must be > 0".into()));
        }
        if self.muscles.is_empty() {
            return Err(ScenarioError::Invalid("at least one muscle is required".into()));
        }
        let start = Vector3::from(self.particle.position);
        for m in &self.muscles {
            if !is_positive(m.max_force) {
                return Err(ScenarioError::Invalid(format!(
                    "muscle '{}': max_force must be > 0",
                    m.name
                )));
            }
            if (Vector3::from(m.anchor) - start).norm() < 1e-9 {
                return Err(ScenarioError::Invalid(format!(
                    "muscle '{}': anchor coincides with the particle",
                    m.name
                )));
            }
        }
        if let Trajectory::Circle { radius, period } = self.trajectory {
            if !(is_positive(radius) && is_positive(period)) {
                return Err(ScenarioError::Invalid(
                    "circle radius and period must be > 0".into(),
                ));
            }
        }
        self.controller.validate()?;
        Ok(())
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ScenarioError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// One step of a run.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub t: f64,
    pub excitations: DVector<f64>,
    /// Distance between the particle and its target at the end of the step.
    pub error: f64,
    pub retained: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    pub steps: u32,
    /// Steps where the controller kept the previous excitations.
    pub retained: u32,
    pub max_error: f64,
    pub final_error: f64,
}

/// A built system and controller.
#[derive(Debug)]
pub struct Scenario {
    config: ScenarioConfig,
    sys: MassSpringSystem,
    controller: TrackingController,
    point: usize,
    start: Vector3<f64>,
}

impl Scenario {
    pub fn build(config: ScenarioConfig) -> Result<Self, ScenarioError> {
        config.validate()?;
        let start = Vector3::from(config.particle.position);
        let mut sys = MassSpringSystem::new()
            .with_gravity(Vector3::from(config.gravity))
            .with_integrator(config.integrator);
        let point = sys.add_particle(
            Particle::new(config.particle.mass, start).with_damping(config.particle.damping),
        );

        let mut controller = TrackingController::new(config.controller.clone())?;
        for m in &config.muscles {
            let anchor = sys.add_anchor(Vector3::from(m.anchor));
            let exciter = sys.add_exciter(m.name.as_str());
            let actuation = Actuation::new(m.max_force)
                .with_nonlinearity(m.nonlinearity)
                .with_activation_stiffness(m.activation_stiffness)
                .with_source(exciter, 1.0);
            sys.add_muscle(point, anchor, actuation)?;
            controller.add_exciter(&sys, exciter, 1.0)?;
        }
        controller.add_motion_target(&sys, MotionSource::Point(point), 1.0)?;
        info!(
            muscles = config.muscles.len(),
            dt = config.dt,
            trajectory = ?config.trajectory,
            "scenario built"
        );

        Ok(Self {
            config,
            sys,
            controller,
            point,
            start,
        })
    }

    pub const fn controller(&self) -> &TrackingController {
        &self.controller
    }

    /// Run `steps` steps from time zero, calling `on_step` after each.
    pub fn run(
        &mut self,
        steps: u32,
        mut on_step: impl FnMut(&StepReport),
    ) -> Result<RunSummary, ScenarioError> {
        let mut clock = StepClock::new(self.config.dt);
        let mut summary = RunSummary::default();

        for _ in 0..steps {
            let (t0, t1) = clock.tick();
            let target = self.config.trajectory.position(&self.start, t1);
            self.controller
                .set_motion_target_position(0, SourcePose::Point(target))?;

            let outcome = self.controller.apply(&mut self.sys, t0, t1)?;
            let retained = matches!(outcome, StepOutcome::Retained { .. });
            self.sys.advance(t0, t1)?;

            let error = (self.sys.point_position(self.point)? - target).norm();
            let report = StepReport {
                t: t1,
                excitations: self.controller.excitations().clone(),
                error,
                retained,
            };
            debug!(t = t1, error, retained, "step");
            on_step(&report);

            summary.steps += 1;
            summary.retained += u32::from(retained);
            summary.max_error = summary.max_error.max(error);
            summary.final_error = error;
        }

        info!(
            steps = summary.steps,
            retained = summary.retained,
            max_error = summary.max_error,
            final_error = summary.final_error,
            "run finished"
        );
        Ok(summary)
    }
}
