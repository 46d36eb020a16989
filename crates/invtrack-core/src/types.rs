//! Shared value types used across the invtrack crates.

use nalgebra::{DMatrix, DVector, Isometry3, Vector3};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Component handles
// ---------------------------------------------------------------------------

/// Handle of an exciter channel in the mechanical model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExciterId(pub usize);

/// Handle of a bilateral constraint connector in the mechanical model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectorId(pub usize);

/// Handle of a force effector (spring, muscle) in the mechanical model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectorId(pub usize);

/// A model component whose motion can be tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotionSource {
    /// A point: particle, fixed anchor, or frame-attached marker.
    Point(usize),
    /// A rigid frame.
    Frame(usize),
}

impl MotionSource {
    /// Number of velocity degrees of freedom.
    pub const fn vel_size(self) -> usize {
        match self {
            Self::Point(_) => 3,
            Self::Frame(_) => 6,
        }
    }

    /// Number of position coordinates (quaternion for frames).
    pub const fn pos_size(self) -> usize {
        match self {
            Self::Point(_) => 3,
            Self::Frame(_) => 7,
        }
    }
}

/// Position of a motion source or target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourcePose {
    Point(Vector3<f64>),
    Frame(Isometry3<f64>),
}

impl SourcePose {
    /// Velocity-space difference `self - other`.
    ///
    /// For frames this is the translation difference stacked on top of the
    /// rotation vector of `self * other^-1`.
    pub fn difference(&self, other: &Self) -> DVector<f64> {
        match (self, other) {
            (Self::Point(a), Self::Point(b)) => DVector::from_column_slice((a - b).as_slice()),
            (Self::Frame(a), Self::Frame(b)) => {
                let dp = a.translation.vector - b.translation.vector;
                let dr = (a.rotation * b.rotation.inverse()).scaled_axis();
                DVector::from_iterator(6, dp.iter().chain(dr.iter()).copied())
            }
            (Self::Point(a), Self::Frame(b)) => {
                let dp = a - b.translation.vector;
                DVector::from_column_slice(dp.as_slice())
            }
            (Self::Frame(a), Self::Point(b)) => {
                let dp = a.translation.vector - b;
                DVector::from_column_slice(dp.as_slice())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Excitation mode / integrator
// ---------------------------------------------------------------------------

/// How excitations enter the QP.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExcitationMode {
    /// The QP variable is the absolute excitation vector.
    #[default]
    Holistic,
    /// The QP variable is an excitation increment; responses are finite
    /// differences of size `delta` about the current excitation.
    Incremental { delta: f64 },
}

impl ExcitationMode {
    pub const fn is_incremental(self) -> bool {
        matches!(self, Self::Incremental { .. })
    }
}

/// Time integrator used by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integrator {
    #[default]
    BackwardEuler,
    Trapezoidal,
}

/// Coefficients of the KKT system solved by the dynamics collaborator.
///
/// `S = M + a0*Dv + a1*Dx`; `a2` and `a3` weight the velocity terms moved to
/// the right-hand side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KktCoefficients {
    pub a0: f64,
    pub a1: f64,
    pub a2: f64,
    pub a3: f64,
}

impl KktCoefficients {
    pub fn backward_euler(h: f64) -> Self {
        Self {
            a0: -h,
            a1: -h * h,
            a2: -h,
            a3: 0.0,
        }
    }

    pub fn trapezoidal(h: f64) -> Self {
        Self {
            a0: -h / 2.0,
            a1: -h * h / 4.0,
            a2: -h / 2.0,
            a3: h * h / 4.0,
        }
    }

    pub fn for_integrator(integrator: Integrator, h: f64) -> Self {
        match integrator {
            Integrator::BackwardEuler => Self::backward_euler(h),
            Integrator::Trapezoidal => Self::trapezoidal(h),
        }
    }
}

// ---------------------------------------------------------------------------
// Terms
// ---------------------------------------------------------------------------

/// Kind of constraint rows a term writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintType {
    Equality,
    Inequality,
}

/// Rule for combining several upstream excitation sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationRule {
    /// Sum of sources, clamped to `[0, 1]`.
    #[default]
    Sum,
    /// Largest source.
    Max,
}

impl CombinationRule {
    pub fn combine(self, values: impl IntoIterator<Item = f64>) -> f64 {
        match self {
            Self::Sum => values.into_iter().sum::<f64>().clamp(0.0, 1.0),
            Self::Max => values.into_iter().fold(0.0, f64::max),
        }
    }
}

// ---------------------------------------------------------------------------
// Force linearization
// ---------------------------------------------------------------------------

/// Force of an effector, linearized in position and velocity.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceLinearization {
    /// Current force components (k).
    pub force: DVector<f64>,
    /// Derivative with respect to active positions (k x n).
    pub dfdx: DMatrix<f64>,
    /// Derivative with respect to active velocities (k x n).
    pub dfdv: DMatrix<f64>,
}

impl ForceLinearization {
    pub fn size(&self) -> usize {
        self.force.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    #[test]
    fn source_sizes() {
        assert_eq!(MotionSource::Point(0).vel_size(), 3);
        assert_eq!(MotionSource::Frame(0).vel_size(), 6);
        assert_eq!(MotionSource::Frame(0).pos_size(), 7);
    }

    #[test]
    fn kkt_coefficients() {
        let be = KktCoefficients::backward_euler(0.1);
        assert_relative_eq!(be.a0, -0.1);
        assert_relative_eq!(be.a1, -0.01);
        assert_relative_eq!(be.a2, -0.1);
        assert_relative_eq!(be.a3, 0.0);

        let tr = KktCoefficients::trapezoidal(0.1);
        assert_relative_eq!(tr.a0, -0.05);
        assert_relative_eq!(tr.a1, -0.0025);
        assert_relative_eq!(tr.a2, -0.05);
        assert_relative_eq!(tr.a3, 0.0025);
    }

    #[test]
    fn combination_rules() {
        assert_relative_eq!(CombinationRule::Sum.combine([0.3, 0.4]), 0.7);
        assert_relative_eq!(CombinationRule::Sum.combine([0.8, 0.4]), 1.0);
        assert_relative_eq!(CombinationRule::Max.combine([0.3, 0.4]), 0.4);
        assert_relative_eq!(CombinationRule::Max.combine([]), 0.0);
    }

    #[test]
    fn frame_difference_stacks_translation_and_rotation() {
        let a = Isometry3::from_parts(
            Translation3::new(1.0, 2.0, 3.0),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, 0.2)),
        );
        let b = Isometry3::identity();
        let d = SourcePose::Frame(a).difference(&SourcePose::Frame(b));
        assert_eq!(d.len(), 6);
        assert_relative_eq!(d[0], 1.0);
        assert_relative_eq!(d[2], 3.0);
        assert_relative_eq!(d[5], 0.2, epsilon = 1e-12);
    }

    #[test]
    fn excitation_mode_serde() {
        let mode: ExcitationMode = toml::from_str("kind = \"incremental\"\ndelta = 0.01").unwrap();
        assert_eq!(mode, ExcitationMode::Incremental { delta: 0.01 });
        assert!(mode.is_incremental());
        assert!(!ExcitationMode::default().is_incremental());
    }
}
