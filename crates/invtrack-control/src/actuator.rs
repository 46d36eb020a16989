//! Actuators driven by the controller.
//!
//! Each actuator addresses one exciter channel of the model. The controller
//! owns the arena; handles stay valid until [`ActuatorSet::clear`].

use invtrack_core::{ConfigError, DynamicsError, ExciterId, MechModel};
use nalgebra::DVector;

/// Stable index of an actuator in an [`ActuatorSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActuatorHandle(pub usize);

/// A bounded scalar control input.
#[derive(Clone, Debug, PartialEq)]
pub struct Actuator {
    pub exciter: ExciterId,
    pub name: String,
    /// Scale from actuator value to exciter excitation.
    pub gain: f64,
    pub lower: f64,
    pub upper: f64,
    /// Weight used by the regularization terms.
    pub regularization_weight: f64,
}

impl Actuator {
    pub fn new(exciter: ExciterId, name: impl Into<String>) -> Self {
        Self {
            exciter,
            name: name.into(),
            gain: 1.0,
            lower: 0.0,
            upper: 1.0,
            regularization_weight: 1.0,
        }
    }

    #[must_use]
    pub const fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    #[must_use]
    pub const fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    #[must_use]
    pub const fn with_regularization_weight(mut self, weight: f64) -> Self {
        self.regularization_weight = weight;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lower > self.upper {
            return Err(ConfigError::InvalidBounds {
                lower: self.lower,
                upper: self.upper,
            });
        }
        if self.gain == 0.0 || !self.gain.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: format!("actuator '{}' gain", self.name),
                message: format!("{} (must be finite and non-zero)", self.gain),
            });
        }
        Ok(())
    }

    /// Clamp a value into `[lower, upper]`.
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lower, self.upper)
    }
}

/// Arena of actuators, indexed by [`ActuatorHandle`].
#[derive(Clone, Debug, Default)]
pub struct ActuatorSet {
    actuators: Vec<Actuator>,
}

impl ActuatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, actuator: Actuator) -> Result<ActuatorHandle, ConfigError> {
        actuator.validate()?;
        self.actuators.push(actuator);
        Ok(ActuatorHandle(self.actuators.len() - 1))
    }

    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }

    pub fn get(&self, handle: ActuatorHandle) -> Option<&Actuator> {
        self.actuators.get(handle.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Actuator> {
        self.actuators.iter()
    }

    /// Remove all actuators. Invalidates every handle.
    pub fn clear(&mut self) {
        self.actuators.clear();
    }

    /// Apply the same bounds to every actuator.
    pub fn set_bounds(&mut self, lower: f64, upper: f64) -> Result<(), ConfigError> {
        if lower > upper {
            return Err(ConfigError::InvalidBounds { lower, upper });
        }
        for a in &mut self.actuators {
            a.lower = lower;
            a.upper = upper;
        }
        Ok(())
    }

    /// Set the bounds of one actuator.
    pub fn set_actuator_bounds(
        &mut self,
        handle: ActuatorHandle,
        lower: f64,
        upper: f64,
    ) -> Result<(), ConfigError> {
        if lower > upper {
            return Err(ConfigError::InvalidBounds { lower, upper });
        }
        let len = self.actuators.len();
        let a = self
            .actuators
            .get_mut(handle.0)
            .ok_or(ConfigError::TargetIndexOutOfRange {
                index: handle.0,
                len,
            })?;
        a.lower = lower;
        a.upper = upper;
        Ok(())
    }

    pub fn lower_bounds(&self) -> DVector<f64> {
        DVector::from_iterator(self.len(), self.actuators.iter().map(|a| a.lower))
    }

    pub fn upper_bounds(&self) -> DVector<f64> {
        DVector::from_iterator(self.len(), self.actuators.iter().map(|a| a.upper))
    }

    pub fn regularization_weights(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.len(),
            self.actuators.iter().map(|a| a.regularization_weight),
        )
    }

    /// Clamp every component of `values` into its actuator's bounds.
    pub fn clamp(&self, values: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.len(),
            self.actuators
                .iter()
                .zip(values.iter())
                .map(|(a, &v)| a.clamp(v)),
        )
    }

    // -----------------------------------------------------------------------
    // Model access
    // -----------------------------------------------------------------------

    /// Current actuator values read from the model.
    pub fn read(&self, model: &dyn MechModel) -> Result<DVector<f64>, DynamicsError> {
        let mut values = DVector::zeros(self.len());
        for (i, a) in self.actuators.iter().enumerate() {
            values[i] = model.excitation(a.exciter)? / a.gain;
        }
        Ok(values)
    }

    /// Write actuator values to the model.
    pub fn write(
        &self,
        model: &mut dyn MechModel,
        values: &DVector<f64>,
    ) -> Result<(), DynamicsError> {
        if values.len() != self.len() {
            return Err(DynamicsError::DimensionMismatch {
                expected: self.len(),
                got: values.len(),
            });
        }
        for (a, &v) in self.actuators.iter().zip(values.iter()) {
            model.set_excitation(a.exciter, a.gain * v)?;
        }
        Ok(())
    }

    /// Write a single actuator value to the model.
    pub fn write_one(
        &self,
        model: &mut dyn MechModel,
        index: usize,
        value: f64,
    ) -> Result<(), DynamicsError> {
        let a = self
            .actuators
            .get(index)
            .ok_or(DynamicsError::UnknownComponent(index))?;
        model.set_excitation(a.exciter, a.gain * value)
    }

    /// Raw exciter excitations, for an exact restore.
    pub fn snapshot(&self, model: &dyn MechModel) -> Result<Vec<f64>, DynamicsError> {
        self.actuators
            .iter()
            .map(|a| model.excitation(a.exciter))
            .collect()
    }

    /// Restore raw exciter excitations taken by [`snapshot`](Self::snapshot).
    pub fn restore(
        &self,
        model: &mut dyn MechModel,
        snapshot: &[f64],
    ) -> Result<(), DynamicsError> {
        for (a, &raw) in self.actuators.iter().zip(snapshot) {
            model.set_excitation(a.exciter, raw)?;
        }
        Ok(())
    }
}
