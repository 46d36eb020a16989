use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{ExcitationMode, Integrator};

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

const fn default_true() -> bool {
    true
}
const fn default_excitation_bounds() -> [f64; 2] {
    [0.0, 1.0]
}
const fn default_max_excitation_jump() -> f64 {
    1.0
}
const fn default_weight() -> f64 {
    1.0
}
const fn default_kp() -> f64 {
    100.0
}
const fn default_kd() -> f64 {
    1.0
}
const fn default_max_iter() -> u32 {
    200
}
const fn default_tolerance() -> f64 {
    1e-9
}
const fn default_bound_snap() -> f64 {
    1e-4
}

// ---------------------------------------------------------------------------
// IntegratorChoice
// ---------------------------------------------------------------------------

/// Which KKT coefficient set the response model uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegratorChoice {
    /// Follow the model's own integrator.
    #[default]
    Auto,
    BackwardEuler,
    Trapezoidal,
}

impl IntegratorChoice {
    /// Resolve against the integrator reported by the model.
    pub const fn resolve(self, model: Integrator) -> Integrator {
        match self {
            Self::Auto => model,
            Self::BackwardEuler => Integrator::BackwardEuler,
            Self::Trapezoidal => Integrator::Trapezoidal,
        }
    }
}

// ---------------------------------------------------------------------------
// ControllerConfig
// ---------------------------------------------------------------------------

/// Tracking controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Whether the controller runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Holistic or incremental excitation mode.
    #[serde(default)]
    pub mode: ExcitationMode,

    /// KKT coefficient set used when linearizing the dynamics.
    #[serde(default)]
    pub integrator: IntegratorChoice,

    /// Global excitation bounds `[lower, upper]` applied to new actuators.
    #[serde(default = "default_excitation_bounds")]
    pub excitation_bounds: [f64; 2],

    /// Largest excitation change per step (advisory unless enforced).
    #[serde(default = "default_max_excitation_jump")]
    pub max_excitation_jump: f64,

    /// Clamp per-step excitation changes to `max_excitation_jump`.
    #[serde(default)]
    pub enforce_max_excitation_jump: bool,

    /// Use the motion term as an equality constraint instead of a cost.
    #[serde(default)]
    pub motion_as_constraint: bool,

    /// Motion tracking settings.
    #[serde(default)]
    pub motion: MotionConfig,

    /// Regularization terms created with the controller.
    #[serde(default)]
    pub regularization: RegularizationConfig,

    /// QP solver settings.
    #[serde(default)]
    pub qp: QpSettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ExcitationMode::Holistic,
            integrator: IntegratorChoice::Auto,
            excitation_bounds: default_excitation_bounds(),
            max_excitation_jump: default_max_excitation_jump(),
            enforce_max_excitation_jump: false,
            motion_as_constraint: false,
            motion: MotionConfig::default(),
            regularization: RegularizationConfig::default(),
            qp: QpSettings::default(),
        }
    }
}

impl ControllerConfig {
    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let [lower, upper] = self.excitation_bounds;
        if lower > upper {
            return Err(ConfigError::InvalidBounds { lower, upper });
        }
        if let ExcitationMode::Incremental { delta } = self.mode {
            if !(delta.is_finite() && delta > 0.0) {
                return Err(invalid("mode.delta", format!("{delta} (must be > 0)")));
            }
        }
        if self.max_excitation_jump <= 0.0 {
            return Err(invalid(
                "max_excitation_jump",
                format!("{} (must be > 0)", self.max_excitation_jump),
            ));
        }
        self.motion.validate()?;
        self.regularization.validate()?;
        self.qp.validate()
    }

    /// Load from TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// MotionConfig
// ---------------------------------------------------------------------------

/// Settings of the motion target term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Proportional gain of the PD target velocity.
    #[serde(default = "default_kp")]
    pub kp: f64,

    /// Derivative gain of the PD target velocity.
    #[serde(default = "default_kd")]
    pub kd: f64,

    #[serde(default)]
    pub use_pd_control: bool,

    /// Divide `H` and `b` by the Frobenius norm of `H`.
    #[serde(default)]
    pub normalize_h: bool,

    /// Divide `H` and `b` by the step size.
    #[serde(default)]
    pub use_timestep_scaling: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            weight: default_weight(),
            kp: default_kp(),
            kd: default_kd(),
            use_pd_control: false,
            normalize_h: false,
            use_timestep_scaling: false,
        }
    }
}

impl MotionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_negative("motion.weight", self.weight)?;
        non_negative("motion.kp", self.kp)?;
        non_negative("motion.kd", self.kd)
    }
}

// ---------------------------------------------------------------------------
// RegularizationConfig
// ---------------------------------------------------------------------------

/// Regularization terms installed when the controller is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegularizationConfig {
    /// Weight of the L2 excitation term, if any.
    #[serde(default)]
    pub l2: Option<f64>,

    /// Weight of the excitation damping term, if any.
    #[serde(default)]
    pub damping: Option<f64>,
}

impl RegularizationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(w) = self.l2 {
            non_negative("regularization.l2", w)?;
        }
        if let Some(w) = self.damping {
            non_negative("regularization.damping", w)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QpSettings
// ---------------------------------------------------------------------------

/// Interior-point QP solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QpSettings {
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,

    /// Absolute and relative duality gap tolerance.
    #[serde(default = "default_tolerance")]
    pub tol_gap: f64,

    /// Feasibility tolerance.
    #[serde(default = "default_tolerance")]
    pub tol_feas: f64,

    /// Distance within which a solution component is moved onto a
    /// single-variable inequality bound. Zero disables snapping.
    #[serde(default = "default_bound_snap")]
    pub bound_snap: f64,

    #[serde(default)]
    pub verbose: bool,
}

impl Default for QpSettings {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            tol_gap: default_tolerance(),
            tol_feas: default_tolerance(),
            bound_snap: default_bound_snap(),
            verbose: false,
        }
    }
}

impl QpSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iter == 0 {
            return Err(invalid("qp.max_iter", "0 (must be > 0)".into()));
        }
        if self.tol_gap <= 0.0 || self.tol_feas <= 0.0 {
            return Err(invalid("qp", "tolerances must be > 0".into()));
        }
        non_negative("qp.bound_snap", self.bound_snap)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn invalid(field: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message,
    }
}

fn non_negative(field: &str, value: f64) -> Result<(), ConfigError> {
    if value < 0.0 || value.is_nan() {
        return Err(invalid(field, format!("{value} (must be >= 0)")));
    }
    Ok(())
}
