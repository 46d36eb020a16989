use thiserror::Error;

/// Top-level error type for the tracking controller.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dynamics error: {0}")]
    Dynamics(#[from] DynamicsError),

    #[error("QP error: {0}")]
    Qp(#[from] QpError),
}

impl ControlError {
    /// Whether this error is a numerical failure of a single step.
    ///
    /// Numerical failures are recoverable: the controller keeps the previous
    /// excitations and the simulation continues.
    pub const fn is_numerical(&self) -> bool {
        matches!(self, Self::Dynamics(DynamicsError::SingularKkt { .. }) | Self::Qp(_))
    }
}

/// Configuration errors, returned from the configuring call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Weight vector size mismatch: expected {expected_targets} (per target) or {expected_rows} (per row), got {got}")]
    WeightSizeMismatch {
        expected_targets: usize,
        expected_rows: usize,
        got: usize,
    },

    #[error("Excitation vector size mismatch: expected {expected}, got {got}")]
    ExcitationSizeMismatch { expected: usize, got: usize },

    #[error("Target index {index} out of range (have {len} targets)")]
    TargetIndexOutOfRange { index: usize, len: usize },

    #[error("Component {0} has no force components")]
    EmptyForceComponent(usize),

    #[error("Invalid bounds: lower {lower} > upper {upper}")]
    InvalidBounds { lower: f64, upper: f64 },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown term id: {0}")]
    UnknownTerm(usize),
}

/// Errors raised by the constrained dynamics collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DynamicsError {
    #[error("Singular KKT system (size {size})")]
    SingularKkt { size: usize },

    #[error("KKT solve requested before factorization")]
    NotFactored,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Unknown component: {0}")]
    UnknownComponent(usize),
}

/// Outcome of a QP solve that is not a usable solution.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QpError {
    #[error("QP solver did not converge: {0:?}")]
    NotSolved(QpStatus),

    #[error("QP setup failed: {0}")]
    Setup(String),

    #[error("QP dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Termination status reported by a QP solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpStatus {
    Solved,
    AlmostSolved,
    PrimalInfeasible,
    DualInfeasible,
    MaxIterations,
    MaxTime,
    NumericalError,
}

impl QpStatus {
    /// Whether the solution vector can be used.
    pub const fn is_solved(self) -> bool {
        matches!(self, Self::Solved | Self::AlmostSolved)
    }
}
