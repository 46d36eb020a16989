//! Motion tracking term.
//!
//! Each target pairs a model component (the source) with a shadow pose the
//! caller moves along a trajectory. The term asks the predicted source
//! velocities `v0 + Hv x` to match a desired velocity `v*`:
//!
//! ```text
//! H = diag(w) Hv
//! b = diag(w) (v* - v0)
//! ```
//!
//! With `normalize_h` the pair `(Hv, v* - v0)` is divided by `||Hv||_F`
//! before timestep scaling and the row weights are applied.
//!
//! Without PD control `v* = (target - source) / h`. With PD control the
//! target velocity is interpolated from the previous target pose and
//! `v* = Kp/h * e_pos + Kd * e_vel`.

use std::any::Any;

use invtrack_core::{
    ConfigError, ConstraintType, ControlError, DynamicsError, MechModel, MotionConfig,
    MotionSource, SourcePose,
};
use nalgebra::{DMatrix, DVector};

use crate::term::{
    copy_rows, fold_least_squares, normalize, ConstraintTerm, CostTerm, Term, TermBase,
    TermContext,
};

/// One tracked component.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionTarget {
    pub source: MotionSource,
    /// Desired pose, set by the caller each step.
    pub target: SourcePose,
    /// Target velocity of the last step, interpolated from target poses.
    pub target_velocity: DVector<f64>,
    pub weight: f64,
    previous: Option<SourcePose>,
}

impl MotionTarget {
    pub fn vel_size(&self) -> usize {
        self.source.vel_size()
    }
}

/// Tracks point and frame targets through the velocity response.
#[derive(Clone, Debug)]
pub struct MotionTargetTerm {
    base: TermBase,
    targets: Vec<MotionTarget>,
    /// Per-row weights overriding the per-target weights.
    dof_weights: Option<DVector<f64>>,
    kp: f64,
    kd: f64,
    use_pd_control: bool,
    use_timestep_scaling: bool,
    position_error: f64,
    velocity_error: f64,
}

impl MotionTargetTerm {
    pub fn new(config: &MotionConfig) -> Self {
        let mut base = TermBase::new("motion", config.weight);
        base.normalize_h = config.normalize_h;
        Self {
            base,
            targets: Vec::new(),
            dof_weights: None,
            kp: config.kp,
            kd: config.kd,
            use_pd_control: config.use_pd_control,
            use_timestep_scaling: config.use_timestep_scaling,
            position_error: 0.0,
            velocity_error: 0.0,
        }
    }

    // -----------------------------------------------------------------------
    // Targets
    // -----------------------------------------------------------------------

    /// Track `source`, starting from its current pose. Returns the target
    /// index.
    pub fn add_target(
        &mut self,
        model: &dyn MechModel,
        source: MotionSource,
        weight: f64,
    ) -> Result<usize, ControlError> {
        if weight < 0.0 || !weight.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "motion target weight".into(),
                message: format!("{weight} (must be finite and >= 0)"),
            }
            .into());
        }
        let pose = model.source_pose(source)?;
        self.targets.push(MotionTarget {
            source,
            target: pose,
            target_velocity: DVector::zeros(source.vel_size()),
            weight,
            previous: None,
        });
        self.dof_weights = None;
        Ok(self.targets.len() - 1)
    }

    /// Stop tracking `source`. Returns whether it was tracked.
    pub fn remove_target(&mut self, source: MotionSource) -> bool {
        let before = self.targets.len();
        self.targets.retain(|t| t.source != source);
        let removed = self.targets.len() != before;
        if removed {
            self.dof_weights = None;
        }
        removed
    }

    pub fn clear_targets(&mut self) {
        self.targets.clear();
        self.dof_weights = None;
    }

    pub fn targets(&self) -> &[MotionTarget] {
        &self.targets
    }

    pub fn sources(&self) -> Vec<MotionSource> {
        self.targets.iter().map(|t| t.source).collect()
    }

    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    /// Total velocity rows over all targets.
    pub fn vel_size(&self) -> usize {
        self.targets.iter().map(MotionTarget::vel_size).sum()
    }

    /// Move the shadow target of target `index`.
    pub fn set_target_position(&mut self, index: usize, pose: SourcePose) -> Result<(), ConfigError> {
        let len = self.targets.len();
        let target = self
            .targets
            .get_mut(index)
            .ok_or(ConfigError::TargetIndexOutOfRange { index, len })?;
        if std::mem::discriminant(&target.target) != std::mem::discriminant(&pose) {
            return Err(ConfigError::InvalidValue {
                field: format!("motion target {index}"),
                message: "pose kind does not match the source".into(),
            });
        }
        target.target = pose;
        Ok(())
    }

    /// Set weights either per target (`num_targets` values) or per velocity
    /// row (`vel_size` values).
    pub fn set_target_weights(&mut self, weights: &[f64]) -> Result<(), ConfigError> {
        if weights.len() == self.targets.len() {
            for (t, &w) in self.targets.iter_mut().zip(weights) {
                t.weight = w;
            }
            self.dof_weights = None;
            Ok(())
        } else if weights.len() == self.vel_size() {
            self.dof_weights = Some(DVector::from_column_slice(weights));
            Ok(())
        } else {
            Err(ConfigError::WeightSizeMismatch {
                expected_targets: self.targets.len(),
                expected_rows: self.vel_size(),
                got: weights.len(),
            })
        }
    }

    /// Weight of every velocity row.
    pub fn row_weights(&self) -> DVector<f64> {
        if let Some(w) = &self.dof_weights {
            return w.clone();
        }
        let rows = self
            .targets
            .iter()
            .flat_map(|t| std::iter::repeat(t.weight).take(t.vel_size()));
        DVector::from_iterator(self.vel_size(), rows)
    }

    /// Stacked velocity Jacobian of all sources.
    pub fn velocity_jacobian(&self, model: &dyn MechModel) -> Result<DMatrix<f64>, DynamicsError> {
        model.velocity_jacobian(&self.sources())
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub const fn pd_gains(&self) -> (f64, f64) {
        (self.kp, self.kd)
    }

    pub fn set_pd_gains(&mut self, kp: f64, kd: f64) {
        self.kp = kp;
        self.kd = kd;
    }

    pub const fn uses_pd_control(&self) -> bool {
        self.use_pd_control
    }

    pub fn set_use_pd_control(&mut self, enable: bool) {
        self.use_pd_control = enable;
    }

    pub const fn uses_timestep_scaling(&self) -> bool {
        self.use_timestep_scaling
    }

    pub fn set_use_timestep_scaling(&mut self, enable: bool) {
        self.use_timestep_scaling = enable;
    }

    pub fn set_normalize_h(&mut self, enable: bool) {
        self.base.normalize_h = enable;
    }

    /// Norm of the stacked position error at the last step.
    pub const fn position_error_norm(&self) -> f64 {
        self.position_error
    }

    /// Norm of the stacked velocity error at the last step (PD only).
    pub const fn velocity_error_norm(&self) -> f64 {
        self.velocity_error
    }

    // -----------------------------------------------------------------------
    // Least squares
    // -----------------------------------------------------------------------

    fn desired_velocity(&mut self, ctx: &TermContext<'_>) -> Result<DVector<f64>, ControlError> {
        let h = ctx.h;
        let restart = ctx.is_session_start();
        let mut desired = DVector::zeros(self.vel_size());
        let mut pos_sq = 0.0;
        let mut vel_sq = 0.0;
        let mut row = 0;

        for t in &mut self.targets {
            let k = t.vel_size();
            if restart {
                t.previous = None;
            }
            let source_pose = ctx.model.source_pose(t.source)?;
            let pos_err = t.target.difference(&source_pose);
            t.target_velocity = match &t.previous {
                Some(prev) => t.target.difference(prev) / h,
                None => DVector::zeros(k),
            };
            pos_sq += pos_err.norm_squared();

            let v = if self.use_pd_control {
                let vel_err = &t.target_velocity - ctx.model.source_velocity(t.source)?;
                vel_sq += vel_err.norm_squared();
                pos_err * (self.kp / h) + vel_err * self.kd
            } else {
                pos_err / h
            };
            desired.rows_mut(row, k).copy_from(&v);
            t.previous = Some(t.target);
            row += k;
        }
        self.position_error = pos_sq.sqrt();
        self.velocity_error = vel_sq.sqrt();
        Ok(desired)
    }

    fn least_squares(
        &mut self,
        ctx: &TermContext<'_>,
    ) -> Result<(DMatrix<f64>, DVector<f64>), ControlError> {
        let rows = self.vel_size();
        let hv = &ctx.response.hv;
        if hv.nrows() != rows || ctx.response.v0.len() != rows {
            return Err(DynamicsError::DimensionMismatch {
                expected: rows,
                got: hv.nrows(),
            }
            .into());
        }
        let desired = self.desired_velocity(ctx)?;

        // Normalize, then scale by the step, then weight the rows.
        let mut h = hv.clone();
        let mut b = desired - &ctx.response.v0;
        if self.base.normalize_h {
            normalize(&mut h, &mut b);
        }
        if self.use_timestep_scaling {
            h /= ctx.h;
            b /= ctx.h;
        }
        let w = self.row_weights();
        for (i, mut r) in h.row_iter_mut().enumerate() {
            r *= w[i];
        }
        b.component_mul_assign(&w);
        Ok((h, b))
    }
}

impl Term for MotionTargetTerm {
    fn base(&self) -> &TermBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TermBase {
        &mut self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl CostTerm for MotionTargetTerm {
    fn add_cost(
        &mut self,
        q: &mut DMatrix<f64>,
        p: &mut DVector<f64>,
        ctx: &mut TermContext<'_>,
    ) -> Result<(), ControlError> {
        let (h, b) = self.least_squares(ctx)?;
        fold_least_squares(q, p, &h, &b, self.base.weight);
        Ok(())
    }
}

impl ConstraintTerm for MotionTargetTerm {
    fn constraint_type(&self) -> ConstraintType {
        ConstraintType::Equality
    }

    fn num_constraints(&self, _num_vars: usize) -> usize {
        self.vel_size()
    }

    fn add_constraints(
        &mut self,
        a: &mut DMatrix<f64>,
        b: &mut DVector<f64>,
        row_offset: usize,
        ctx: &mut TermContext<'_>,
    ) -> Result<usize, ControlError> {
        let (h, rhs) = self.least_squares(ctx)?;
        Ok(copy_rows(a, b, row_offset, &h, &rhs, self.base.weight))
    }
}
