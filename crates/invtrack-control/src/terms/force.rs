//! Force tracking and force minimization terms.
//!
//! Constraint forces respond linearly to excitation through `Hlam`.
//! Effector forces are linearized in position and velocity about the
//! start of the step and pushed through the velocity response `Hu`:
//!
//! ```text
//! f(x) ~= f0 + Hf x,    Hf = Jf Hu + Fa
//! Jf   = hx Fx + Fv     (hx = h for backward Euler, h/2 for trapezoidal)
//! ```
//!
//! `Fa` holds the direct change of each force per unit excitation, perturbed
//! one actuator at a time like the velocity response.

use invtrack_core::{
    ConfigError, ConnectorId, ConstraintType, ControlError, EffectorId, ForceLinearization,
    Integrator, MechModel,
};
use nalgebra::{DMatrix, DVector};

use crate::response::step_delta;
use crate::term::{
    add_least_squares_cost, add_least_squares_rows, ConstraintTerm, CostTerm, TermBase,
    TermContext,
};

// ---------------------------------------------------------------------------
// Target bookkeeping
// ---------------------------------------------------------------------------

/// Ordered force targets keyed by component id.
#[derive(Clone, Debug)]
struct ForceTargets<I> {
    ids: Vec<I>,
    targets: Vec<DVector<f64>>,
    weights: Vec<f64>,
    dof_weights: Option<DVector<f64>>,
}

impl<I: Copy + PartialEq> ForceTargets<I> {
    const fn new() -> Self {
        Self {
            ids: Vec::new(),
            targets: Vec::new(),
            weights: Vec::new(),
            dof_weights: None,
        }
    }

    fn push(&mut self, id: I, size: usize, weight: f64) -> usize {
        self.ids.push(id);
        self.targets.push(DVector::zeros(size));
        self.weights.push(weight);
        self.dof_weights = None;
        self.ids.len() - 1
    }

    fn remove(&mut self, id: I) -> bool {
        let Some(i) = self.ids.iter().position(|&x| x == id) else {
            return false;
        };
        self.ids.remove(i);
        self.targets.remove(i);
        self.weights.remove(i);
        self.dof_weights = None;
        true
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.targets.clear();
        self.weights.clear();
        self.dof_weights = None;
    }

    fn rows(&self) -> usize {
        self.targets.iter().map(DVector::len).sum()
    }

    fn set_target(&mut self, index: usize, force: DVector<f64>) -> Result<(), ConfigError> {
        let len = self.targets.len();
        let slot = self
            .targets
            .get_mut(index)
            .ok_or(ConfigError::TargetIndexOutOfRange { index, len })?;
        if slot.len() != force.len() {
            return Err(ConfigError::InvalidValue {
                field: format!("force target {index}"),
                message: format!("expected {} components, got {}", slot.len(), force.len()),
            });
        }
        *slot = force;
        Ok(())
    }

    fn set_weights(&mut self, weights: &[f64]) -> Result<(), ConfigError> {
        if weights.len() == self.ids.len() {
            self.weights = weights.to_vec();
            self.dof_weights = None;
            Ok(())
        } else if weights.len() == self.rows() {
            self.dof_weights = Some(DVector::from_column_slice(weights));
            Ok(())
        } else {
            Err(ConfigError::WeightSizeMismatch {
                expected_targets: self.ids.len(),
                expected_rows: self.rows(),
                got: weights.len(),
            })
        }
    }

    fn row_weights(&self) -> DVector<f64> {
        if let Some(w) = &self.dof_weights {
            return w.clone();
        }
        let rows = self
            .targets
            .iter()
            .zip(&self.weights)
            .flat_map(|(t, &w)| std::iter::repeat(w).take(t.len()));
        DVector::from_iterator(self.rows(), rows)
    }

    fn stacked_targets(&self) -> DVector<f64> {
        let mut out = DVector::zeros(self.rows());
        let mut row = 0;
        for t in &self.targets {
            out.rows_mut(row, t.len()).copy_from(t);
            row += t.len();
        }
        out
    }
}

/// `H = diag(w) h`, `b = diag(w) (target - f0)`.
fn weighted_tracking(
    w: &DVector<f64>,
    response: &DMatrix<f64>,
    target: &DVector<f64>,
    f0: &DVector<f64>,
) -> (DMatrix<f64>, DVector<f64>) {
    let mut h = response.clone();
    for (i, mut r) in h.row_iter_mut().enumerate() {
        r *= w[i];
    }
    let b = (target - f0).component_mul(w);
    (h, b)
}

fn check_weight(weight: f64) -> Result<(), ConfigError> {
    if weight < 0.0 || !weight.is_finite() {
        return Err(ConfigError::InvalidValue {
            field: "force target weight".into(),
            message: format!("{weight} (must be finite and >= 0)"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Effector linearization
// ---------------------------------------------------------------------------

/// Predicted effector forces `f0 + Hf x` for one step.
#[derive(Clone, Debug)]
pub struct EffectorResponse {
    pub f0: DVector<f64>,
    pub hf: DMatrix<f64>,
}

/// Stacked forces and state derivatives of `effectors` at the model's
/// current excitations.
fn stacked_linearization(
    model: &dyn MechModel,
    effectors: &[EffectorId],
    n: usize,
) -> Result<ForceLinearization, ControlError> {
    let lins = effectors
        .iter()
        .map(|&e| model.force_linearization(e))
        .collect::<Result<Vec<_>, _>>()?;
    let k: usize = lins.iter().map(ForceLinearization::size).sum();

    let mut out = ForceLinearization {
        force: DVector::zeros(k),
        dfdx: DMatrix::zeros(k, n),
        dfdv: DMatrix::zeros(k, n),
    };
    let mut row = 0;
    for l in &lins {
        let s = l.size();
        out.force.rows_mut(row, s).copy_from(&l.force);
        out.dfdx.view_mut((row, 0), (s, n)).copy_from(&l.dfdx);
        out.dfdv.view_mut((row, 0), (s, n)).copy_from(&l.dfdv);
        row += s;
    }
    Ok(out)
}

fn stacked_forces(
    model: &dyn MechModel,
    effectors: &[EffectorId],
) -> Result<DVector<f64>, ControlError> {
    let forces = effectors
        .iter()
        .map(|&e| model.force_linearization(e).map(|l| l.force))
        .collect::<Result<Vec<_>, _>>()?;
    let k = forces.iter().map(DVector::len).sum();
    Ok(DVector::from_iterator(k, forces.iter().flat_map(|f| f.iter().copied())))
}

/// Linearize the stacked forces of `effectors` through the step's velocity
/// response. With `static_only` the velocity derivative is dropped.
///
/// The baseline follows the excitation mode: zero excitation in holistic
/// mode, the current excitation in incremental mode. Excitations are
/// restored before returning.
pub fn effector_response(
    ctx: &mut TermContext<'_>,
    effectors: &[EffectorId],
    static_only: bool,
) -> Result<EffectorResponse, ControlError> {
    let snapshot = ctx.actuators.snapshot(&*ctx.model)?;
    let result = perturb_effectors(ctx, effectors, static_only);
    ctx.actuators.restore(&mut *ctx.model, &snapshot)?;
    result
}

fn perturb_effectors(
    ctx: &mut TermContext<'_>,
    effectors: &[EffectorId],
    static_only: bool,
) -> Result<EffectorResponse, ControlError> {
    let resp = ctx.response;
    let n = resp.u0.len();
    let m = ctx.num_vars();
    let baseline = ctx.excitation_offset();
    ctx.actuators.write(&mut *ctx.model, &baseline)?;

    let lin = stacked_linearization(&*ctx.model, effectors, n)?;
    let k = lin.size();

    // Direct dependence of the forces on each excitation.
    let mut fa = DMatrix::zeros(k, m);
    let upper = ctx.actuators.upper_bounds();
    for j in 0..m {
        let delta = step_delta(ctx.mode, baseline[j], upper[j]);
        ctx.actuators.write_one(&mut *ctx.model, j, baseline[j] + delta)?;
        let f = stacked_forces(&*ctx.model, effectors)?;
        ctx.actuators.write_one(&mut *ctx.model, j, baseline[j])?;
        fa.set_column(j, &((f - &lin.force) / delta));
    }

    let trapezoidal = resp.integrator == Integrator::Trapezoidal;
    let hx = if trapezoidal { resp.h / 2.0 } else { resp.h };
    let mut jf = &lin.dfdx * hx;
    // Terms in the start-of-step velocity.
    let mut offset = if trapezoidal {
        &lin.dfdx * (resp.h / 2.0)
    } else {
        DMatrix::zeros(k, n)
    };
    if !static_only {
        jf += &lin.dfdv;
        offset -= &lin.dfdv;
    }

    let f0 = &lin.force + &jf * &resp.u0 + offset * &resp.current_velocity;
    let hf = jf * &resp.hu + fa;
    Ok(EffectorResponse { f0, hf })
}

// ---------------------------------------------------------------------------
// ForceTargetTerm
// ---------------------------------------------------------------------------

/// Tracks forces of bilateral constraint connectors.
#[derive(Clone, Debug)]
pub struct ForceTargetTerm {
    base: TermBase,
    targets: ForceTargets<ConnectorId>,
}

impl Default for ForceTargetTerm {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl ForceTargetTerm {
    pub fn new(weight: f64) -> Self {
        Self {
            base: TermBase::new("constraint force", weight),
            targets: ForceTargets::new(),
        }
    }

    /// Track the force of `connector`, initially zero. Returns the target
    /// index.
    pub fn add_force(
        &mut self,
        model: &dyn MechModel,
        connector: ConnectorId,
        weight: f64,
    ) -> Result<usize, ControlError> {
        check_weight(weight)?;
        let size = model.connector_size(connector)?;
        if size == 0 {
            return Err(ConfigError::EmptyForceComponent(connector.0).into());
        }
        Ok(self.targets.push(connector, size, weight))
    }

    pub fn remove_force(&mut self, connector: ConnectorId) -> bool {
        self.targets.remove(connector)
    }

    pub fn clear_forces(&mut self) {
        self.targets.clear();
    }

    pub fn connectors(&self) -> &[ConnectorId] {
        &self.targets.ids
    }

    pub fn target_force(&self, index: usize) -> Option<&DVector<f64>> {
        self.targets.targets.get(index)
    }

    pub fn set_target_force(&mut self, index: usize, force: DVector<f64>) -> Result<(), ConfigError> {
        self.targets.set_target(index, force)
    }

    pub fn set_target_weights(&mut self, weights: &[f64]) -> Result<(), ConfigError> {
        self.targets.set_weights(weights)
    }

    pub fn num_rows(&self) -> usize {
        self.targets.rows()
    }

    fn least_squares(
        &self,
        ctx: &TermContext<'_>,
    ) -> Result<(DMatrix<f64>, DVector<f64>), ControlError> {
        let jc = ctx.model.constraint_force_jacobian(&self.targets.ids)?;
        let resp = ctx.response;
        let predicted = &jc * &resp.hlam;
        let f0 = &jc * &resp.lam0;
        Ok(weighted_tracking(
            &self.targets.row_weights(),
            &predicted,
            &self.targets.stacked_targets(),
            &f0,
        ))
    }
}

// ---------------------------------------------------------------------------
// ForceEffectorTerm
// ---------------------------------------------------------------------------

/// Tracks forces of springs and muscles.
#[derive(Clone, Debug)]
pub struct ForceEffectorTerm {
    base: TermBase,
    targets: ForceTargets<EffectorId>,
    static_only: bool,
}

impl Default for ForceEffectorTerm {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl ForceEffectorTerm {
    pub fn new(weight: f64) -> Self {
        Self {
            base: TermBase::new("effector force", weight),
            targets: ForceTargets::new(),
            static_only: false,
        }
    }

    /// Ignore the velocity dependence of effector forces.
    #[must_use]
    pub const fn with_static_only(mut self, static_only: bool) -> Self {
        self.static_only = static_only;
        self
    }

    pub const fn is_static_only(&self) -> bool {
        self.static_only
    }

    pub fn add_force(
        &mut self,
        model: &dyn MechModel,
        effector: EffectorId,
        weight: f64,
    ) -> Result<usize, ControlError> {
        check_weight(weight)?;
        let size = model.force_linearization(effector)?.size();
        if size == 0 {
            return Err(ConfigError::EmptyForceComponent(effector.0).into());
        }
        Ok(self.targets.push(effector, size, weight))
    }

    pub fn remove_force(&mut self, effector: EffectorId) -> bool {
        self.targets.remove(effector)
    }

    pub fn clear_forces(&mut self) {
        self.targets.clear();
    }

    pub fn effectors(&self) -> &[EffectorId] {
        &self.targets.ids
    }

    pub fn set_target_force(&mut self, index: usize, force: DVector<f64>) -> Result<(), ConfigError> {
        self.targets.set_target(index, force)
    }

    pub fn set_target_weights(&mut self, weights: &[f64]) -> Result<(), ConfigError> {
        self.targets.set_weights(weights)
    }

    pub fn num_rows(&self) -> usize {
        self.targets.rows()
    }

    fn least_squares(
        &self,
        ctx: &mut TermContext<'_>,
    ) -> Result<(DMatrix<f64>, DVector<f64>), ControlError> {
        let er = effector_response(ctx, &self.targets.ids, self.static_only)?;
        Ok(weighted_tracking(
            &self.targets.row_weights(),
            &er.hf,
            &self.targets.stacked_targets(),
            &er.f0,
        ))
    }
}

// ---------------------------------------------------------------------------
// ForceMinimizationTerm
// ---------------------------------------------------------------------------

/// Drives the predicted forces of a set of effectors toward zero.
#[derive(Clone, Debug)]
pub struct ForceMinimizationTerm {
    base: TermBase,
    effectors: Vec<EffectorId>,
    static_only: bool,
}

impl ForceMinimizationTerm {
    pub fn new(effectors: Vec<EffectorId>, weight: f64) -> Self {
        Self {
            base: TermBase::new("force minimization", weight),
            effectors,
            static_only: false,
        }
    }

    #[must_use]
    pub const fn with_static_only(mut self, static_only: bool) -> Self {
        self.static_only = static_only;
        self
    }

    pub fn effectors(&self) -> &[EffectorId] {
        &self.effectors
    }
}

// ---------------------------------------------------------------------------
// Term impls
// ---------------------------------------------------------------------------

impl_term!(ForceTargetTerm);
impl_term!(ForceEffectorTerm);
impl_term!(ForceMinimizationTerm);

macro_rules! impl_tracking {
    ($ty:ty) => {
        impl CostTerm for $ty {
            fn add_cost(
                &mut self,
                q: &mut DMatrix<f64>,
                p: &mut DVector<f64>,
                ctx: &mut TermContext<'_>,
            ) -> Result<(), ControlError> {
                let (h, b) = self.least_squares(ctx)?;
                add_least_squares_cost(&self.base, q, p, h, b);
                Ok(())
            }
        }

        impl ConstraintTerm for $ty {
            fn constraint_type(&self) -> ConstraintType {
                ConstraintType::Equality
            }

            fn num_constraints(&self, _num_vars: usize) -> usize {
                self.num_rows()
            }

            fn add_constraints(
                &mut self,
                a: &mut DMatrix<f64>,
                b: &mut DVector<f64>,
                row_offset: usize,
                ctx: &mut TermContext<'_>,
            ) -> Result<usize, ControlError> {
                let (h, rhs) = self.least_squares(ctx)?;
                Ok(add_least_squares_rows(&self.base, a, b, row_offset, h, rhs))
            }
        }
    };
}

impl_tracking!(ForceTargetTerm);
impl_tracking!(ForceEffectorTerm);

impl CostTerm for ForceMinimizationTerm {
    fn add_cost(
        &mut self,
        q: &mut DMatrix<f64>,
        p: &mut DVector<f64>,
        ctx: &mut TermContext<'_>,
    ) -> Result<(), ControlError> {
        let er = effector_response(ctx, &self.effectors, self.static_only)?;
        add_least_squares_cost(&self.base, q, p, er.hf, -er.f0);
        Ok(())
    }
}
