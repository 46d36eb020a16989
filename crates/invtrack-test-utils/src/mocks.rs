//! Mock implementations of the collaborator traits for testing.

use std::collections::VecDeque;

use invtrack_core::{
    ConnectorId, DynamicsError, EffectorId, ExciterId, ForceLinearization, Integrator, MechModel,
    MotionSource, QpError, QpStatus, SourcePose,
};
use invtrack_qp::{QpProblem, QpSolution, QpSolver};
use nalgebra::{DMatrix, DVector};

// ---------------------------------------------------------------------------
// NullModel
// ---------------------------------------------------------------------------

/// A model with no state and no components. Every component lookup fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullModel;

impl MechModel for NullModel {
    fn active_vel_state_size(&self) -> usize {
        0
    }

    fn active_velocity(&self) -> DVector<f64> {
        DVector::zeros(0)
    }

    fn integrator(&self) -> Integrator {
        Integrator::BackwardEuler
    }

    fn num_exciters(&self) -> usize {
        0
    }

    fn excitation(&self, id: ExciterId) -> Result<f64, DynamicsError> {
        Err(DynamicsError::UnknownComponent(id.0))
    }

    fn set_excitation(&mut self, id: ExciterId, _value: f64) -> Result<(), DynamicsError> {
        Err(DynamicsError::UnknownComponent(id.0))
    }

    fn update_constraints(&mut self, _t: f64) {}

    fn update_forces(&mut self, _t: f64) {}

    fn active_forces(&self) -> DVector<f64> {
        DVector::zeros(0)
    }

    fn set_active_forces(&mut self, _forces: &DVector<f64>) {}

    fn num_bilateral_constraints(&self) -> usize {
        0
    }

    fn source_pose(&self, source: MotionSource) -> Result<SourcePose, DynamicsError> {
        let (MotionSource::Point(i) | MotionSource::Frame(i)) = source;
        Err(DynamicsError::UnknownComponent(i))
    }

    fn source_velocity(&self, source: MotionSource) -> Result<DVector<f64>, DynamicsError> {
        let (MotionSource::Point(i) | MotionSource::Frame(i)) = source;
        Err(DynamicsError::UnknownComponent(i))
    }

    fn velocity_jacobian(&self, sources: &[MotionSource]) -> Result<DMatrix<f64>, DynamicsError> {
        let rows = sources.iter().map(|s| s.vel_size()).sum();
        Ok(DMatrix::zeros(rows, 0))
    }

    fn connector_size(&self, connector: ConnectorId) -> Result<usize, DynamicsError> {
        Err(DynamicsError::UnknownComponent(connector.0))
    }

    fn constraint_force_jacobian(
        &self,
        connectors: &[ConnectorId],
    ) -> Result<DMatrix<f64>, DynamicsError> {
        match connectors.first() {
            Some(c) => Err(DynamicsError::UnknownComponent(c.0)),
            None => Ok(DMatrix::zeros(0, 0)),
        }
    }

    fn force_linearization(&self, effector: EffectorId) -> Result<ForceLinearization, DynamicsError> {
        Err(DynamicsError::UnknownComponent(effector.0))
    }

    fn stiffness_matrix(&self) -> DMatrix<f64> {
        DMatrix::zeros(0, 0)
    }
}

// ---------------------------------------------------------------------------
// FailingQpSolver
// ---------------------------------------------------------------------------

/// A QP solver that never converges.
#[derive(Clone, Debug)]
pub struct FailingQpSolver {
    status: QpStatus,
    calls: usize,
}

impl Default for FailingQpSolver {
    fn default() -> Self {
        Self::new(QpStatus::MaxIterations)
    }
}

impl FailingQpSolver {
    pub const fn new(status: QpStatus) -> Self {
        Self { status, calls: 0 }
    }

    pub const fn calls(&self) -> usize {
        self.calls
    }
}

impl QpSolver for FailingQpSolver {
    fn solve(&mut self, problem: &QpProblem) -> Result<QpSolution, QpError> {
        self.calls += 1;
        Ok(QpSolution {
            x: DVector::zeros(problem.num_vars()),
            status: self.status,
            iterations: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedQpSolver
// ---------------------------------------------------------------------------

/// A QP solver that returns queued solutions in order, then zeros.
///
/// Every problem it receives is recorded.
#[derive(Clone, Debug, Default)]
pub struct ScriptedQpSolver {
    queue: VecDeque<DVector<f64>>,
    problems: Vec<QpProblem>,
}

impl ScriptedQpSolver {
    pub fn new(solutions: impl IntoIterator<Item = DVector<f64>>) -> Self {
        Self {
            queue: solutions.into_iter().collect(),
            problems: Vec::new(),
        }
    }

    pub fn problems(&self) -> &[QpProblem] {
        &self.problems
    }
}

impl QpSolver for ScriptedQpSolver {
    fn solve(&mut self, problem: &QpProblem) -> Result<QpSolution, QpError> {
        self.problems.push(problem.clone());
        let n = problem.num_vars();
        let x = self.queue.pop_front().unwrap_or_else(|| DVector::zeros(n));
        if x.len() != n {
            return Err(QpError::DimensionMismatch(format!(
                "scripted solution has {} entries, problem has {n} variables",
                x.len()
            )));
        }
        Ok(QpSolution {
            x,
            status: QpStatus::Solved,
            iterations: 1,
        })
    }
}
