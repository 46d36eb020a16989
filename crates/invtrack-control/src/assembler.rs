//! Builds and solves the per-step QP from a set of terms.

use invtrack_core::{ConstraintType, ControlError};
use invtrack_qp::{ClarabelQpSolver, QpProblem, QpSolution, QpSolver};
use nalgebra::DVector;
use tracing::debug;

use crate::term::{ConstraintTerm, CostTerm, TermContext};

/// Owns the QP buffers and the solve primitive.
pub struct QpAssembler {
    problem: QpProblem,
    solver: Box<dyn QpSolver>,
    last_solution: Option<QpSolution>,
}

impl Default for QpAssembler {
    fn default() -> Self {
        Self::new(Box::new(ClarabelQpSolver::default()))
    }
}

impl std::fmt::Debug for QpAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QpAssembler")
            .field("problem", &self.problem)
            .field("last_solution", &self.last_solution)
            .finish_non_exhaustive()
    }
}

impl QpAssembler {
    pub fn new(solver: Box<dyn QpSolver>) -> Self {
        Self {
            problem: QpProblem::new(0),
            solver,
            last_solution: None,
        }
    }

    /// The last assembled problem.
    pub const fn problem(&self) -> &QpProblem {
        &self.problem
    }

    /// The last solver result, successful or not.
    pub const fn last_solution(&self) -> Option<&QpSolution> {
        self.last_solution.as_ref()
    }

    pub fn set_solver(&mut self, solver: Box<dyn QpSolver>) {
        self.solver = solver;
    }

    /// Assemble the enabled terms and solve once.
    ///
    /// # Panics
    ///
    /// Panics if a constraint term writes a different number of rows than it
    /// reported.
    pub fn solve(
        &mut self,
        cost_terms: &mut [&mut dyn CostTerm],
        constraint_terms: &mut [&mut dyn ConstraintTerm],
        ctx: &mut TermContext<'_>,
    ) -> Result<DVector<f64>, ControlError> {
        let n = ctx.num_vars();
        for term in cost_terms.iter_mut().filter(|t| t.is_enabled()) {
            term.set_size(n);
        }
        let mut n_ineq = 0;
        let mut n_eq = 0;
        for term in constraint_terms.iter_mut().filter(|t| t.is_enabled()) {
            term.set_size(n);
            match term.constraint_type() {
                ConstraintType::Inequality => n_ineq += term.num_constraints(n),
                ConstraintType::Equality => n_eq += term.num_constraints(n),
            }
        }
        self.problem.reset(n, n_ineq, n_eq);

        for term in cost_terms.iter_mut().filter(|t| t.is_enabled()) {
            term.add_cost(&mut self.problem.q, &mut self.problem.p, ctx)?;
        }

        let mut ineq_row = 0;
        let mut eq_row = 0;
        for term in constraint_terms.iter_mut().filter(|t| t.is_enabled()) {
            let declared = term.num_constraints(n);
            let (a, b, row) = match term.constraint_type() {
                ConstraintType::Inequality => {
                    (&mut self.problem.a, &mut self.problem.b, &mut ineq_row)
                }
                ConstraintType::Equality => {
                    (&mut self.problem.aeq, &mut self.problem.beq, &mut eq_row)
                }
            };
            let next = term.add_constraints(a, b, *row, ctx)?;
            assert_eq!(
                next - *row,
                declared,
                "term '{}' wrote a different number of rows than it declared",
                term.name()
            );
            *row = next;
        }

        let solution = self.solver.solve(&self.problem)?;
        debug!(
            n,
            n_ineq,
            n_eq,
            status = ?solution.status,
            iterations = solution.iterations,
            "qp solved"
        );
        self.last_solution = Some(solution.clone());
        Ok(solution.into_result()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use invtrack_core::{ExcitationMode, ExciterId};
    use invtrack_test_utils::mocks::NullModel;

    use crate::actuator::{Actuator, ActuatorSet};
    use crate::response::ExcitationResponse;
    use crate::terms::{BoundsTerm, L2RegularizationTerm, ProportionalTerm};
    use crate::term::Term;

    fn actuators(m: usize) -> ActuatorSet {
        let mut set = ActuatorSet::new();
        for i in 0..m {
            set.add(Actuator::new(ExciterId(i), format!("a{i}"))).unwrap();
        }
        set
    }

    fn run(
        assembler: &mut QpAssembler,
        costs: &mut [&mut dyn CostTerm],
        constraints: &mut [&mut dyn ConstraintTerm],
        m: usize,
    ) -> Result<DVector<f64>, ControlError> {
        let set = actuators(m);
        let excitations = DVector::zeros(m);
        let response = ExcitationResponse::default();
        let mut model = NullModel;
        let mut ctx = TermContext {
            t0: 0.0,
            t1: 0.01,
            h: 0.01,
            mode: ExcitationMode::Holistic,
            excitations: &excitations,
            response: &response,
            actuators: &set,
            model: &mut model,
        };
        assembler.solve(costs, constraints, &mut ctx)
    }

    #[test]
    fn rows_sized_to_enabled_terms() {
        let mut asm = QpAssembler::default();
        let mut l2 = L2RegularizationTerm::new(1.0);
        let mut bounds = BoundsTerm::new(0.0, 1.0).unwrap();
        run(&mut asm, &mut [&mut l2], &mut [&mut bounds], 3).unwrap();
        assert_eq!(asm.problem().num_inequalities(), 6);
        assert_eq!(asm.problem().num_equalities(), 0);

        bounds.set_enabled(false);
        run(&mut asm, &mut [&mut l2], &mut [&mut bounds], 3).unwrap();
        assert_eq!(asm.problem().num_inequalities(), 0);
    }

    #[test]
    fn linear_cost_pushes_to_bound() {
        let mut asm = QpAssembler::default();
        let mut l2 = L2RegularizationTerm::new(1.0);
        // minimize 1/2 x^2 - x within [0, 0.5]
        let mut prop = ProportionalTerm::new(-1.0);
        let mut bounds = BoundsTerm::new(0.0, 0.5).unwrap();
        let x = run(&mut asm, &mut [&mut l2, &mut prop], &mut [&mut bounds], 1).unwrap();
        assert_relative_eq!(x[0], 0.5, epsilon = 1e-6);
        assert!(asm.last_solution().unwrap().status.is_solved());
    }

    #[test]
    fn disabled_cost_contributes_nothing() {
        let mut asm = QpAssembler::default();
        let mut l2 = L2RegularizationTerm::new(1.0);
        let mut prop = ProportionalTerm::new(-1.0);
        prop.set_enabled(false);
        let x = run(&mut asm, &mut [&mut l2, &mut prop], &mut [], 2).unwrap();
        assert_relative_eq!(asm.problem().p, DVector::zeros(2));
        assert_relative_eq!(x, DVector::zeros(2), epsilon = 1e-8);
    }
}
