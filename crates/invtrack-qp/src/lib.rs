//! Quadratic program container and solve primitive.
//!
//! Problems have the form
//!
//! ```text
//! minimize    1/2 x^T Q x + p^T x
//! subject to  A x >= b
//!             Aeq x = beq
//! ```
//!
//! [`ClarabelQpSolver`] solves them with the Clarabel interior-point method.

pub mod problem;
pub mod solver;

pub use problem::QpProblem;
pub use solver::{ClarabelQpSolver, QpSolution, QpSolver};
