//! Nonlinear least-squares solvers for the pose-graph problem.
//!
//! A solver takes an assembled [`Problem`] and the flat parameter slice it was built for,
//! moves the parameters in place and reports what happened in a [`SolverSummary`].
//! Rank deficiency, exhausted damping and iteration limits are not errors: they come back as a
//! summary with `converged == false`.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::problem::Problem;
use crate::error::SpaResult;
use crate::linalg::LinAlgError;

pub mod levenberg_marquardt;

pub use levenberg_marquardt::{LevenbergMarquardt, LevenbergMarquardtConfig};

/// Errors that stop a solve before it starts
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// The parameter slice does not match the problem
    #[error("Parameter dimension mismatch: problem expects {expected} parameters, got {actual}")]
    ParameterDimensionMismatch { expected: usize, actual: usize },

    /// Invalid solver configuration
    #[error("Invalid solver configuration: {0}")]
    InvalidConfig(String),

    /// Linear algebra failure outside the damping loop
    #[error("Linear algebra failure: {0}")]
    LinearAlgebra(#[from] LinAlgError),
}

/// Status of an optimization process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Relative cost change fell below the function tolerance
    FunctionToleranceReached,
    /// Step norm fell below the parameter tolerance
    ParameterToleranceReached,
    /// Gradient max-norm fell below the gradient tolerance
    GradientToleranceReached,
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// Damping grew past its bound without an acceptable step, or the cost is not finite
    NumericalFailure,
    /// Timeout reached
    Timeout,
    /// A tolerance was met but `JᵀJ` at the final estimate is singular: some parameter
    /// combination is unobservable (no gauge fixing, or a node with no constraints)
    RankDeficient,
}

impl OptimizationStatus {
    /// Whether this status counts as a converged solve.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::FunctionToleranceReached
                | OptimizationStatus::ParameterToleranceReached
                | OptimizationStatus::GradientToleranceReached
        )
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::FunctionToleranceReached => write!(f, "Function tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::NumericalFailure => write!(f, "Numerical failure"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
            OptimizationStatus::RankDeficient => write!(f, "Rank deficient"),
        }
    }
}

/// Outcome of one solve.
#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub converged: bool,
    pub status: OptimizationStatus,
    pub total_time: Duration,
    pub iterations: usize,
    /// Steps that lowered the cost and were kept
    pub successful_steps: usize,
    /// Steps rejected (cost increase or failed factorization)
    pub unsuccessful_steps: usize,
    pub num_residuals: usize,
    pub num_parameters: usize,
    /// Parameters not held constant
    pub num_effective_parameters: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub cost_evaluations: usize,
    pub jacobian_evaluations: usize,
}

impl fmt::Display for SolverSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Solver Summary ===")?;
        writeln!(f, "Status:                    {}", self.status)?;
        writeln!(f, "Converged:                 {}", self.converged)?;
        writeln!(f, "Total time:                {:?}", self.total_time)?;
        writeln!(f, "Residuals:                 {}", self.num_residuals)?;
        writeln!(f, "Parameters:                {}", self.num_parameters)?;
        writeln!(
            f,
            "Effective parameters:      {}",
            self.num_effective_parameters
        )?;
        writeln!(f, "Iterations:                {}", self.iterations)?;
        writeln!(f, "Successful steps:          {}", self.successful_steps)?;
        writeln!(f, "Unsuccessful steps:        {}", self.unsuccessful_steps)?;
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(f, "Cost evaluations:          {}", self.cost_evaluations)?;
        write!(f, "Jacobian evaluations:      {}", self.jacobian_evaluations)
    }
}

/// Core trait for optimization solvers.
pub trait Solver {
    /// Minimize `problem`, writing the result into `parameters`.
    fn solve(&mut self, problem: &Problem, parameters: &mut [f64]) -> SpaResult<SolverSummary>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_convergence() {
        assert!(OptimizationStatus::FunctionToleranceReached.is_converged());
        assert!(OptimizationStatus::GradientToleranceReached.is_converged());
        assert!(!OptimizationStatus::MaxIterationsReached.is_converged());
        assert!(!OptimizationStatus::NumericalFailure.is_converged());
        assert!(!OptimizationStatus::Timeout.is_converged());
        assert!(!OptimizationStatus::RankDeficient.is_converged());
    }

    #[test]
    fn test_optimizer_error_display() {
        let err = OptimizerError::ParameterDimensionMismatch {
            expected: 9,
            actual: 6,
        };
        assert!(err.to_string().contains("expects 9"));

        let err = OptimizerError::from(LinAlgError::SingularMatrix("zero pivot".to_string()));
        assert!(err.to_string().contains("zero pivot"));
    }
}
