//! Linear algebra for the normal equations of the pose-graph problem.
//!
//! Jacobians are `faer` sparse column matrices; the Gauss-Newton / Levenberg-Marquardt systems
//! `(JᵀJ + λI) δ = −Jᵀr` are solved with a sparse Cholesky factorization whose symbolic
//! analysis is reused across iterations.

use std::fmt;

use thiserror::Error;

pub mod cholesky;

pub use cholesky::SparseCholeskySolver;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = faer::sparse::SparseColMat<usize, f64>;

/// Type alias for faer matrices (used for vectors)
pub type FaerMatrix = faer::Mat<f64>;

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Errors raised while assembling or factorizing a linear system
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Symbolic or numeric factorization failed
    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    /// The matrix is not positive definite (rank deficient or indefinite)
    #[error("Singular matrix: {0}")]
    SingularMatrix(String),

    /// Malformed input (dimension mismatch, bad sparse structure)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Linear solver strategy for the normal equations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinearSolverType {
    /// Sparse Cholesky on `JᵀJ + λI`
    #[default]
    SparseNormalCholesky,
}

impl fmt::Display for LinearSolverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseNormalCholesky => write!(f, "SPARSE_NORMAL_CHOLESKY"),
        }
    }
}

/// Solver for the least-squares normal equations built from a sparse Jacobian.
pub trait SparseLinearSolver {
    /// Solve `JᵀJ δ = −Jᵀr`.
    fn solve_normal_equation(
        &mut self,
        residuals: &FaerMatrix,
        jacobian: &SparseMatrix,
    ) -> LinAlgResult<FaerMatrix>;

    /// Solve `(JᵀJ + λI) δ = −Jᵀr`.
    fn solve_augmented_equation(
        &mut self,
        residuals: &FaerMatrix,
        jacobian: &SparseMatrix,
        lambda: f64,
    ) -> LinAlgResult<FaerMatrix>;

    /// Whether `JᵀJ` is singular relative to its largest diagonal entry.
    fn has_null_space(&mut self, jacobian: &SparseMatrix, tolerance: f64) -> LinAlgResult<bool>;
}

/// Create the linear solver selected by `solver_type`.
pub fn create_linear_solver(solver_type: LinearSolverType) -> Box<dyn SparseLinearSolver> {
    match solver_type {
        LinearSolverType::SparseNormalCholesky => Box::new(SparseCholeskySolver::new()),
    }
}
