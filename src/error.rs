//! Error types for the spa2d library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! Numerical degeneracy (a rank-deficient problem) is deliberately not an error variant:
//! it is reported through [`crate::optimizer::SolverSummary::converged`].

use crate::{linalg::LinAlgError, optimizer::OptimizerError};
use std::io::Error;
use thiserror::Error;

/// Main result type used throughout the spa2d library
pub type SpaResult<T> = Result<T, SpaError>;

/// Main error type for the spa2d library
#[derive(Debug, Clone, Error)]
pub enum SpaError {
    /// Malformed graph or problem setup, detected before any solve is attempted
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// Solver related errors
    #[error("Solver error: {0}")]
    Solver(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO related errors (report export)
    #[error("IO error: {0}")]
    Io(String),
}

impl From<Error> for SpaError {
    fn from(err: Error) -> Self {
        SpaError::Io(err.to_string())
    }
}

impl From<csv::Error> for SpaError {
    fn from(err: csv::Error) -> Self {
        SpaError::Io(format!("CSV export failed: {err}"))
    }
}

impl From<LinAlgError> for SpaError {
    fn from(err: LinAlgError) -> Self {
        SpaError::LinearAlgebra(err.to_string())
    }
}

impl From<OptimizerError> for SpaError {
    fn from(err: OptimizerError) -> Self {
        SpaError::Solver(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_spa_error_display() {
        let error = SpaError::Configuration("node 7 is not in the graph".to_string());
        assert_eq!(
            error.to_string(),
            "Configuration error: node 7 is not in the graph"
        );
    }

    #[test]
    fn test_spa_error_from_io() {
        let io_error = Error::new(ErrorKind::NotFound, "File not found");
        let spa_error = SpaError::from(io_error);

        match spa_error {
            SpaError::Io(msg) => assert!(msg.contains("File not found")),
            _ => panic!("Expected IO error"),
        }
    }

    #[test]
    fn test_spa_error_from_linalg() {
        let err = SpaError::from(LinAlgError::SingularMatrix("rank 6 of 9".to_string()));
        match err {
            SpaError::LinearAlgebra(msg) => assert!(msg.contains("rank 6 of 9")),
            _ => panic!("Expected linear algebra error"),
        }
    }

    #[test]
    fn test_spa_error_from_optimizer() {
        let err = SpaError::from(OptimizerError::ParameterDimensionMismatch {
            expected: 9,
            actual: 6,
        });
        assert!(matches!(err, SpaError::Solver(_)));
    }
}
