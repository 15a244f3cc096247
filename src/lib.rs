//! Sparse pose adjustment for 2D pose graphs.
//!
//! A [`PoseGraph`] holds SE(2) node estimates and relative-pose constraints. The
//! [`builder`] turns it into a least-squares [`core::problem::Problem`] whose residual terms
//! produce Jacobians either analytically or through forward-mode automatic differentiation, and
//! [`optimizer`] solves it with Levenberg-Marquardt on top of a sparse Cholesky factorization.
//! [`harness`] times both Jacobian strategies against each other.

pub mod builder;
pub mod core;
pub mod error;
pub mod factors;
pub mod harness;
pub mod linalg;
pub mod logger;
pub mod optimizer;
pub mod spa;

pub use builder::{
    JacobianStrategy, LossFunctionKind, ProblemBuilder, ProblemBuilderConfig, ReferenceNode,
};
pub use core::graph::PoseGraph;
pub use core::pose::{Constraint, NodeId, Pose};
pub use error::{SpaError, SpaResult};
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{OptimizationStatus, SolverSummary};
pub use spa::{SpaOptimizer, SpaOptimizerConfig};
