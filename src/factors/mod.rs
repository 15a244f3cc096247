//! Residual terms for SE(2) relative-pose constraints.
//!
//! Every term reads six scalar parameters, `(xs, ys, θs, xt, yt, θt)`, each its own 1-scalar
//! parameter block, and produces a 3-vector residual. Jacobians are returned per parameter as a
//! 3×1 column, and only for the parameters the caller asks for in a [`JacobianRequest`].
//!
//! # Module Structure
//!
//! - `spa_residual`: the residual formula, written once over [`num_dual::DualNum`]
//! - `autodiff`: Jacobians from forward-mode dual numbers (every column, every time)
//! - `analytic`: hand-derived Jacobians, computed only for requested columns

use nalgebra::{Matrix3, Matrix3x6, Vector3};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::pose::Constraint;

pub mod analytic;
pub mod autodiff;
pub mod spa_residual;

pub use analytic::AnalyticSpaFactor;
pub use autodiff::AutoDiffSpaFactor;
pub use spa_residual::spa_residual;

/// Residual dimension of every SPA term.
pub const NUM_RESIDUALS: usize = 3;

/// Number of 1-scalar parameter blocks read by every SPA term.
pub const NUM_PARAMETER_BLOCKS: usize = 6;

/// One of the six scalar parameters a SPA term depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterSlot {
    SourceX,
    SourceY,
    SourceTheta,
    TargetX,
    TargetY,
    TargetTheta,
}

impl ParameterSlot {
    pub const ALL: [ParameterSlot; NUM_PARAMETER_BLOCKS] = [
        ParameterSlot::SourceX,
        ParameterSlot::SourceY,
        ParameterSlot::SourceTheta,
        ParameterSlot::TargetX,
        ParameterSlot::TargetY,
        ParameterSlot::TargetTheta,
    ];

    /// Position of the slot in the parameter array.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ParameterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterSlot::SourceX => "source_x",
            ParameterSlot::SourceY => "source_y",
            ParameterSlot::SourceTheta => "source_theta",
            ParameterSlot::TargetX => "target_x",
            ParameterSlot::TargetY => "target_y",
            ParameterSlot::TargetTheta => "target_theta",
        };
        write!(f, "{name}")
    }
}

/// Which Jacobian columns the caller wants.
///
/// An empty request means "residual only".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JacobianRequest {
    columns: [bool; NUM_PARAMETER_BLOCKS],
}

impl JacobianRequest {
    pub const NONE: JacobianRequest = JacobianRequest {
        columns: [false; NUM_PARAMETER_BLOCKS],
    };

    pub const ALL: JacobianRequest = JacobianRequest {
        columns: [true; NUM_PARAMETER_BLOCKS],
    };

    pub fn from_flags(columns: [bool; NUM_PARAMETER_BLOCKS]) -> Self {
        Self { columns }
    }

    /// Request exactly the given slots.
    pub fn only(slots: &[ParameterSlot]) -> Self {
        slots.iter().fold(Self::NONE, |request, &slot| request.with(slot))
    }

    pub fn with(mut self, slot: ParameterSlot) -> Self {
        self.columns[slot.index()] = true;
        self
    }

    pub fn without(mut self, slot: ParameterSlot) -> Self {
        self.columns[slot.index()] = false;
        self
    }

    pub fn contains(&self, slot: ParameterSlot) -> bool {
        self.columns[slot.index()]
    }

    pub fn is_empty(&self) -> bool {
        !self.columns.iter().any(|&c| c)
    }

    pub fn count(&self) -> usize {
        self.columns.iter().filter(|&&c| c).count()
    }
}

/// Residual and the requested Jacobian columns of one term.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorEvaluation {
    pub residual: Vector3<f64>,
    pub jacobians: [Option<Vector3<f64>>; NUM_PARAMETER_BLOCKS],
}

impl FactorEvaluation {
    pub fn residual_only(residual: Vector3<f64>) -> Self {
        Self {
            residual,
            jacobians: [None; NUM_PARAMETER_BLOCKS],
        }
    }

    pub fn jacobian(&self, slot: ParameterSlot) -> Option<&Vector3<f64>> {
        self.jacobians[slot.index()].as_ref()
    }

    /// Number of Jacobian columns present.
    pub fn num_columns(&self) -> usize {
        self.jacobians.iter().filter(|c| c.is_some()).count()
    }

    /// Dense 3×6 Jacobian with zero columns where nothing was computed.
    pub fn jacobian_matrix(&self) -> Matrix3x6<f64> {
        let mut matrix = Matrix3x6::zeros();
        for (index, column) in self.jacobians.iter().enumerate() {
            if let Some(column) = column {
                matrix.set_column(index, column);
            }
        }
        matrix
    }
}

/// Instrumentation hook counting residual and derivative evaluations.
///
/// Shared through an `Arc`; counts are relaxed atomics, so one counter can be attached to every
/// term of a problem.
#[derive(Debug, Default)]
pub struct EvaluationCounter {
    residual_evaluations: AtomicUsize,
    jacobian_columns: AtomicUsize,
}

impl EvaluationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_residual(&self) {
        self.residual_evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_jacobian_columns(&self, columns: usize) {
        self.jacobian_columns.fetch_add(columns, Ordering::Relaxed);
    }

    pub fn residual_evaluations(&self) -> usize {
        self.residual_evaluations.load(Ordering::Relaxed)
    }

    /// Total number of 3×1 derivative columns computed.
    pub fn jacobian_columns(&self) -> usize {
        self.jacobian_columns.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.residual_evaluations.store(0, Ordering::Relaxed);
        self.jacobian_columns.store(0, Ordering::Relaxed);
    }
}

/// Measured relative pose and its whitening factor, as read by the residual formula.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaMeasurement {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub sqrt_information: Matrix3<f64>,
}

impl From<&Constraint> for SpaMeasurement {
    fn from(constraint: &Constraint) -> Self {
        Self {
            x: constraint.measured.x(),
            y: constraint.measured.y(),
            theta: constraint.measured.angle(),
            sqrt_information: *constraint.sqrt_information(),
        }
    }
}

/// A residual term over six 1-scalar parameter blocks.
///
/// This is the seam between the SPA residual model and the solver: the solver hands in the
/// current parameter values and the columns it needs, and receives the residual and those
/// columns back.
pub trait CostFunction: Send + Sync {
    fn num_residuals(&self) -> usize {
        NUM_RESIDUALS
    }

    fn parameter_block_sizes(&self) -> [usize; NUM_PARAMETER_BLOCKS] {
        [1; NUM_PARAMETER_BLOCKS]
    }

    /// Evaluate the residual and the requested Jacobian columns.
    ///
    /// `parameters` is ordered as [`ParameterSlot::ALL`]. Columns not in `request` are `None`.
    fn evaluate(
        &self,
        parameters: &[f64; NUM_PARAMETER_BLOCKS],
        request: JacobianRequest,
    ) -> FactorEvaluation;

    /// Short label used in logs.
    fn name(&self) -> &'static str;
}
