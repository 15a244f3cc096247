//! SPA term differentiated with forward-mode dual numbers.
//!
//! The residual formula is evaluated once per parameter with `Dual64` inputs, seeding that
//! parameter's derivative part with 1. This always produces all six columns whenever any column
//! is requested, which makes it the reference for the analytic strategy and the slower of the two.

use std::sync::Arc;

use nalgebra::Vector3;
use num_dual::Dual64;

use crate::core::pose::Constraint;
use crate::factors::spa_residual::spa_residual;
use crate::factors::{
    CostFunction, EvaluationCounter, FactorEvaluation, JacobianRequest, NUM_PARAMETER_BLOCKS,
    ParameterSlot, SpaMeasurement,
};

/// SPA residual term with automatic differentiation.
#[derive(Debug, Clone)]
pub struct AutoDiffSpaFactor {
    measurement: SpaMeasurement,
    counter: Option<Arc<EvaluationCounter>>,
}

impl AutoDiffSpaFactor {
    pub fn new(constraint: &Constraint) -> Self {
        Self {
            measurement: SpaMeasurement::from(constraint),
            counter: None,
        }
    }

    /// Attach an instrumentation counter.
    pub fn with_counter(mut self, counter: Arc<EvaluationCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn measurement(&self) -> &SpaMeasurement {
        &self.measurement
    }
}

impl CostFunction for AutoDiffSpaFactor {
    fn evaluate(
        &self,
        parameters: &[f64; NUM_PARAMETER_BLOCKS],
        request: JacobianRequest,
    ) -> FactorEvaluation {
        if let Some(counter) = &self.counter {
            counter.record_residual();
        }

        if request.is_empty() {
            let residual = spa_residual(&self.measurement, parameters);
            return FactorEvaluation::residual_only(Vector3::from(residual));
        }

        let mut residual = Vector3::zeros();
        let mut full = [Vector3::zeros(); NUM_PARAMETER_BLOCKS];
        for (seed, column) in full.iter_mut().enumerate() {
            let duals: [Dual64; NUM_PARAMETER_BLOCKS] = std::array::from_fn(|i| {
                Dual64::new(parameters[i], if i == seed { 1.0 } else { 0.0 })
            });
            let output = spa_residual(&self.measurement, &duals);
            if seed == 0 {
                residual = Vector3::new(output[0].re, output[1].re, output[2].re);
            }
            *column = Vector3::new(output[0].eps, output[1].eps, output[2].eps);
        }

        if let Some(counter) = &self.counter {
            counter.record_jacobian_columns(NUM_PARAMETER_BLOCKS);
        }

        let mut evaluation = FactorEvaluation::residual_only(residual);
        for (index, column) in full.into_iter().enumerate() {
            if request.contains(ParameterSlot::ALL[index]) {
                evaluation.jacobians[index] = Some(column);
            }
        }
        evaluation
    }

    fn name(&self) -> &'static str {
        "autodiff"
    }
}
