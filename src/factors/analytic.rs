//! SPA term with hand-derived Jacobians.
//!
//! With `c = cos θs`, `s = sin θs`, `dx = xt − xs`, `dy = yt − ys` and `SI` the square-root
//! information matrix, every column is `SI · raw` with:
//!
//! ```text
//! ∂r/∂xs : [ c,  −s,  0]          ∂r/∂xt : −∂r/∂xs  = [−c,  s,  0]
//! ∂r/∂ys : [ s,   c,  0]          ∂r/∂yt : −∂r/∂ys  = [−s, −c,  0]
//! ∂r/∂θs : [ s·dx − c·dy,  c·dx + s·dy,  1 ]
//! ∂r/∂θt : [ 0,   0, −1]
//! ```
//!
//! Translation columns of source and target are exact negatives of each other, so a target
//! column is derived from the source column when that one was requested too. The rotation
//! columns are not: `∂r/∂θs` carries the derivative of the rotated delta, `∂r/∂θt` does not.
//!
//! Only requested columns are computed.

use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};

use crate::core::pose::Constraint;
use crate::factors::spa_residual::residual_terms;
use crate::factors::{
    CostFunction, EvaluationCounter, FactorEvaluation, JacobianRequest, NUM_PARAMETER_BLOCKS,
    ParameterSlot, SpaMeasurement,
};

/// SPA residual term with analytic Jacobians.
#[derive(Debug, Clone)]
pub struct AnalyticSpaFactor {
    measurement: SpaMeasurement,
    counter: Option<Arc<EvaluationCounter>>,
}

impl AnalyticSpaFactor {
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

/// Target translation column: negate the source column when it exists, otherwise compute it.
fn mirrored_column(
    source: Option<&Vector3<f64>>,
    compute: impl FnOnce() -> Vector3<f64>,
) -> Vector3<f64> {
    match source {
        Some(column) => -column,
        None => compute(),
    }
}

fn weighted(sqrt_info: &Matrix3<f64>, raw: Vector3<f64>) -> Vector3<f64> {
    sqrt_info * raw
}

impl CostFunction for AnalyticSpaFactor {
    fn evaluate(
        &self,
        parameters: &[f64; NUM_PARAMETER_BLOCKS],
        request: JacobianRequest,
    ) -> FactorEvaluation {
        if let Some(counter) = &self.counter {
            counter.record_residual();
        }

        let terms = residual_terms(&self.measurement, parameters);
        let mut evaluation = FactorEvaluation::residual_only(Vector3::from(terms.residual));
        if request.is_empty() {
            return evaluation;
        }

        let sqrt_info = &self.measurement.sqrt_information;
        let (c, s) = (terms.cos_source, terms.sin_source);
        let (dx, dy) = (terms.delta_x, terms.delta_y);

        let source_x = request
            .contains(ParameterSlot::SourceX)
            .then(|| weighted(sqrt_info, Vector3::new(c, -s, 0.0)));
        let source_y = request
            .contains(ParameterSlot::SourceY)
            .then(|| weighted(sqrt_info, Vector3::new(s, c, 0.0)));
        let source_theta = request.contains(ParameterSlot::SourceTheta).then(|| {
            let u02 = s * dx - c * dy;
            let u12 = c * dx + s * dy;
            weighted(sqrt_info, Vector3::new(u02, u12, 1.0))
        });
        let target_x = request.contains(ParameterSlot::TargetX).then(|| {
            mirrored_column(source_x.as_ref(), || {
                weighted(sqrt_info, Vector3::new(-c, s, 0.0))
            })
        });
        let target_y = request.contains(ParameterSlot::TargetY).then(|| {
            mirrored_column(source_y.as_ref(), || {
                weighted(sqrt_info, Vector3::new(-s, -c, 0.0))
            })
        });
        let target_theta = request
            .contains(ParameterSlot::TargetTheta)
            .then(|| -sqrt_info.column(2).into_owned());

        evaluation.jacobians = [
            source_x,
            source_y,
            source_theta,
            target_x,
            target_y,
            target_theta,
        ];

        if let Some(counter) = &self.counter {
            counter.record_jacobian_columns(evaluation.num_columns());
        }
        evaluation
    }

    fn name(&self) -> &'static str {
        "analytic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pose::Pose;
    use crate::factors::AutoDiffSpaFactor;
    use crate::factors::spa_residual::spa_residual;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const FD_EPSILON: f64 = 1e-6;
    const RELATIVE_TOLERANCE: f64 = 1e-6;

    fn random_information(rng: &mut StdRng) -> Matrix3<f64> {
        // AᵀA + I is symmetric positive definite
        let a = Matrix3::from_fn(|_, _| rng.gen_range(-1.0..1.0));
        a.transpose() * a + Matrix3::identity()
    }

    fn random_constraint(rng: &mut StdRng) -> Constraint {
        let measured = Pose::new(
            rng.gen_range(-5.0..5.0),
            rng.gen_range(-5.0..5.0),
            rng.gen_range(-1.0..1.0),
        );
        Constraint::new(0, 1, measured, random_information(rng)).unwrap()
    }

    fn random_parameters(rng: &mut StdRng) -> [f64; 6] {
        [
            rng.gen_range(-10.0..10.0),
            rng.gen_range(-10.0..10.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-10.0..10.0),
            rng.gen_range(-10.0..10.0),
            rng.gen_range(-1.0..1.0),
        ]
    }

    /// Central-difference derivative of the closed-form residual.
    fn numeric_column(measurement: &SpaMeasurement, params: &[f64; 6], index: usize) -> Vector3<f64> {
        let mut plus = *params;
        let mut minus = *params;
        plus[index] += FD_EPSILON;
        minus[index] -= FD_EPSILON;
        let r_plus = Vector3::from(spa_residual(measurement, &plus));
        let r_minus = Vector3::from(spa_residual(measurement, &minus));
        (r_plus - r_minus) / (2.0 * FD_EPSILON)
    }

    fn assert_columns_close(actual: &Vector3<f64>, expected: &Vector3<f64>, what: &str) {
        for row in 0..3 {
            let scale = expected[row].abs().max(1.0);
            assert!(
                (actual[row] - expected[row]).abs() <= RELATIVE_TOLERANCE * scale,
                "{what} row {row}: {} vs {}",
                actual[row],
                expected[row]
            );
        }
    }

    #[test]
    fn test_analytic_matches_numeric_jacobian() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let constraint = random_constraint(&mut rng);
            let factor = AnalyticSpaFactor::new(&constraint);
            let params = random_parameters(&mut rng);

            let evaluation = factor.evaluate(&params, JacobianRequest::ALL);
            for slot in ParameterSlot::ALL {
                let analytic = evaluation.jacobian(slot).unwrap();
                let numeric = numeric_column(factor.measurement(), &params, slot.index());
                assert_columns_close(analytic, &numeric, &slot.to_string());
            }
        }
    }

    #[test]
    fn test_analytic_matches_autodiff() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let constraint = random_constraint(&mut rng);
            let analytic = AnalyticSpaFactor::new(&constraint);
            let autodiff = AutoDiffSpaFactor::new(&constraint);
            let params = random_parameters(&mut rng);

            let a = analytic.evaluate(&params, JacobianRequest::ALL);
            let b = autodiff.evaluate(&params, JacobianRequest::ALL);
            assert!((a.residual - b.residual).amax() < 1e-12);
            assert!((a.jacobian_matrix() - b.jacobian_matrix()).amax() < 1e-10);
        }
    }

    #[test]
    fn test_upper_triangular_weighting_source_y_row_two() {
        // a full upper-triangular factor makes SI(2,1) and SI(2,2) differ, so mixing them up
        // in the source-y column shows up here
        let information = Matrix3::new(2.0, 0.4, 0.3, 0.4, 3.0, 0.7, 0.3, 0.7, 5.0);
        let constraint = Constraint::new(0, 1, Pose::new(1.0, 2.0, 0.3), information).unwrap();
        let factor = AnalyticSpaFactor::new(&constraint);
        let params = [0.5, -0.5, 0.8, 2.0, 1.0, 0.4];

        let evaluation = factor.evaluate(&params, JacobianRequest::ALL);
        for slot in ParameterSlot::ALL {
            let numeric = numeric_column(factor.measurement(), &params, slot.index());
            assert_columns_close(evaluation.jacobian(slot).unwrap(), &numeric, &slot.to_string());
        }
    }

    #[test]
    fn test_rotation_columns_are_not_negatives() {
        let constraint = Constraint::with_identity_information(0, 1, Pose::new(1.0, 0.0, 0.0));
        let factor = AnalyticSpaFactor::new(&constraint);
        let params = [0.0, 0.0, 0.3, 2.0, 1.0, 0.5];

        let evaluation = factor.evaluate(&params, JacobianRequest::ALL);
        let source_theta = evaluation.jacobian(ParameterSlot::SourceTheta).unwrap();
        let target_theta = evaluation.jacobian(ParameterSlot::TargetTheta).unwrap();

        assert_eq!(*target_theta, Vector3::new(0.0, 0.0, -1.0));
        assert_eq!(source_theta[2], 1.0);
        assert!((source_theta + target_theta).amax() > 0.5);

        let c = 0.3_f64.cos();
        let s = 0.3_f64.sin();
        assert!((source_theta[0] - (s * 2.0 - c * 1.0)).abs() < 1e-15);
        assert!((source_theta[1] - (c * 2.0 + s * 1.0)).abs() < 1e-15);
    }

    #[test]
    fn test_target_columns_without_source_columns() {
        let mut rng = StdRng::seed_from_u64(3);
        let constraint = random_constraint(&mut rng);
        let factor = AnalyticSpaFactor::new(&constraint);
        let params = random_parameters(&mut rng);

        let mirrored = factor.evaluate(&params, JacobianRequest::ALL);
        let direct = factor.evaluate(
            &params,
            JacobianRequest::only(&[ParameterSlot::TargetX, ParameterSlot::TargetY]),
        );

        assert_eq!(direct.num_columns(), 2);
        for slot in [ParameterSlot::TargetX, ParameterSlot::TargetY] {
            let a = mirrored.jacobian(slot).unwrap();
            let b = direct.jacobian(slot).unwrap();
            assert!((a - b).amax() < 1e-14, "{slot}");
        }
        assert!(direct.jacobian(ParameterSlot::SourceX).is_none());
    }

    #[test]
    fn test_residual_only_request_skips_derivatives() {
        let counter = Arc::new(EvaluationCounter::new());
        let constraint = Constraint::with_identity_information(0, 1, Pose::new(1.0, 1.0, 0.2));
        let factor = AnalyticSpaFactor::new(&constraint).with_counter(counter.clone());
        let params = [0.0, 0.0, 0.0, 1.0, 1.0, 0.2];

        let evaluation = factor.evaluate(&params, JacobianRequest::NONE);
        assert_eq!(evaluation.num_columns(), 0);
        assert!(evaluation.residual.amax() < 1e-15);
        assert_eq!(counter.residual_evaluations(), 1);
        assert_eq!(counter.jacobian_columns(), 0);
    }

    #[test]
    fn test_selective_request_counts_only_requested_columns() {
        let counter = Arc::new(EvaluationCounter::new());
        let constraint = Constraint::with_identity_information(0, 1, Pose::new(1.0, 1.0, 0.2));
        let factor = AnalyticSpaFactor::new(&constraint).with_counter(counter.clone());
        let params = [0.0, 0.0, 0.0, 1.0, 1.0, 0.2];

        let request = JacobianRequest::only(&[ParameterSlot::SourceTheta, ParameterSlot::TargetY]);
        let evaluation = factor.evaluate(&params, request);
        for slot in ParameterSlot::ALL {
            assert_eq!(evaluation.jacobian(slot).is_some(), request.contains(slot));
        }
        assert_eq!(counter.jacobian_columns(), 2);
    }
}
