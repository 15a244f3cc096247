//! The SPA residual, written once for every number type.
//!
//! ```text
//! predicted.dx =  cosθs·(xt−xs) + sinθs·(yt−ys)
//! predicted.dy = −sinθs·(xt−xs) + cosθs·(yt−ys)
//! predicted.dθ =  θt − θs
//!
//! r = sqrt_information · [mx − predicted.dx, my − predicted.dy, normalize(mθ − predicted.dθ)]
//! ```
//!
//! The plain `f64` instantiation is the closed-form residual; the `Dual64` instantiation is what
//! the autodiff factor differentiates. Both go through [`residual_terms`], so the two strategies
//! minimize exactly the same objective.

use crate::core::pose::normalize_angle;
use crate::factors::{NUM_PARAMETER_BLOCKS, NUM_RESIDUALS, SpaMeasurement};
use num_dual::DualNum;

/// Intermediate quantities of one residual evaluation.
///
/// The analytic Jacobian reuses the trigonometric terms and translation deltas instead of
/// recomputing them.
#[derive(Debug, Clone)]
pub struct ResidualTerms<T> {
    pub cos_source: T,
    pub sin_source: T,
    pub delta_x: T,
    pub delta_y: T,
    /// Whitened residual `sqrt_information · raw`
    pub residual: [T; NUM_RESIDUALS],
}

/// Evaluate the residual and keep its intermediate terms.
///
/// `parameters` is ordered `[xs, ys, θs, xt, yt, θt]`.
pub fn residual_terms<T: DualNum<f64>>(
    measurement: &SpaMeasurement,
    parameters: &[T; NUM_PARAMETER_BLOCKS],
) -> ResidualTerms<T> {
    let [source_x, source_y, source_theta, target_x, target_y, target_theta] = parameters;

    let cos_source = source_theta.cos();
    let sin_source = source_theta.sin();
    let delta_x = target_x.clone() - source_x.clone();
    let delta_y = target_y.clone() - source_y.clone();

    let predicted_dx = cos_source.clone() * delta_x.clone() + sin_source.clone() * delta_y.clone();
    let predicted_dy = cos_source.clone() * delta_y.clone() - sin_source.clone() * delta_x.clone();
    let predicted_dtheta = target_theta.clone() - source_theta.clone();

    let raw = [
        T::from(measurement.x) - predicted_dx,
        T::from(measurement.y) - predicted_dy,
        normalize_angle(T::from(measurement.theta) - predicted_dtheta),
    ];

    let sqrt_info = &measurement.sqrt_information;
    let residual = std::array::from_fn(|row| {
        raw[0].clone() * sqrt_info[(row, 0)]
            + raw[1].clone() * sqrt_info[(row, 1)]
            + raw[2].clone() * sqrt_info[(row, 2)]
    });

    ResidualTerms {
        cos_source,
        sin_source,
        delta_x,
        delta_y,
        residual,
    }
}

/// Whitened SPA residual for any number type supporting `+ − ×`, `sin` and `cos`.
pub fn spa_residual<T: DualNum<f64>>(
    measurement: &SpaMeasurement,
    parameters: &[T; NUM_PARAMETER_BLOCKS],
) -> [T; NUM_RESIDUALS] {
    residual_terms(measurement, parameters).residual
}
