//! Triggs correction of residuals and Jacobians for robust losses.
//!
//! Given a residual block `r` with Jacobian `J` and a loss ρ evaluated at `s = ‖r‖²`, the
//! corrector rescales `r` and `J` so that the Gauss-Newton model of the rescaled block matches
//! the second-order model of `½ρ(‖r‖²)`:
//!
//! ```text
//! r̃ = √ρ' / (1 − α) · r
//! J̃ = √ρ' · (J − α/‖r‖² · r·(rᵀJ))
//! ```
//!
//! with `α` the root of `½α² − α − (ρ''/ρ')‖r‖² = 0`. When `ρ'' ≤ 0` (Huber, Cauchy) or the
//! residual is zero, `α = 0` and the correction is a plain `√ρ'` scaling.

use nalgebra::{Matrix3xX, Vector3};

#[derive(Debug, Clone, Copy)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    /// Build the corrector for squared norm `sq_norm` and loss values `rho = [ρ, ρ', ρ'']`.
    pub fn new(sq_norm: f64, rho: &[f64; 3]) -> Self {
        let sqrt_rho1 = rho[1].sqrt();

        if sq_norm == 0.0 || rho[2] <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        let d = 1.0 + 2.0 * sq_norm * rho[2] / rho[1];
        let alpha = 1.0 - d.sqrt();
        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    pub fn correct_residuals(&self, residual: &mut Vector3<f64>) {
        *residual *= self.residual_scaling;
    }

    /// Correct the Jacobian columns of one residual block; must run before `correct_residuals`.
    pub fn correct_jacobian(&self, residual: &Vector3<f64>, jacobian: &mut Matrix3xX<f64>) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }
        let r_t_j = residual.transpose() * &*jacobian;
        let correction = residual * r_t_j * self.alpha_sq_norm;
        *jacobian -= correction;
        *jacobian *= self.sqrt_rho1;
    }
}
