//! Robust loss functions for outlier rejection in pose-graph optimization.
//!
//! In standard least squares the cost of a residual block is `½‖r‖²`. With a robust loss ρ the
//! cost becomes `½ρ(‖r‖²)`, which limits how much a single bad constraint (a wrong loop closure,
//! say) can pull on the solution.
//!
//! Each loss implements [`Loss`], which evaluates `[ρ(s), ρ'(s), ρ''(s)]` at the squared residual
//! norm `s`. The solver applies them through the [`Corrector`](crate::core::corrector::Corrector).
//!
//! # Example
//!
//! ```
//! use spa2d::core::loss_functions::{HuberLoss, Loss};
//!
//! let huber = HuberLoss::new(1.0).unwrap();
//!
//! let [rho, rho_prime, _] = huber.evaluate(0.5);
//! assert_eq!(rho, 0.5);
//! assert_eq!(rho_prime, 1.0);
//!
//! let [rho, rho_prime, _] = huber.evaluate(4.0);
//! assert_eq!(rho, 3.0);        // 2δ√s − δ²
//! assert_eq!(rho_prime, 0.5);  // δ / √s
//! ```

use crate::error::{SpaError, SpaResult};

/// Trait for robust loss functions.
///
/// `evaluate` returns `[ρ(s), ρ'(s), ρ''(s)]` for a squared residual norm `s ≥ 0`.
/// Implementations satisfy ρ(0) = 0 and ρ'(0) = 1 so they behave like plain least squares near
/// zero.
pub trait Loss: Send + Sync {
    fn evaluate(&self, s: f64) -> [f64; 3];
}

/// Huber loss: quadratic for inliers, linear for outliers.
///
/// ```text
/// ρ(s) = s               if s ≤ δ²
///        2δ√s − δ²       if s > δ²
/// ```
#[derive(Debug, Clone)]
pub struct HuberLoss {
    /// Scale parameter δ
    scale: f64,
    /// Cached δ²
    scale2: f64,
}

impl HuberLoss {
    /// Create a Huber loss with threshold `scale` (must be positive).
    pub fn new(scale: f64) -> SpaResult<Self> {
        if !(scale > 0.0) {
            return Err(SpaError::InvalidInput(
                "scale needs to be larger than zero".to_string(),
            ));
        }
        Ok(HuberLoss {
            scale,
            scale2: scale * scale,
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Loss for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            // Outlier region: linear in ‖r‖
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN_POSITIVE);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Cauchy loss: `ρ(s) = δ² · ln(1 + s/δ²)`.
///
/// Suppresses large residuals more strongly than Huber but is non-convex.
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    scale2: f64,
    /// Cached 1/δ²
    c: f64,
}

impl CauchyLoss {
    /// Create a Cauchy loss with scale `scale` (must be positive).
    pub fn new(scale: f64) -> SpaResult<Self> {
        if !(scale > 0.0) {
            return Err(SpaError::InvalidInput(
                "scale needs to be larger than zero".to_string(),
            ));
        }
        let scale2 = scale * scale;
        Ok(CauchyLoss {
            scale2,
            c: 1.0 / scale2,
        })
    }
}

impl Loss for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let inv = 1.0 / sum;
        [
            self.scale2 * (s * self.c).ln_1p(),
            inv.max(f64::MIN_POSITIVE),
            -self.c * (inv * inv),
        ]
    }
}
