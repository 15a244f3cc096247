//! SE(2) pose and relative-pose constraint value types.
//!
//! A [`Pose`] is a rigid placement in the plane: a translation `(x, y)` and a heading angle
//! `θ` in radians. Angles are not normalized on construction; everything that compares angles
//! works modulo 2π through [`normalize_angle`].
//!
//! A [`Constraint`] is an edge of the pose graph: "`target` is observed at `measured` relative to
//! `source`, with confidence `information`". The upper-triangular square root of the information
//! matrix is derived once when the constraint is built.

use crate::error::{SpaError, SpaResult};
use nalgebra::{Matrix3, Rotation2, Vector2};
use num_dual::DualNum;
use std::f64::consts::{PI, TAU};
use std::fmt;

/// Identifier of a node in the pose graph.
pub type NodeId = u32;

/// Map an angle into `(−π, π]`.
///
/// Generic over [`DualNum`] so the same code runs on plain `f64` and on dual numbers; only the
/// real part is reduced, the derivative part is carried through unchanged. The reduction is a
/// single exact remainder, so arbitrarily large finite angles are handled in constant time.
/// A non-finite angle is returned as is.
pub fn normalize_angle<T: DualNum<f64>>(angle: T) -> T {
    let mut angle = angle;
    let re = angle.re();
    if !re.is_finite() {
        return angle;
    }
    // `%` on f64 is exact, the remainder lies in (−2π, 2π)
    let reduced = re % TAU;
    angle -= re;
    angle += reduced;
    if reduced > PI {
        angle -= TAU;
    } else if reduced <= -PI {
        angle += TAU;
    }
    angle
}

/// Rigid-body placement in 2D.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Translation `(x, y)`
    pub translation: Vector2<f64>,
    /// Heading angle in radians
    pub rotation: f64,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose(translation: [{:.4}, {:.4}], rotation: {:.4})",
            self.translation.x, self.translation.y, self.rotation
        )
    }
}

impl Pose {
    /// Create a pose from its three scalar parameters.
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self {
            translation: Vector2::new(x, y),
            rotation: theta,
        }
    }

    /// The identity placement at the origin.
    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn x(&self) -> f64 {
        self.translation.x
    }

    pub fn y(&self) -> f64 {
        self.translation.y
    }

    pub fn angle(&self) -> f64 {
        self.rotation
    }

    /// The pose as a parameter triple `[x, y, θ]`.
    pub fn to_array(&self) -> [f64; 3] {
        [self.translation.x, self.translation.y, self.rotation]
    }

    /// Build a pose from a parameter triple `[x, y, θ]`.
    pub fn from_slice(values: &[f64]) -> SpaResult<Self> {
        match values {
            [x, y, theta] => Ok(Self::new(*x, *y, *theta)),
            _ => Err(SpaError::InvalidInput(format!(
                "a pose needs exactly 3 parameters, got {}",
                values.len()
            ))),
        }
    }

    /// SE(2) composition `self ⊕ other`: apply `other` expressed in the frame of `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        let rotated = Rotation2::new(self.rotation) * other.translation;
        Pose {
            translation: self.translation + rotated,
            rotation: normalize_angle(self.rotation + other.rotation),
        }
    }

    /// SE(2) inverse.
    pub fn inverse(&self) -> Pose {
        let translation = -(Rotation2::new(-self.rotation) * self.translation);
        Pose {
            translation,
            rotation: normalize_angle(-self.rotation),
        }
    }

    /// Relative pose of `other` seen from the frame of `self`, i.e. `self⁻¹ ⊕ other`.
    pub fn between(&self, other: &Pose) -> Pose {
        self.inverse().compose(other)
    }

    /// True when translations agree within `tolerance` and angles agree modulo 2π.
    pub fn approx_eq(&self, other: &Pose, tolerance: f64) -> bool {
        (self.translation - other.translation).amax() <= tolerance
            && normalize_angle(self.rotation - other.rotation).abs() <= tolerance
    }
}

/// Relative-pose measurement between two nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    /// Node the measurement is taken from
    pub source: NodeId,
    /// Node being observed
    pub target: NodeId,
    /// Measured placement of `target` in the frame of `source`
    pub measured: Pose,
    information: Matrix3<f64>,
    sqrt_information: Matrix3<f64>,
}

impl Constraint {
    /// Create a constraint, factoring the information matrix.
    ///
    /// # Errors
    ///
    /// [`SpaError::Configuration`] when `information` is not finite, not symmetric, or not
    /// positive definite.
    pub fn new(
        source: NodeId,
        target: NodeId,
        measured: Pose,
        information: Matrix3<f64>,
    ) -> SpaResult<Self> {
        if information.iter().any(|v| !v.is_finite()) {
            return Err(SpaError::Configuration(format!(
                "information matrix of constraint {source}->{target} has non-finite entries"
            )));
        }
        let scale = information.amax().max(1.0);
        if (information - information.transpose()).amax() > 1e-9 * scale {
            return Err(SpaError::Configuration(format!(
                "information matrix of constraint {source}->{target} is not symmetric"
            )));
        }
        let cholesky = information.cholesky().ok_or_else(|| {
            SpaError::Configuration(format!(
                "information matrix of constraint {source}->{target} is not positive definite"
            ))
        })?;
        // L·Lᵀ = information, so U = Lᵀ satisfies Uᵀ·U = information.
        let sqrt_information = cholesky.l().transpose();

        Ok(Self {
            source,
            target,
            measured,
            information,
            sqrt_information,
        })
    }

    /// Create a constraint with unit information.
    pub fn with_identity_information(source: NodeId, target: NodeId, measured: Pose) -> Self {
        Self {
            source,
            target,
            measured,
            information: Matrix3::identity(),
            sqrt_information: Matrix3::identity(),
        }
    }

    pub fn information(&self) -> &Matrix3<f64> {
        &self.information
    }

    /// Upper-triangular factor `U` with `Uᵀ·U = information`.
    pub fn sqrt_information(&self) -> &Matrix3<f64> {
        &self.sqrt_information
    }
}
