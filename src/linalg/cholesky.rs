use std::ops::Mul;

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::sparse::{SparseColMat, Triplet};
use faer::{Mat, Side};
use tracing::debug;

use crate::linalg::{LinAlgError, LinAlgResult, SparseLinearSolver};

/// Inverse iteration steps used by the rank check.
const INVERSE_ITERATIONS: usize = 3;

/// Sparse Cholesky solver for the normal equations.
///
/// The symbolic factorization depends only on the sparsity pattern of `JᵀJ + λI`, which is fixed
/// for a given problem, so it is computed on the first solve and reused afterwards. A change of
/// dimension or non-zero count triggers a fresh analysis.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    symbolic_pattern: Option<SymbolicLlt<usize>>,
    pattern_key: Option<(usize, usize)>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        SparseCholeskySolver {
            symbolic_pattern: None,
            pattern_key: None,
        }
    }

    /// Whether a symbolic factorization is cached.
    pub fn has_symbolic_pattern(&self) -> bool {
        self.symbolic_pattern.is_some()
    }

    /// `H = JᵀJ` and `g = −Jᵀr`.
    fn normal_system(
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<(SparseColMat<usize, f64>, Mat<f64>)> {
        if residuals.nrows() != jacobian.nrows() {
            return Err(LinAlgError::InvalidInput(format!(
                "{} residuals for a Jacobian with {} rows",
                residuals.nrows(),
                jacobian.nrows()
            )));
        }

        let hessian = Self::normal_matrix(jacobian)?;
        let gradient = jacobian.transpose().mul(residuals);

        let mut neg_gradient = Mat::zeros(gradient.nrows(), 1);
        for i in 0..gradient.nrows() {
            neg_gradient[(i, 0)] = -gradient[(i, 0)];
        }
        Ok((hessian, neg_gradient))
    }

    /// `H = JᵀJ`.
    fn normal_matrix(
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<SparseColMat<usize, f64>> {
        let jt = jacobian
            .transpose()
            .to_col_major()
            .map_err(|e| LinAlgError::InvalidInput(format!("Transpose failed: {:?}", e)))?;
        Ok(jt.mul(jacobian))
    }

    /// Diagonal of a square sparse matrix, zero where no entry is stored.
    fn diagonal(matrix: &SparseColMat<usize, f64>) -> Vec<f64> {
        let symbolic = matrix.symbolic();
        (0..matrix.ncols())
            .map(|col| {
                symbolic
                    .row_idx_of_col_raw(col)
                    .iter()
                    .zip(matrix.val_of_col(col))
                    .filter(|(row, _)| **row == col)
                    .map(|(_, value)| *value)
                    .sum()
            })
            .collect()
    }

    /// Rebuild `H` with `lambda` added to every diagonal entry.
    fn add_damping(
        hessian: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<SparseColMat<usize, f64>> {
        let n = hessian.ncols();
        let symbolic = hessian.symbolic();
        let mut has_diagonal = vec![false; n];
        let mut triplets = Vec::with_capacity(symbolic.compute_nnz() + n);

        for col in 0..n {
            let row_indices = symbolic.row_idx_of_col_raw(col);
            let col_values = hessian.val_of_col(col);
            for (idx, &row) in row_indices.iter().enumerate() {
                if row == col {
                    has_diagonal[col] = true;
                    triplets.push(Triplet::new(row, col, col_values[idx] + lambda));
                } else {
                    triplets.push(Triplet::new(row, col, col_values[idx]));
                }
            }
        }
        for (i, present) in has_diagonal.iter().enumerate() {
            if !present {
                triplets.push(Triplet::new(i, i, lambda));
            }
        }

        SparseColMat::try_new_from_triplets(n, n, &triplets)
            .map_err(|e| LinAlgError::InvalidInput(format!("Damped Hessian: {:?}", e)))
    }

    /// Factorize the symmetric positive definite `a` and solve `a x = b`.
    pub fn solve_system(
        &mut self,
        a: &SparseColMat<usize, f64>,
        b: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let key = (a.ncols(), a.symbolic().compute_nnz());
        if self.pattern_key != Some(key) {
            self.symbolic_pattern = None;
        }

        let sym = match &self.symbolic_pattern {
            Some(sym) => sym.clone(),
            None => {
                let sym = SymbolicLlt::try_new(a.symbolic(), Side::Lower).map_err(|e| {
                    LinAlgError::FactorizationFailed(format!("Symbolic Cholesky failed: {:?}", e))
                })?;
                debug!("Symbolic Cholesky analysis for {} x {} system", key.0, key.0);
                self.symbolic_pattern = Some(sym.clone());
                self.pattern_key = Some(key);
                sym
            }
        };

        let cholesky = Llt::try_new_with_symbolic(sym, a.as_ref(), Side::Lower).map_err(|e| {
            LinAlgError::SingularMatrix(format!("Numeric Cholesky failed: {:?}", e))
        })?;
        Ok(cholesky.solve(b))
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, neg_gradient) = Self::normal_system(residuals, jacobian)?;
        self.solve_system(&hessian, &neg_gradient)
    }

    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, neg_gradient) = Self::normal_system(residuals, jacobian)?;
        let augmented = Self::add_damping(&hessian, lambda)?;
        self.solve_system(&augmented, &neg_gradient)
    }

    /// Inverse iteration on `JᵀJ + μI` with `μ = tolerance · max diag(JᵀJ)`.
    ///
    /// The Rayleigh quotient `‖Jv‖²` of the converged unit vector bounds the smallest eigenvalue
    /// of `JᵀJ` from above, so a quotient below `μ` means a (near) null direction. A column of
    /// `J` that is entirely zero is reported without factorizing.
    fn has_null_space(
        &mut self,
        jacobian: &SparseColMat<usize, f64>,
        tolerance: f64,
    ) -> LinAlgResult<bool> {
        let n = jacobian.ncols();
        if n == 0 {
            return Ok(false);
        }

        let hessian = Self::normal_matrix(jacobian)?;
        let diagonal = Self::diagonal(&hessian);
        if diagonal.iter().any(|&d| !(d > 0.0)) {
            return Ok(true);
        }
        let shift = tolerance * diagonal.iter().copied().fold(0.0, f64::max);
        let shifted = Self::add_damping(&hessian, shift)?;

        let mut v = Mat::from_fn(n, 1, |i, _| 1.0 + (i % 7) as f64 / 7.0);
        for _ in 0..INVERSE_ITERATIONS {
            v = match self.solve_system(&shifted, &v) {
                Ok(x) => x,
                Err(LinAlgError::SingularMatrix(_)) => return Ok(true),
                Err(e) => return Err(e),
            };
            let norm = v.norm_l2();
            if !(norm.is_finite() && norm > 0.0) {
                return Ok(true);
            }
            for i in 0..n {
                v[(i, 0)] /= norm;
            }
        }

        let jv = jacobian.mul(&v);
        let rayleigh: f64 = (0..jv.nrows()).map(|i| jv[(i, 0)] * jv[(i, 0)]).sum();
        debug!(
            "Smallest eigenvalue estimate of JᵀJ: {:.3e} (threshold {:.3e})",
            rayleigh, shift
        );
        Ok(rayleigh <= shift)
    }
}
