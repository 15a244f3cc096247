//! Nonlinear least-squares problem over a flat scalar parameter store.
//!
//! A [`Problem`] owns residual blocks that address parameters by index, plus a per-parameter
//! constant flag. Constant parameters are removed from the linear system: the remaining
//! ("effective") parameters are numbered in store order and become the Jacobian columns.

use std::fmt;

use faer::Mat;
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DMatrix;

use crate::core::loss_functions::Loss;
use crate::core::residual_block::ResidualBlock;
use crate::error::{SpaError, SpaResult};
use crate::factors::{CostFunction, NUM_PARAMETER_BLOCKS, NUM_RESIDUALS};
use crate::optimizer::OptimizerError;

/// Residuals and sparse Jacobian of the whole problem at one parameter vector.
#[derive(Debug, Clone)]
pub struct Linearization {
    /// Total cost `½ Σ ρ(‖rᵢ‖²)`
    pub cost: f64,
    /// Stacked (robust-corrected) residuals, one column
    pub residuals: Mat<f64>,
    /// `num_residuals × num_effective_parameters`
    pub jacobian: SparseColMat<usize, f64>,
}

impl Linearization {
    /// Dense copy of the Jacobian, for inspecting rank and null space on small problems.
    pub fn dense_jacobian(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.jacobian.nrows(), self.jacobian.ncols());
        let symbolic = self.jacobian.symbolic();
        for col in 0..self.jacobian.ncols() {
            let row_indices = symbolic.row_idx_of_col_raw(col);
            let col_values = self.jacobian.val_of_col(col);
            for (idx, &row) in row_indices.iter().enumerate() {
                dense[(row, col)] += col_values[idx];
            }
        }
        dense
    }

    /// Dense Gauss-Newton matrix `JᵀJ`.
    pub fn dense_normal_matrix(&self) -> DMatrix<f64> {
        let jacobian = self.dense_jacobian();
        jacobian.transpose() * jacobian
    }
}

pub struct Problem {
    num_parameters: usize,
    residual_blocks: Vec<ResidualBlock>,
    constant: Vec<bool>,
}

impl fmt::Debug for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Problem")
            .field("num_parameters", &self.num_parameters)
            .field("num_residual_blocks", &self.residual_blocks.len())
            .field("num_effective_parameters", &self.num_effective_parameters())
            .finish()
    }
}

impl Problem {
    /// Empty problem over a parameter store of `num_parameters` scalars.
    pub fn new(num_parameters: usize) -> Self {
        Self {
            num_parameters,
            residual_blocks: Vec::new(),
            constant: vec![false; num_parameters],
        }
    }

    /// Register a residual term reading the six given scalar parameters.
    pub fn add_residual_block(
        &mut self,
        parameter_indices: [usize; NUM_PARAMETER_BLOCKS],
        factor: Box<dyn CostFunction>,
        loss_func: Option<Box<dyn Loss>>,
    ) -> SpaResult<usize> {
        if let Some(&index) = parameter_indices
            .iter()
            .find(|&&index| index >= self.num_parameters)
        {
            return Err(SpaError::InvalidInput(format!(
                "parameter index {index} out of range for {} parameters",
                self.num_parameters
            )));
        }

        let block_id = self.residual_blocks.len();
        self.residual_blocks.push(ResidualBlock::new(
            block_id,
            block_id * NUM_RESIDUALS,
            parameter_indices,
            factor,
            loss_func,
        ));
        Ok(block_id)
    }

    /// Hold one scalar parameter at its current value.
    pub fn set_parameter_constant(&mut self, index: usize) -> SpaResult<()> {
        let flag = self.constant.get_mut(index).ok_or_else(|| {
            SpaError::InvalidInput(format!("parameter index {index} out of range"))
        })?;
        *flag = true;
        Ok(())
    }

    pub fn set_parameter_variable(&mut self, index: usize) -> SpaResult<()> {
        let flag = self.constant.get_mut(index).ok_or_else(|| {
            SpaError::InvalidInput(format!("parameter index {index} out of range"))
        })?;
        *flag = false;
        Ok(())
    }

    pub fn is_parameter_constant(&self, index: usize) -> bool {
        self.constant.get(index).copied().unwrap_or(false)
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    pub fn num_residuals(&self) -> usize {
        self.residual_blocks.len() * NUM_RESIDUALS
    }

    pub fn num_parameters(&self) -> usize {
        self.num_parameters
    }

    /// Number of parameters the solver actually moves.
    pub fn num_effective_parameters(&self) -> usize {
        self.constant.iter().filter(|&&c| !c).count()
    }

    pub fn residual_blocks(&self) -> &[ResidualBlock] {
        &self.residual_blocks
    }

    /// Effective column of every parameter, `None` for constant ones.
    pub fn column_map(&self) -> Vec<Option<usize>> {
        let mut next = 0;
        self.constant
            .iter()
            .map(|&constant| {
                if constant {
                    None
                } else {
                    next += 1;
                    Some(next - 1)
                }
            })
            .collect()
    }

    /// Reject a parameter slice that does not match the store this problem was built for.
    pub fn check_parameters(&self, parameters: &[f64]) -> Result<(), OptimizerError> {
        if parameters.len() != self.num_parameters {
            return Err(OptimizerError::ParameterDimensionMismatch {
                expected: self.num_parameters,
                actual: parameters.len(),
            });
        }
        Ok(())
    }

    /// Total cost without derivatives.
    pub fn cost(&self, parameters: &[f64]) -> SpaResult<f64> {
        self.check_parameters(parameters)?;
        Ok(self
            .residual_blocks
            .iter()
            .map(|block| block.cost(parameters))
            .sum())
    }

    /// Evaluate residuals and the sparse Jacobian over the effective parameters.
    ///
    /// The sparsity pattern only depends on which parameters are constant, so repeated calls on
    /// one problem produce the same structure.
    pub fn linearize(&self, parameters: &[f64]) -> SpaResult<Linearization> {
        self.check_parameters(parameters)?;

        let column_map = self.column_map();
        let num_effective = self.num_effective_parameters();
        let num_residuals = self.num_residuals();

        let mut cost = 0.0;
        let mut residuals = Mat::zeros(num_residuals, 1);
        let mut triplets = Vec::with_capacity(self.residual_blocks.len() * 18);

        for block in &self.residual_blocks {
            let linearization = block.residual_and_jacobian(parameters, &column_map);
            cost += linearization.cost;

            let start = block.residual_row_start_idx;
            for row in 0..NUM_RESIDUALS {
                residuals[(start + row, 0)] = linearization.residual[row];
            }
            for (col, column) in &linearization.columns {
                for row in 0..NUM_RESIDUALS {
                    triplets.push(Triplet::new(start + row, *col, column[row]));
                }
            }
        }

        let jacobian = SparseColMat::try_new_from_triplets(num_residuals, num_effective, &triplets)
            .map_err(|e| SpaError::LinearAlgebra(format!("Failed to assemble Jacobian: {e:?}")))?;

        Ok(Linearization {
            cost,
            residuals,
            jacobian,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pose::{Constraint, Pose};
    use crate::factors::AnalyticSpaFactor;

    fn chain_problem() -> (Problem, Vec<f64>) {
        // three nodes, two unit steps along x
        let mut problem = Problem::new(9);
        let step = Constraint::with_identity_information(0, 1, Pose::new(1.0, 0.0, 0.0));
        problem
            .add_residual_block(
                [0, 1, 2, 3, 4, 5],
                Box::new(AnalyticSpaFactor::new(&step)),
                None,
            )
            .unwrap();
        problem
            .add_residual_block(
                [3, 4, 5, 6, 7, 8],
                Box::new(AnalyticSpaFactor::new(&step)),
                None,
            )
            .unwrap();
        let params = vec![0.0, 0.0, 0.0, 1.2, 0.1, 0.0, 2.0, -0.1, 0.05];
        (problem, params)
    }

    #[test]
    fn test_counts() {
        let (mut problem, _) = chain_problem();
        assert_eq!(problem.num_residual_blocks(), 2);
        assert_eq!(problem.num_residuals(), 6);
        assert_eq!(problem.num_parameters(), 9);
        assert_eq!(problem.num_effective_parameters(), 9);

        for index in 0..3 {
            problem.set_parameter_constant(index).unwrap();
        }
        assert_eq!(problem.num_effective_parameters(), 6);
        assert_eq!(problem.column_map()[3], Some(0));
        assert!(problem.column_map()[..3].iter().all(Option::is_none));

        problem.set_parameter_variable(0).unwrap();
        assert_eq!(problem.column_map()[0], Some(0));
        assert!(problem.set_parameter_constant(9).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_indices() {
        let mut problem = Problem::new(3);
        let constraint = Constraint::with_identity_information(0, 1, Pose::identity());
        let result = problem.add_residual_block(
            [0, 1, 2, 3, 4, 5],
            Box::new(AnalyticSpaFactor::new(&constraint)),
            None,
        );
        assert!(matches!(result, Err(SpaError::InvalidInput(_))));
    }

    #[test]
    fn test_rejects_wrong_parameter_length() {
        let (problem, params) = chain_problem();
        assert!(problem.cost(&params[..6]).is_err());
        assert!(problem.linearize(&params[..6]).is_err());
    }

    #[test]
    fn test_linearize_matches_cost() {
        let (mut problem, params) = chain_problem();
        for index in 0..3 {
            problem.set_parameter_constant(index).unwrap();
        }

        let linearization = problem.linearize(&params).unwrap();
        let cost = problem.cost(&params).unwrap();
        assert!((linearization.cost - cost).abs() < 1e-15);

        let mut sq_norm = 0.0;
        for row in 0..linearization.residuals.nrows() {
            sq_norm += linearization.residuals[(row, 0)].powi(2);
        }
        assert!((0.5 * sq_norm - cost).abs() < 1e-15);

        let jacobian = linearization.dense_jacobian();
        assert_eq!(jacobian.nrows(), 6);
        assert_eq!(jacobian.ncols(), 6);
        // first block depends on node 1 only once node 0 is fixed
        assert_eq!(jacobian[(2, 2)], -1.0);
    }

    #[test]
    fn test_normal_matrix_full_rank_with_fixed_node() {
        let (mut problem, params) = chain_problem();
        let free = problem.linearize(&params).unwrap();
        assert_eq!(free.dense_normal_matrix().rank(1e-9), 6);

        for index in 0..3 {
            problem.set_parameter_constant(index).unwrap();
        }
        let fixed = problem.linearize(&params).unwrap();
        assert_eq!(fixed.dense_normal_matrix().rank(1e-9), 6);
        assert_eq!(fixed.dense_normal_matrix().ncols(), 6);
    }
}
