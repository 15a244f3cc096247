use nalgebra::{Matrix3xX, Vector3};

use crate::core::corrector::Corrector;
use crate::core::loss_functions::Loss;
use crate::factors::{CostFunction, JacobianRequest, NUM_PARAMETER_BLOCKS, ParameterSlot};

/// Residual, cost and effective Jacobian columns of one block at the current parameters.
#[derive(Debug, Clone)]
pub struct BlockLinearization {
    /// Contribution `½ρ(‖r‖²)` (or `½‖r‖²` without a loss) to the total cost
    pub cost: f64,
    /// Residual after robust correction
    pub residual: Vector3<f64>,
    /// `(effective column, ∂r/∂parameter)` pairs, one per distinct free parameter
    pub columns: Vec<(usize, Vector3<f64>)>,
}

/// One SPA term bound to six scalar parameters of the flat store.
pub struct ResidualBlock {
    pub residual_block_id: usize,
    pub residual_row_start_idx: usize,
    /// Index into the flat parameter store for each [`ParameterSlot`]
    pub parameter_indices: [usize; NUM_PARAMETER_BLOCKS],
    pub factor: Box<dyn CostFunction>,
    pub loss_func: Option<Box<dyn Loss>>,
}

impl ResidualBlock {
    pub fn new(
        residual_block_id: usize,
        residual_row_start_idx: usize,
        parameter_indices: [usize; NUM_PARAMETER_BLOCKS],
        factor: Box<dyn CostFunction>,
        loss_func: Option<Box<dyn Loss>>,
    ) -> Self {
        ResidualBlock {
            residual_block_id,
            residual_row_start_idx,
            parameter_indices,
            factor,
            loss_func,
        }
    }

    fn gather(&self, parameters: &[f64]) -> [f64; NUM_PARAMETER_BLOCKS] {
        self.parameter_indices.map(|index| parameters[index])
    }

    fn robust_cost(&self, sq_norm: f64) -> f64 {
        match &self.loss_func {
            Some(loss) => 0.5 * loss.evaluate(sq_norm)[0],
            None => 0.5 * sq_norm,
        }
    }

    /// Cost of this block; no derivatives are requested from the factor.
    pub fn cost(&self, parameters: &[f64]) -> f64 {
        let evaluation = self
            .factor
            .evaluate(&self.gather(parameters), JacobianRequest::NONE);
        self.robust_cost(evaluation.residual.norm_squared())
    }

    /// Residual and Jacobian columns for the free parameters.
    ///
    /// `column_map[i]` is the effective column of flat parameter `i`, or `None` when it is held
    /// constant; constant parameters are not requested from the factor. If source and target share
    /// a parameter their columns are summed into one.
    pub fn residual_and_jacobian(
        &self,
        parameters: &[f64],
        column_map: &[Option<usize>],
    ) -> BlockLinearization {
        let request = JacobianRequest::from_flags(
            self.parameter_indices
                .map(|index| column_map[index].is_some()),
        );
        let evaluation = self.factor.evaluate(&self.gather(parameters), request);

        let mut residual = evaluation.residual;
        let sq_norm = residual.norm_squared();
        let cost = self.robust_cost(sq_norm);

        let slots: Vec<ParameterSlot> = ParameterSlot::ALL
            .into_iter()
            .filter(|&slot| evaluation.jacobian(slot).is_some())
            .collect();
        let mut jacobian = Matrix3xX::from_fn(slots.len(), |row, col| {
            evaluation.jacobians[slots[col].index()].map_or(0.0, |column| column[row])
        });

        if let Some(loss) = &self.loss_func {
            let corrector = Corrector::new(sq_norm, &loss.evaluate(sq_norm));
            if !slots.is_empty() {
                corrector.correct_jacobian(&residual, &mut jacobian);
            }
            corrector.correct_residuals(&mut residual);
        }

        let mut columns: Vec<(usize, Vector3<f64>)> = Vec::with_capacity(slots.len());
        for (local, slot) in slots.iter().enumerate() {
            let Some(effective) = column_map[self.parameter_indices[slot.index()]] else {
                continue;
            };
            let column = jacobian.column(local).into_owned();
            match columns.iter_mut().find(|(existing, _)| *existing == effective) {
                Some((_, merged)) => *merged += column,
                None => columns.push((effective, column)),
            }
        }

        BlockLinearization {
            cost,
            residual,
            columns,
        }
    }
}
