//! Levenberg-Marquardt algorithm implementation.
//!
//! Each iteration linearizes the problem over its effective (non-constant) parameters and solves
//! the damped normal equations
//!
//! ```text
//! (JᵀJ + λI) δ = −Jᵀr
//! ```
//!
//! with a sparse Cholesky factorization. The step is accepted when the actual cost reduction is a
//! non-negative fraction of the reduction predicted by the linear model; λ shrinks after good
//! steps and grows after rejected ones. A failed factorization is treated like a rejected step.
//!
//! Termination follows the usual three tests: relative cost change, step size relative to the
//! parameter norm, and gradient max-norm. Hitting the iteration limit, the timeout or the damping
//! bound ends the solve with `converged == false`.

use std::fmt;
use std::ops::Mul;
use std::time::{Duration, Instant};

use faer::Mat;
use tracing::{debug, info, warn};

use crate::core::problem::{Linearization, Problem};
use crate::error::SpaResult;
use crate::linalg::{LinearSolverType, create_linear_solver};
use crate::optimizer::{OptimizationStatus, OptimizerError, Solver, SolverSummary};

/// Configuration for [`LevenbergMarquardt`].
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtConfig {
    pub max_iterations: usize,
    /// Stop when `|Δcost| ≤ function_tolerance · cost`
    pub function_tolerance: f64,
    /// Stop when `max |Jᵀr| ≤ gradient_tolerance`
    pub gradient_tolerance: f64,
    /// Stop when `‖δ‖ ≤ parameter_tolerance · (‖x‖ + parameter_tolerance)`
    pub parameter_tolerance: f64,
    pub initial_damping: f64,
    pub damping_min: f64,
    pub damping_max: f64,
    pub damping_increase_factor: f64,
    pub damping_decrease_factor: f64,
    /// Step quality below which a step is rejected
    pub min_step_quality: f64,
    /// Step quality above which damping is decreased
    pub good_step_quality: f64,
    pub linear_solver_type: LinearSolverType,
    pub timeout: Option<Duration>,
    /// Relative eigenvalue threshold below which a converged `JᵀJ` counts as singular, `0` skips
    /// the check
    pub rank_tolerance: f64,
    /// Log the summary at INFO level when the solve ends
    pub verbose: bool,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            function_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-8,
            initial_damping: 1e-3,
            damping_min: 1e-12,
            damping_max: 1e12,
            damping_increase_factor: 10.0,
            damping_decrease_factor: 0.3,
            min_step_quality: 0.0,
            good_step_quality: 0.75,
            linear_solver_type: LinearSolverType::default(),
            timeout: None,
            rank_tolerance: 1e-12,
            verbose: false,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_function_tolerance(mut self, function_tolerance: f64) -> Self {
        self.function_tolerance = function_tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    /// Set the initial damping parameter.
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.initial_damping = damping;
        self
    }

    /// Set the damping parameter bounds.
    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    /// Set the damping adjustment factors.
    pub fn with_damping_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.damping_increase_factor = increase;
        self.damping_decrease_factor = decrease;
        self
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_rank_tolerance(mut self, rank_tolerance: f64) -> Self {
        self.rank_tolerance = rank_tolerance;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Check that the damping schedule can make progress.
    pub fn validate(&self) -> Result<(), OptimizerError> {
        if !(self.initial_damping > 0.0) || !(self.damping_min > 0.0) {
            return Err(OptimizerError::InvalidConfig(
                "damping must be positive".to_string(),
            ));
        }
        if self.damping_min > self.damping_max {
            return Err(OptimizerError::InvalidConfig(format!(
                "damping bounds [{:e}, {:e}] are empty",
                self.damping_min, self.damping_max
            )));
        }
        if !(self.damping_increase_factor > 1.0) {
            return Err(OptimizerError::InvalidConfig(
                "damping increase factor must exceed 1".to_string(),
            ));
        }
        if !(self.damping_decrease_factor > 0.0 && self.damping_decrease_factor < 1.0) {
            return Err(OptimizerError::InvalidConfig(
                "damping decrease factor must lie in (0, 1)".to_string(),
            ));
        }
        if !(self.rank_tolerance >= 0.0 && self.rank_tolerance < 1.0) {
            return Err(OptimizerError::InvalidConfig(
                "rank tolerance must lie in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for LevenbergMarquardtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LevenbergMarquardtConfig {{ max_iterations: {}, function_tolerance: {:e}, gradient_tolerance: {:e}, parameter_tolerance: {:e}, initial_damping: {:e}, linear_solver_type: {}, timeout: {:?}, verbose: {} }}",
            self.max_iterations,
            self.function_tolerance,
            self.gradient_tolerance,
            self.parameter_tolerance,
            self.initial_damping,
            self.linear_solver_type,
            self.timeout,
            self.verbose
        )
    }
}

/// Levenberg-Marquardt solver for nonlinear least squares optimization.
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
}

/// Counters carried through one solve.
#[derive(Debug, Default)]
struct SolveState {
    iterations: usize,
    successful_steps: usize,
    unsuccessful_steps: usize,
    cost_evaluations: usize,
    jacobian_evaluations: usize,
}

impl LevenbergMarquardt {
    /// Create a new Levenberg-Marquardt solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::default())
    }

    /// Create a new Levenberg-Marquardt solver with the given configuration.
    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    /// Returns the new damping, or `None` when it would exceed the upper bound.
    fn increase_damping(&self, damping: f64) -> Option<f64> {
        let next = damping * self.config.damping_increase_factor;
        (next <= self.config.damping_max).then_some(next)
    }

    fn decrease_damping(&self, damping: f64) -> f64 {
        (damping * self.config.damping_decrease_factor).max(self.config.damping_min)
    }

    /// Compute step quality ratio (actual vs predicted reduction)
    fn compute_step_quality(current_cost: f64, new_cost: f64, predicted_reduction: f64) -> f64 {
        let actual_reduction = current_cost - new_cost;
        if predicted_reduction.abs() < 1e-15 {
            if actual_reduction >= 0.0 { 1.0 } else { -1.0 }
        } else {
            actual_reduction / predicted_reduction
        }
    }

    /// Reduction of the linear model: `½‖r‖² − ½‖r + Jδ‖²`.
    fn compute_predicted_reduction(linearization: &Linearization, step: &Mat<f64>) -> f64 {
        let j_step = (&linearization.jacobian).mul(step);
        let mut reduction = 0.0;
        for i in 0..j_step.nrows() {
            let r = linearization.residuals[(i, 0)];
            let jd = j_step[(i, 0)];
            reduction -= r * jd + 0.5 * jd * jd;
        }
        reduction
    }

    /// Max-norm of the gradient `Jᵀr`.
    fn compute_gradient_norm(linearization: &Linearization) -> f64 {
        let gradient = linearization
            .jacobian
            .transpose()
            .mul(&linearization.residuals);
        (0..gradient.nrows())
            .map(|i| gradient[(i, 0)].abs())
            .fold(0.0, f64::max)
    }

    fn effective_norm(parameters: &[f64], effective: &[usize]) -> f64 {
        effective
            .iter()
            .map(|&index| parameters[index] * parameters[index])
            .sum::<f64>()
            .sqrt()
    }

    fn summary(
        &self,
        problem: &Problem,
        state: &SolveState,
        status: OptimizationStatus,
        initial_cost: f64,
        final_cost: f64,
        start: Instant,
    ) -> SolverSummary {
        let summary = SolverSummary {
            converged: status.is_converged(),
            status,
            total_time: start.elapsed(),
            iterations: state.iterations,
            successful_steps: state.successful_steps,
            unsuccessful_steps: state.unsuccessful_steps,
            num_residuals: problem.num_residuals(),
            num_parameters: problem.num_parameters(),
            num_effective_parameters: problem.num_effective_parameters(),
            initial_cost,
            final_cost,
            cost_evaluations: state.cost_evaluations,
            jacobian_evaluations: state.jacobian_evaluations,
        };
        if self.config.verbose {
            info!("\n{}", summary);
        } else {
            debug!(
                "Levenberg-Marquardt finished: {} after {} iterations, cost {:.6e} -> {:.6e}",
                summary.status, summary.iterations, initial_cost, final_cost
            );
        }
        summary
    }

    /// Minimize `problem`, updating `parameters` in place.
    pub fn minimize(&self, problem: &Problem, parameters: &mut [f64]) -> SpaResult<SolverSummary> {
        let start = Instant::now();
        self.config.validate()?;
        problem.check_parameters(parameters)?;

        let effective: Vec<usize> = problem
            .column_map()
            .iter()
            .enumerate()
            .filter_map(|(index, column)| column.map(|_| index))
            .collect();

        let mut state = SolveState::default();
        let mut linear_solver = create_linear_solver(self.config.linear_solver_type);

        let mut linearization = problem.linearize(parameters)?;
        state.cost_evaluations += 1;
        state.jacobian_evaluations += 1;
        let initial_cost = linearization.cost;
        let mut current_cost = initial_cost;

        if !initial_cost.is_finite() {
            warn!("Initial cost is not finite: {}", initial_cost);
            let status = OptimizationStatus::NumericalFailure;
            return Ok(self.summary(problem, &state, status, initial_cost, current_cost, start));
        }
        if effective.is_empty() {
            let status = OptimizationStatus::GradientToleranceReached;
            return Ok(self.summary(problem, &state, status, initial_cost, current_cost, start));
        }

        let mut damping = self.config.initial_damping;
        debug!(
            "Starting Levenberg-Marquardt: {} residuals, {} effective parameters, initial cost {:.6e}, damping {:.6e}",
            problem.num_residuals(),
            effective.len(),
            initial_cost,
            damping
        );

        let status = loop {
            let gradient_norm = Self::compute_gradient_norm(&linearization);
            if gradient_norm <= self.config.gradient_tolerance {
                break OptimizationStatus::GradientToleranceReached;
            }
            if state.iterations >= self.config.max_iterations {
                break OptimizationStatus::MaxIterationsReached;
            }
            if let Some(timeout) = self.config.timeout
                && start.elapsed() >= timeout
            {
                break OptimizationStatus::Timeout;
            }
            state.iterations += 1;

            let step = match linear_solver.solve_augmented_equation(
                &linearization.residuals,
                &linearization.jacobian,
                damping,
            ) {
                Ok(step) => step,
                Err(e) => {
                    warn!("Linear solver failed at damping {:.3e}: {}", damping, e);
                    state.unsuccessful_steps += 1;
                    match self.increase_damping(damping) {
                        Some(next) => {
                            damping = next;
                            continue;
                        }
                        None => break OptimizationStatus::NumericalFailure,
                    }
                }
            };

            let step_norm = step.norm_l2();
            let parameter_norm = Self::effective_norm(parameters, &effective);
            if step_norm
                <= self.config.parameter_tolerance * (parameter_norm + self.config.parameter_tolerance)
            {
                break OptimizationStatus::ParameterToleranceReached;
            }

            let mut candidate = parameters.to_vec();
            for (column, &index) in effective.iter().enumerate() {
                candidate[index] += step[(column, 0)];
            }
            let new_cost = problem.cost(&candidate)?;
            state.cost_evaluations += 1;

            let predicted_reduction = Self::compute_predicted_reduction(&linearization, &step);
            let rho = Self::compute_step_quality(current_cost, new_cost, predicted_reduction);

            if new_cost.is_finite() && rho >= self.config.min_step_quality {
                let cost_change = current_cost - new_cost;
                debug!(
                    "Iteration {}: cost = {:.6e}, reduction = {:.6e}, damping = {:.6e}, step_norm = {:.6e}, rho = {:.3} [ACCEPTED]",
                    state.iterations, new_cost, cost_change, damping, step_norm, rho
                );

                parameters.copy_from_slice(&candidate);
                state.successful_steps += 1;
                if rho > self.config.good_step_quality {
                    damping = self.decrease_damping(damping);
                }

                let previous_cost = current_cost;
                linearization = problem.linearize(parameters)?;
                state.cost_evaluations += 1;
                state.jacobian_evaluations += 1;
                current_cost = linearization.cost;

                if cost_change.abs() <= self.config.function_tolerance * previous_cost {
                    break OptimizationStatus::FunctionToleranceReached;
                }
            } else {
                debug!(
                    "Iteration {}: cost = {:.6e}, damping = {:.6e}, step_norm = {:.6e}, rho = {:.3} [REJECTED]",
                    state.iterations, current_cost, damping, step_norm, rho
                );
                state.unsuccessful_steps += 1;
                match self.increase_damping(damping) {
                    Some(next) => damping = next,
                    None => break OptimizationStatus::NumericalFailure,
                }
            }
        };

        let status = if status.is_converged() && self.config.rank_tolerance > 0.0 {
            match linear_solver.has_null_space(&linearization.jacobian, self.config.rank_tolerance)
            {
                Ok(true) => {
                    warn!(
                        "{} but JᵀJ is singular: the problem is not fully constrained",
                        status
                    );
                    OptimizationStatus::RankDeficient
                }
                Ok(false) => status,
                Err(e) => {
                    warn!("Rank check failed: {}", e);
                    status
                }
            }
        } else {
            status
        };

        Ok(self.summary(problem, &state, status, initial_cost, current_cost, start))
    }
}

impl Solver for LevenbergMarquardt {
    fn solve(&mut self, problem: &Problem, parameters: &mut [f64]) -> SpaResult<SolverSummary> {
        self.minimize(problem, parameters)
    }
}
