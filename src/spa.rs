//! One-call sparse pose adjustment: build the problem from a graph, solve it, report.

use tracing::info;

use crate::builder::{JacobianStrategy, ProblemBuilder, ProblemBuilderConfig};
use crate::core::graph::PoseGraph;
use crate::error::SpaResult;
use crate::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig, Solver, SolverSummary};

/// Configuration for [`SpaOptimizer`].
#[derive(Debug, Clone, Default)]
pub struct SpaOptimizerConfig {
    pub builder: ProblemBuilderConfig,
    pub solver: LevenbergMarquardtConfig,
    /// Report the solve summary at INFO level
    pub verbose: bool,
    /// Log every optimized pose at INFO level
    pub log_poses: bool,
}

impl SpaOptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builder(mut self, builder: ProblemBuilderConfig) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_solver(mut self, solver: LevenbergMarquardtConfig) -> Self {
        self.solver = solver;
        self
    }

    /// Shortcut for the builder's Jacobian strategy.
    pub fn with_strategy(mut self, strategy: JacobianStrategy) -> Self {
        self.builder.strategy = strategy;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_log_poses(mut self, log_poses: bool) -> Self {
        self.log_poses = log_poses;
        self
    }
}

/// Optimizes a [`PoseGraph`] in place.
///
/// # Example
///
/// ```
/// use spa2d::core::graph::PoseGraph;
/// use spa2d::core::pose::{Constraint, Pose};
/// use spa2d::spa::{SpaOptimizer, SpaOptimizerConfig};
///
/// let mut graph = PoseGraph::new();
/// graph.add_node(0, Pose::identity()).unwrap();
/// graph.add_node(1, Pose::new(0.8, 0.3, 0.1)).unwrap();
/// graph.add_constraint(Constraint::with_identity_information(0, 1, Pose::new(1.0, 0.0, 0.0)));
///
/// let summary = SpaOptimizer::new(SpaOptimizerConfig::default())
///     .optimize(&mut graph)
///     .unwrap();
/// assert!(summary.converged);
/// assert!(graph.pose(1).unwrap().approx_eq(&Pose::new(1.0, 0.0, 0.0), 1e-6));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SpaOptimizer {
    config: SpaOptimizerConfig,
}

impl SpaOptimizer {
    pub fn new(config: SpaOptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SpaOptimizerConfig {
        &self.config
    }

    /// Build, solve and write the optimized poses back into `graph`.
    ///
    /// Configuration problems are errors; a solve that does not converge is not, check
    /// [`SolverSummary::converged`].
    pub fn optimize(&self, graph: &mut PoseGraph) -> SpaResult<SolverSummary> {
        let problem = ProblemBuilder::new(self.config.builder.clone()).build(graph)?;
        let mut solver = LevenbergMarquardt::with_config(self.config.solver.clone());
        let summary = solver.solve(&problem, graph.parameters_mut())?;

        if self.config.verbose {
            info!("used {} cost", self.config.builder.strategy);
            info!("total time: {:?}", summary.total_time);
            info!("num residuals: {}", summary.num_residuals);
            info!("num parameters: {}", summary.num_parameters);
            info!(
                "num effective parameters: {}",
                summary.num_effective_parameters
            );
            info!("num successful steps: {}", summary.successful_steps);
            info!(
                "initial/final costs: {:.6e}, {:.6e}",
                summary.initial_cost, summary.final_cost
            );
        }

        if self.config.log_poses {
            for (id, pose) in graph.poses() {
                info!("Pose {} is {}, {}, {}", id, pose.x(), pose.y(), pose.angle());
            }
        }

        Ok(summary)
    }
}
